//! Service URL parsing and physical address resolution.
//!
//! A service URL names one or more endpoints behind a single scheme:
//!
//! ```text
//! pulsar://broker-1:6650,broker-2:6650,broker-3/tenant
//! ```
//!
//! [`ServiceNameResolver`] cycles through those endpoints so that each new
//! connection attempt lands on the next one.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::debug;

use crate::error::{Error, Result};

/// Supplies the physical address to dial for an indirect service name.
pub trait AddressResolver: Send + Sync {
    /// Pick the next address to connect to.
    fn resolve_host(&self) -> String;
}

/// Always resolves to the same address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticAddress(pub String);

impl AddressResolver for StaticAddress {
    fn resolve_host(&self) -> String {
        self.0.clone()
    }
}

/// A parsed service URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceUri {
    scheme: String,
    hosts: Vec<String>,
    path: Option<String>,
}

impl ServiceUri {
    /// Parse a `scheme://host[:port][,host[:port]...][/path]` URL.
    pub fn parse(url: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidServiceUrl(format!("{url}: {reason}"));

        let (scheme, rest) = url.split_once("://").ok_or_else(|| invalid("missing scheme"))?;
        if scheme.is_empty() {
            return Err(invalid("missing scheme"));
        }
        let scheme = scheme.to_ascii_lowercase();

        let (authority, path) = match rest.split_once('/') {
            Some((authority, path)) if !path.is_empty() => (authority, Some(format!("/{path}"))),
            Some((authority, _)) => (authority, None),
            None => (rest, None),
        };

        let hosts = authority
            .split(',')
            .map(str::trim)
            .filter(|host| !host.is_empty())
            .map(|host| normalize_host(&scheme, host).ok_or_else(|| invalid(host)))
            .collect::<Result<Vec<_>>>()?;
        if hosts.is_empty() {
            return Err(invalid("no hosts"));
        }

        Ok(Self {
            scheme,
            hosts,
            path,
        })
    }

    /// The URL scheme, lower-cased.
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// The `host:port` endpoints, in declaration order.
    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    /// The path component, if any.
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Whether the scheme implies TLS.
    pub fn use_tls(&self) -> bool {
        self.scheme.ends_with("+ssl") || self.scheme == "https"
    }
}

impl fmt::Display for ServiceUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.hosts.join(","))?;
        if let Some(path) = &self.path {
            f.write_str(path)?;
        }
        Ok(())
    }
}

fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        "pulsar" => Some(6650),
        "pulsar+ssl" => Some(6651),
        "http" => Some(80),
        "https" => Some(443),
        _ => None,
    }
}

fn normalize_host(scheme: &str, host: &str) -> Option<String> {
    // Bracketed IPv6 literals carry colons of their own.
    let port_sep = if host.starts_with('[') {
        host.find(']').and_then(|end| host[end..].find(':').map(|i| end + i))
    } else {
        host.rfind(':')
    };

    match port_sep {
        Some(sep) => {
            let (name, port) = (&host[..sep], &host[sep + 1..]);
            if name.is_empty() || port.parse::<u16>().is_err() {
                return None;
            }
            Some(host.to_string())
        }
        None => default_port(scheme).map(|port| format!("{host}:{port}")),
    }
}

/// Strip a `scheme://` prefix, leaving a `host:port` dial target.
pub fn socket_target(address: &str) -> &str {
    let without_scheme = address
        .split_once("://")
        .map_or(address, |(_, rest)| rest);
    without_scheme.trim_end_matches('/')
}

/// Round-robin resolver over the hosts of a service URL.
#[derive(Clone)]
pub struct ServiceNameResolver {
    uri: Arc<RwLock<ServiceUri>>,
    index: Arc<AtomicUsize>,
}

impl ServiceNameResolver {
    /// Create a resolver for the given service URL.
    pub fn new(url: &str) -> Result<Self> {
        Ok(Self {
            uri: Arc::new(RwLock::new(ServiceUri::parse(url)?)),
            index: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// The service URL currently in use.
    pub fn service_url(&self) -> String {
        self.uri
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .to_string()
    }

    /// The parsed service URL currently in use.
    pub fn service_uri(&self) -> ServiceUri {
        self.uri
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the service URL; the round-robin position restarts.
    pub fn update_service_url(&self, url: &str) -> Result<()> {
        let uri = ServiceUri::parse(url)?;
        debug!(url, "updating service URL");
        *self.uri.write().unwrap_or_else(PoisonError::into_inner) = uri;
        self.index.store(0, Ordering::Release);
        Ok(())
    }
}

impl AddressResolver for ServiceNameResolver {
    fn resolve_host(&self) -> String {
        let uri = self.uri.read().unwrap_or_else(PoisonError::into_inner);
        let index = self.index.fetch_add(1, Ordering::Relaxed) % uri.hosts.len();
        format!("{}://{}", uri.scheme, uri.hosts[index])
    }
}

impl fmt::Debug for ServiceNameResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceNameResolver")
            .field("service_url", &self.service_url())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_multiple_hosts() {
        let uri = ServiceUri::parse("pulsar://a:6650,b:6651,c/tenant/ns").unwrap();
        assert_eq!(uri.scheme(), "pulsar");
        assert_eq!(uri.hosts(), ["a:6650", "b:6651", "c:6650"]);
        assert_eq!(uri.path(), Some("/tenant/ns"));
        assert!(!uri.use_tls());
        assert_eq!(uri.to_string(), "pulsar://a:6650,b:6651,c:6650/tenant/ns");
    }

    #[test]
    fn test_parse_tls_and_ipv6() {
        let uri = ServiceUri::parse("pulsar+ssl://[::1]:6651").unwrap();
        assert!(uri.use_tls());
        assert_eq!(uri.hosts(), ["[::1]:6651"]);

        let uri = ServiceUri::parse("pulsar+ssl://[::1]").unwrap();
        assert_eq!(uri.hosts(), ["[::1]:6651"]);
    }

    #[test]
    fn test_parse_invalid() {
        assert!(matches!(
            ServiceUri::parse("broker:6650"),
            Err(Error::InvalidServiceUrl(_))
        ));
        assert!(ServiceUri::parse("pulsar://").is_err());
        assert!(ServiceUri::parse("pulsar://a:notaport").is_err());
        assert!(ServiceUri::parse("custom://host").is_err());
        assert!(ServiceUri::parse("custom://host:9000").is_ok());
    }

    #[test]
    fn test_resolver_round_robin() {
        let resolver = ServiceNameResolver::new("pulsar://a:1,b:2").unwrap();
        assert_eq!(resolver.resolve_host(), "pulsar://a:1");
        assert_eq!(resolver.resolve_host(), "pulsar://b:2");
        assert_eq!(resolver.resolve_host(), "pulsar://a:1");

        resolver.update_service_url("pulsar://c:3").unwrap();
        assert_eq!(resolver.resolve_host(), "pulsar://c:3");
        assert!(resolver.update_service_url("nope").is_err());
        assert_eq!(resolver.service_url(), "pulsar://c:3");
    }

    #[test]
    fn test_socket_target() {
        assert_eq!(socket_target("pulsar://broker-1:6650"), "broker-1:6650");
        assert_eq!(socket_target("pulsar://broker-1:6650/"), "broker-1:6650");
        assert_eq!(socket_target("broker-1:6650"), "broker-1:6650");
    }
}
