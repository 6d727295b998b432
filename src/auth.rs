//! Credential providers consulted during the connection handshake.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::{Error, Result};

/// Credentials sent in the `Connect` command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthData {
    /// Name of the authentication method.
    pub method: String,
    /// Opaque credential bytes.
    pub data: Bytes,
}

impl AuthData {
    /// Create credentials for the given method.
    pub fn new(method: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            method: method.into(),
            data: data.into(),
        }
    }
}

/// An opaque credential provider.
pub trait Authentication: Send + Sync + fmt::Debug {
    /// Name of the authentication method.
    fn method_name(&self) -> &str;

    /// Produce the credentials for one handshake.
    fn get_auth_data(&self) -> Result<AuthData>;
}

/// No authentication.
#[derive(Debug, Clone, Copy, Default)]
pub struct AuthDisabled;

impl Authentication for AuthDisabled {
    fn method_name(&self) -> &str {
        "none"
    }

    fn get_auth_data(&self) -> Result<AuthData> {
        Ok(AuthData::new("none", Bytes::new()))
    }
}

type TokenSupplier = dyn Fn() -> Result<String> + Send + Sync;

/// Token authentication; the supplier runs on every handshake so rotated
/// tokens are picked up by new connections.
#[derive(Clone)]
pub struct AuthToken {
    supplier: Arc<TokenSupplier>,
}

impl AuthToken {
    /// Authenticate with a fixed token.
    pub fn from_token(token: impl Into<String>) -> Self {
        let token = token.into();
        Self::from_supplier(move || Ok(token.clone()))
    }

    /// Authenticate with a token produced on demand.
    pub fn from_supplier<F>(supplier: F) -> Self
    where
        F: Fn() -> Result<String> + Send + Sync + 'static,
    {
        Self {
            supplier: Arc::new(supplier),
        }
    }
}

impl Authentication for AuthToken {
    fn method_name(&self) -> &str {
        "token"
    }

    fn get_auth_data(&self) -> Result<AuthData> {
        let token = (self.supplier)().map_err(|e| Error::Authentication(e.to_string()))?;
        if token.is_empty() {
            return Err(Error::Authentication("empty token".into()));
        }
        Ok(AuthData::new(self.method_name(), token.into_bytes()))
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthToken").finish_non_exhaustive()
    }
}
