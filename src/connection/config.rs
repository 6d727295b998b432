//! Connection management configuration types.

use std::time::Duration;

use crate::command::{DEFAULT_MAX_FRAME_SIZE, PROTOCOL_VERSION};

/// Exponential backoff parameters for reconnection attempts.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay after the first failure.
    pub initial: Duration,
    /// Maximum delay.
    pub max: Duration,
    /// Multiplier for each further failure.
    pub multiplier: f64,
    /// Deadline, measured from the first failure of an episode, that a
    /// retry must not overshoot.
    pub mandatory_stop: Option<Duration>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(60),
            multiplier: 2.0,
            mandatory_stop: None,
        }
    }
}

impl BackoffConfig {
    /// Create a backoff doubling from `initial` up to `max`.
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            ..Default::default()
        }
    }

    /// Set the multiplier.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Set the mandatory stop.
    pub fn with_mandatory_stop(mut self, stop: Duration) -> Self {
        self.mandatory_stop = Some(stop);
        self
    }
}

/// Keep-alive configuration.
#[derive(Debug, Clone)]
pub struct KeepAliveConfig {
    /// Interval between pings. A ping still unanswered when the next one is
    /// due breaks the connection.
    pub interval: Duration,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
        }
    }
}

/// Per-connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Timeout for the dial and, separately, for the handshake.
    pub connect_timeout: Duration,
    /// Keep-alive configuration.
    pub keep_alive: Option<KeepAliveConfig>,
    /// Client version string sent in `Connect`.
    pub client_version: String,
    /// Protocol version sent in `Connect`.
    pub protocol_version: u32,
    /// Largest accepted frame body.
    pub max_frame_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            keep_alive: Some(KeepAliveConfig::default()),
            client_version: concat!("brokerpool-rs/", env!("CARGO_PKG_VERSION")).to_string(),
            protocol_version: PROTOCOL_VERSION,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl ConnectionConfig {
    /// Set the connection timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the keep-alive configuration.
    pub fn with_keep_alive(mut self, config: KeepAliveConfig) -> Self {
        self.keep_alive = Some(config);
        self
    }

    /// Disable keep-alive.
    pub fn without_keep_alive(mut self) -> Self {
        self.keep_alive = None;
        self
    }

    /// Set the client version string.
    pub fn with_client_version(mut self, version: impl Into<String>) -> Self {
        self.client_version = version.into();
        self
    }

    /// Set the maximum frame size.
    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }
}

/// Connection pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Share connections per logical address. When disabled every request
    /// gets a private connection.
    pub pool_connections: bool,
    /// Number of connections kept per logical address.
    pub connections_per_broker: usize,
    /// Number of I/O threads when the pool creates its own executors.
    pub io_threads: usize,
    /// Backoff tracking per logical address.
    pub backoff: BackoffConfig,
    /// Configuration for new connections.
    pub connection_config: ConnectionConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_connections: true,
            connections_per_broker: 1,
            io_threads: 1,
            backoff: BackoffConfig::default(),
            connection_config: ConnectionConfig::default(),
        }
    }
}

impl PoolConfig {
    /// Enable or disable connection sharing.
    pub fn with_pooling(mut self, enabled: bool) -> Self {
        self.pool_connections = enabled;
        self
    }

    /// Set the number of connections per logical address.
    pub fn with_connections_per_broker(mut self, count: usize) -> Self {
        self.connections_per_broker = count.max(1);
        self
    }

    /// Set the number of I/O threads.
    pub fn with_io_threads(mut self, threads: usize) -> Self {
        self.io_threads = threads.max(1);
        self
    }

    /// Set the backoff configuration.
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set the connection configuration.
    pub fn with_connection_config(mut self, config: ConnectionConfig) -> Self {
        self.connection_config = config;
        self
    }
}

/// Configuration of a reconnecting [`Handler`](crate::handler::Handler).
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    /// Backoff between reconnection attempts.
    pub backoff: BackoffConfig,
    /// Time after which retryable failures are reported as timeouts.
    pub operation_timeout: Duration,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig::default(),
            operation_timeout: Duration::from_secs(30),
        }
    }
}

impl HandlerConfig {
    /// Set the backoff configuration.
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set the operation timeout.
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }
}
