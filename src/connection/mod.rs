//! Connection management for broker clients.
//!
//! This module provides:
//! - A pool sharing one connection per logical broker address
//! - The connection lifecycle: dial, handshake, keep-alive, broken fan-out
//! - Reconnection backoff and configuration
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use brokerpool::auth::AuthDisabled;
//! use brokerpool::connection::{ConnectionPool, PoolConfig};
//! use brokerpool::executor::ExecutorProvider;
//!
//! # async fn run() -> brokerpool::Result<()> {
//! let executors = Arc::new(ExecutorProvider::new(1)?);
//! let pool = ConnectionPool::new(PoolConfig::default(), executors, Arc::new(AuthDisabled));
//!
//! // Logical broker reached through a proxy.
//! let cnx = pool
//!     .get_connection("pulsar://broker-1:6650", "pulsar://proxy:6650")
//!     .await?;
//! if let Some(cnx) = cnx.upgrade() {
//!     println!("connected: {cnx}");
//! }
//!
//! pool.close();
//! # Ok(())
//! # }
//! ```

mod backoff;
mod cnx;
mod config;
mod pool;
mod state;
mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use backoff::ReconnectionBackoff;
pub use cnx::{AttachmentKind, Connection, ConnectionListener, ConnectionWeakRef};
pub use config::{BackoffConfig, ConnectionConfig, HandlerConfig, KeepAliveConfig, PoolConfig};
pub use pool::ConnectionPool;
pub use state::{ConnectionState, ConnectionStats};
pub use transport::{AsyncStream, BoxedStream, DialFuture, Dialer, TcpDialer};
