//! Connection pooling and connection lifecycle for a pub/sub broker client.
//!
//! Producers and consumers of a client talk to brokers over long-lived
//! connections. This crate owns those connections:
//!
//! - [`ConnectionPool`] hands out at most one live connection per logical
//!   broker address, shared by every caller routed there
//! - [`Connection`] dials, performs the `Connect`/`Connected` handshake,
//!   keeps the session alive and tells attached producers and consumers
//!   when it breaks
//! - [`Handler`] keeps one producer or consumer attached, reconnecting with
//!   exponential backoff
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use brokerpool::{AuthDisabled, ConnectionPool, PoolConfig};
//!
//! # async fn run() -> brokerpool::Result<()> {
//! let pool = ConnectionPool::create(
//!     PoolConfig::default().with_io_threads(2),
//!     Arc::new(AuthDisabled),
//! )?;
//!
//! let cnx = pool.get("pulsar://localhost:6650").await?;
//! assert!(cnx.upgrade().is_some());
//! # Ok(())
//! # }
//! ```
//!
//! # Wire format
//!
//! Every frame is a 4-byte big-endian length followed by the command body:
//!
//! ```text
//! +--------+--------+--------+--------+
//! |          Frame length             |  (4 bytes)
//! +--------+--------+--------+--------+
//! |  Type  |  Command fields ...      |  (variable)
//! +--------+--------+--------+--------+
//! ```

pub mod auth;
pub mod codec;
pub mod command;
pub mod connection;
pub mod error;
pub mod executor;
pub mod future;
pub mod handler;
pub mod resolver;

// Re-export commonly used types at the crate root
pub use auth::{AuthData, AuthDisabled, AuthToken, Authentication};
pub use command::{Command, CommandType, PROTOCOL_VERSION};
pub use connection::{
    AttachmentKind, BackoffConfig, Connection, ConnectionConfig, ConnectionListener,
    ConnectionPool, ConnectionState, ConnectionWeakRef, PoolConfig, ReconnectionBackoff,
};
pub use error::{Error, Result};
pub use executor::{DeadlineTimer, Executor, ExecutorProvider};
pub use future::{AsyncResult, Promise};
pub use handler::{Handler, HandlerCallbacks, HandlerState};
pub use resolver::{AddressResolver, ServiceNameResolver, ServiceUri, StaticAddress};
