//! Dialing physical broker addresses.

use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// A bidirectional byte stream a connection runs over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// A boxed [`AsyncStream`].
pub type BoxedStream = Box<dyn AsyncStream>;

/// Future returned by [`Dialer::dial`].
pub type DialFuture<'a> = Pin<Box<dyn Future<Output = io::Result<BoxedStream>> + Send + 'a>>;

/// Opens byte streams to `host:port` targets.
pub trait Dialer: Send + Sync + fmt::Debug {
    /// Connect to `target`.
    fn dial<'a>(&'a self, target: &'a str) -> DialFuture<'a>;
}

/// Plain TCP dialer.
#[derive(Debug, Clone)]
pub struct TcpDialer {
    nodelay: bool,
}

impl TcpDialer {
    /// Create a TCP dialer with `TCP_NODELAY` set.
    pub fn new() -> Self {
        Self { nodelay: true }
    }

    /// Enable or disable `TCP_NODELAY`.
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self::new()
    }
}

impl Dialer for TcpDialer {
    fn dial<'a>(&'a self, target: &'a str) -> DialFuture<'a> {
        Box::pin(async move {
            let stream = TcpStream::connect(target).await?;
            stream.set_nodelay(self.nodelay)?;
            Ok(Box::new(stream) as BoxedStream)
        })
    }
}
