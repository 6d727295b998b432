//! A single logical session with one broker endpoint.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at, timeout};
use tracing::{debug, info, trace, warn};

use crate::auth::Authentication;
use crate::codec::{read_frame, write_frame};
use crate::command::Command;
use crate::error::{Error, Result};
use crate::executor::Executor;
use crate::future::{AsyncResult, Promise};
use crate::resolver::socket_target;

use super::backoff::ReconnectionBackoff;
use super::config::ConnectionConfig;
use super::pool::PoolShared;
use super::state::{ConnectionState, ConnectionStats};
use super::transport::{BoxedStream, Dialer};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Non-owning handle to a pooled connection.
pub type ConnectionWeakRef = Weak<Connection>;

/// Receives the broken notification of a connection it is attached to.
pub trait ConnectionListener: Send + Sync {
    /// The connection transitioned to broken.
    fn connection_closed(&self, cnx: &Arc<Connection>, reason: &Error);
}

/// Which registry an attachment lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttachmentKind {
    /// A producer routed through the connection.
    Producer,
    /// A consumer routed through the connection.
    Consumer,
}

/// Everything the pool hands a new connection.
pub(crate) struct ConnectionParams {
    pub pool_key: String,
    pub logical_address: String,
    pub physical_address: String,
    pub config: ConnectionConfig,
    pub executor: Arc<Executor>,
    pub auth: Arc<dyn Authentication>,
    pub dialer: Arc<dyn Dialer>,
    pub backoff: Arc<Mutex<ReconnectionBackoff>>,
    pub pool: Weak<PoolShared>,
}

struct Negotiated {
    server_version: String,
    protocol_version: u32,
    max_message_size: u32,
}

struct Inner {
    producers: HashMap<u64, Weak<dyn ConnectionListener>>,
    consumers: HashMap<u64, Weak<dyn ConnectionListener>>,
    outbound: Option<mpsc::UnboundedSender<Command>>,
    tasks: Vec<AbortHandle>,
    stats: ConnectionStats,
    server_version: Option<String>,
    max_message_size: Option<u32>,
    close_reason: Option<Error>,
}

/// A broker session shared by every producer and consumer routed to the
/// same logical address.
///
/// Only the pool holds a connection strongly; its I/O tasks hold weak
/// references and stop once the last strong reference is gone.
pub struct Connection {
    id: u64,
    pool_key: String,
    logical_address: String,
    physical_address: String,
    config: ConnectionConfig,
    /// Written only while `inner` is locked; read lock-free.
    state: AtomicU8,
    ping_outstanding: AtomicBool,
    inner: Mutex<Inner>,
    connect_promise: Promise<ConnectionWeakRef>,
    executor: Arc<Executor>,
    auth: Arc<dyn Authentication>,
    dialer: Arc<dyn Dialer>,
    backoff: Arc<Mutex<ReconnectionBackoff>>,
    pool: Weak<PoolShared>,
}

impl Connection {
    pub(crate) fn new(params: ConnectionParams) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            pool_key: params.pool_key,
            logical_address: params.logical_address,
            physical_address: params.physical_address,
            config: params.config,
            state: AtomicU8::new(ConnectionState::Pending as u8),
            ping_outstanding: AtomicBool::new(false),
            inner: Mutex::new(Inner {
                producers: HashMap::new(),
                consumers: HashMap::new(),
                outbound: None,
                tasks: Vec::new(),
                stats: ConnectionStats::default(),
                server_version: None,
                max_message_size: None,
                close_reason: None,
            }),
            connect_promise: Promise::new(),
            executor: params.executor,
            auth: params.auth,
            dialer: params.dialer,
            backoff: params.backoff,
            pool: params.pool,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn backoff(&self) -> MutexGuard<'_, ReconnectionBackoff> {
        self.backoff.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Process-unique generation id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Key this connection is stored under in the pool.
    pub fn pool_key(&self) -> &str {
        &self.pool_key
    }

    /// Broker identity this connection was requested for.
    pub fn logical_address(&self) -> &str {
        &self.logical_address
    }

    /// Endpoint actually dialed.
    pub fn physical_address(&self) -> &str {
        &self.physical_address
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Check if the connection is usable.
    pub fn is_ready(&self) -> bool {
        self.state().is_ready()
    }

    /// Snapshot of the connection statistics.
    pub fn stats(&self) -> ConnectionStats {
        self.lock().stats.clone()
    }

    /// Version string the broker reported in `Connected`.
    pub fn server_version(&self) -> Option<String> {
        self.lock().server_version.clone()
    }

    /// Maximum message size the broker accepts.
    pub fn max_message_size(&self) -> Option<u32> {
        self.lock().max_message_size
    }

    /// Why the connection broke.
    pub fn close_reason(&self) -> Option<Error> {
        self.lock().close_reason.clone()
    }

    /// Result completed once the connection is Ready or has failed.
    pub fn connect_future(&self) -> AsyncResult<ConnectionWeakRef> {
        self.connect_promise.future()
    }

    /// Begin dialing on this connection's executor.
    ///
    /// Spawned with no lock held: a runtime that has shut down drops the task
    /// inline, and the drop guard closes the connection on this thread.
    pub(crate) fn start(self: &Arc<Self>) {
        if self.state().is_broken() {
            return;
        }
        let guard = EstablishGuard(Some(Arc::clone(self)));
        let task = self.executor.spawn(async move {
            let mut guard = guard;
            if let Some(cnx) = guard.0.clone() {
                cnx.establish().await;
            }
            guard.0 = None;
        });

        let mut inner = self.lock();
        if self.state().is_broken() {
            drop(inner);
            task.abort();
            return;
        }
        inner.tasks.push(task.abort_handle());
    }

    async fn establish(self: Arc<Self>) {
        let target = socket_target(&self.physical_address).to_string();
        debug!(cnx = %self, id = self.id, "connecting to {target}");

        let stream = match timeout(self.config.connect_timeout, self.dialer.dial(&target)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.close(Error::ConnectFailed(format!("{target}: {e}")));
                return;
            }
            Err(_) => {
                self.close(Error::ConnectFailed(format!(
                    "{target}: timed out after {:?}",
                    self.config.connect_timeout
                )));
                return;
            }
        };

        let (mut reader, mut writer) = tokio::io::split(stream);
        let handshake = self.handshake(&mut reader, &mut writer);
        let negotiated = match timeout(self.config.connect_timeout, handshake).await {
            Ok(Ok(negotiated)) => negotiated,
            Ok(Err(e)) => {
                self.close(e);
                return;
            }
            Err(_) => {
                self.close(Error::HandshakeFailed(
                    "timed out waiting for Connected".into(),
                ));
                return;
            }
        };

        self.mark_ready(negotiated, reader, writer);
    }

    async fn handshake(
        &self,
        reader: &mut ReadHalf<BoxedStream>,
        writer: &mut WriteHalf<BoxedStream>,
    ) -> Result<Negotiated> {
        let auth = self
            .auth
            .get_auth_data()
            .map_err(|e| Error::HandshakeFailed(format!("authentication: {e}")))?;

        let connect = Command::Connect {
            client_version: self.config.client_version.clone(),
            protocol_version: self.config.protocol_version,
            auth_method: auth.method,
            auth_data: auth.data,
            proxy_to_broker_url: (self.logical_address != self.physical_address)
                .then(|| self.logical_address.clone()),
        };
        write_frame(writer, &connect)
            .await
            .map_err(|e| Error::HandshakeFailed(format!("sending Connect: {e}")))?;

        match read_frame(reader, self.config.max_frame_size).await {
            Ok(Command::Connected {
                server_version,
                protocol_version,
                max_message_size,
            }) => Ok(Negotiated {
                server_version,
                protocol_version,
                max_message_size,
            }),
            Ok(Command::Error { code, message }) => Err(Error::HandshakeFailed(format!(
                "rejected by broker ({code}): {message}"
            ))),
            Ok(other) => Err(Error::HandshakeFailed(format!(
                "unexpected {:?} during handshake",
                other.command_type()
            ))),
            Err(e) => Err(Error::HandshakeFailed(e.to_string())),
        }
    }

    fn mark_ready(
        self: &Arc<Self>,
        negotiated: Negotiated,
        reader: ReadHalf<BoxedStream>,
        writer: WriteHalf<BoxedStream>,
    ) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        {
            let mut inner = self.lock();
            if self.state().is_broken() {
                return;
            }
            self.state
                .store(ConnectionState::Ready as u8, Ordering::Release);
            inner.outbound = Some(outbound_tx);
            inner.server_version = Some(negotiated.server_version.clone());
            inner.max_message_size = Some(negotiated.max_message_size);
            inner.stats.record_connect();

            let weak = Arc::downgrade(self);
            let keep_alive = self.config.keep_alive.as_ref().map(|k| k.interval);
            let reader_task = self.executor.spawn(read_loop(
                weak.clone(),
                reader,
                self.config.max_frame_size,
            ));
            let writer_task = self
                .executor
                .spawn(write_loop(weak, writer, outbound_rx, keep_alive));
            inner.tasks.push(reader_task.abort_handle());
            inner.tasks.push(writer_task.abort_handle());
        }

        self.backoff().mark_success();
        if let Some(pool) = self.pool.upgrade() {
            pool.release_episode(&self.logical_address, &self.backoff);
        }
        info!(
            cnx = %self,
            id = self.id,
            server_version = %negotiated.server_version,
            protocol_version = negotiated.protocol_version,
            "connection ready"
        );
        self.connect_promise.set_value(Arc::downgrade(self));
    }

    fn handle_incoming(self: &Arc<Self>, command: Command) {
        self.lock()
            .stats
            .record_receive(command == Command::Pong);

        match command {
            Command::Ping => {
                trace!(cnx = %self, "received ping");
                if let Err(e) = self.send_command(Command::Pong) {
                    debug!(cnx = %self, error = %e, "could not answer ping");
                }
            }
            Command::Pong => {
                trace!(cnx = %self, "received pong");
                self.ping_outstanding.store(false, Ordering::Release);
            }
            Command::Error { code, message } => {
                warn!(cnx = %self, code, %message, "broker reported an error");
                self.close(Error::Disconnected(format!(
                    "broker error ({code}): {message}"
                )));
            }
            other => {
                debug!(cnx = %self, command = ?other.command_type(), "ignoring unexpected command");
            }
        }
    }

    /// Queue a command for the writer task.
    pub fn send_command(&self, command: Command) -> Result<()> {
        let inner = self.lock();
        match (&inner.outbound, self.state()) {
            (Some(outbound), ConnectionState::Ready) => {
                outbound.send(command).map_err(|_| Error::AlreadyClosed)
            }
            _ => Err(Error::AlreadyClosed),
        }
    }

    /// Break the connection.
    ///
    /// Only the first call has any effect. The connection leaves the pool,
    /// a still pending connect result fails with `reason`, and every live
    /// attached producer and consumer is notified. No lock is held while
    /// listeners run.
    pub fn close(self: &Arc<Self>, reason: Error) {
        let (producers, consumers, tasks, was_ready) = {
            let mut inner = self.lock();
            let previous = ConnectionState::from_u8(
                self.state
                    .swap(ConnectionState::Broken as u8, Ordering::AcqRel),
            );
            if previous.is_broken() {
                return;
            }
            inner.close_reason = Some(reason.clone());
            inner.outbound = None;
            inner.stats.record_disconnect();
            (
                std::mem::take(&mut inner.producers),
                std::mem::take(&mut inner.consumers),
                std::mem::take(&mut inner.tasks),
                previous.is_ready(),
            )
        };

        if was_ready {
            info!(cnx = %self, id = self.id, %reason, "connection closed");
        } else {
            let delay = self.backoff().next();
            warn!(
                cnx = %self,
                id = self.id,
                %reason,
                backoff_ms = delay.as_millis() as u64,
                "failed to establish connection"
            );
        }

        for task in tasks {
            task.abort();
        }

        if let Some(pool) = self.pool.upgrade() {
            pool.remove(&self.pool_key, self);
        }

        self.connect_promise.set_failed(reason.clone());

        for listener in producers.into_values().chain(consumers.into_values()) {
            match listener.upgrade() {
                Some(listener) => listener.connection_closed(self, &reason),
                None => trace!(cnx = %self, "skipping listener that is already gone"),
            }
        }
    }

    /// Attach a producer.
    ///
    /// Fails with the close reason if the connection already broke, so a
    /// caller never misses the notification.
    pub fn register_producer(
        &self,
        producer_id: u64,
        listener: Weak<dyn ConnectionListener>,
    ) -> Result<()> {
        self.register(AttachmentKind::Producer, producer_id, listener)
    }

    /// Attach a consumer. Same contract as [`register_producer`](Self::register_producer).
    pub fn register_consumer(
        &self,
        consumer_id: u64,
        listener: Weak<dyn ConnectionListener>,
    ) -> Result<()> {
        self.register(AttachmentKind::Consumer, consumer_id, listener)
    }

    /// Attach a listener of the given kind.
    pub fn register(
        &self,
        kind: AttachmentKind,
        id: u64,
        listener: Weak<dyn ConnectionListener>,
    ) -> Result<()> {
        let mut inner = self.lock();
        if self.state().is_broken() {
            return Err(inner.close_reason.clone().unwrap_or(Error::AlreadyClosed));
        }
        match kind {
            AttachmentKind::Producer => inner.producers.insert(id, listener),
            AttachmentKind::Consumer => inner.consumers.insert(id, listener),
        };
        Ok(())
    }

    /// Detach a producer.
    pub fn remove_producer(&self, producer_id: u64) -> bool {
        self.lock().producers.remove(&producer_id).is_some()
    }

    /// Detach a consumer.
    pub fn remove_consumer(&self, consumer_id: u64) -> bool {
        self.lock().consumers.remove(&consumer_id).is_some()
    }

    /// Number of attached producers.
    pub fn producer_count(&self) -> usize {
        self.lock().producers.len()
    }

    /// Number of attached consumers.
    pub fn consumer_count(&self) -> usize {
        self.lock().consumers.len()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        for task in inner.tasks.drain(..) {
            task.abort();
        }
        trace!(id = self.id, "connection dropped");
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} -> {}]", self.logical_address, self.physical_address)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("logical_address", &self.logical_address)
            .field("physical_address", &self.physical_address)
            .field("state", &self.state())
            .finish()
    }
}

/// Breaks the connection if the establish task is dropped before finishing,
/// e.g. when its runtime shuts down.
struct EstablishGuard(Option<Arc<Connection>>);

impl Drop for EstablishGuard {
    fn drop(&mut self) {
        if let Some(cnx) = self.0.take() {
            cnx.close(Error::ConnectFailed("connection attempt aborted".into()));
        }
    }
}

async fn read_loop(cnx: Weak<Connection>, mut reader: ReadHalf<BoxedStream>, max_frame_size: usize) {
    loop {
        let frame = read_frame(&mut reader, max_frame_size).await;
        let Some(cnx) = cnx.upgrade() else {
            return;
        };
        match frame {
            Ok(command) => cnx.handle_incoming(command),
            Err(e) => {
                cnx.close(Error::Disconnected(format!("read failed: {e}")));
                return;
            }
        }
    }
}

async fn write_loop(
    cnx: Weak<Connection>,
    mut writer: WriteHalf<BoxedStream>,
    mut outbound: mpsc::UnboundedReceiver<Command>,
    keep_alive: Option<Duration>,
) {
    let mut ticker = keep_alive.map(|period| {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });

    loop {
        let command = tokio::select! {
            command = outbound.recv() => match command {
                Some(command) => command,
                None => return,
            },
            _ = next_tick(&mut ticker) => {
                let Some(cnx) = cnx.upgrade() else {
                    return;
                };
                if cnx.ping_outstanding.swap(true, Ordering::AcqRel) {
                    warn!(cnx = %cnx, "no pong received within the keep-alive interval");
                    cnx.close(Error::Disconnected("keep-alive timeout".into()));
                    return;
                }
                Command::Ping
            }
        };

        let is_ping = command == Command::Ping;
        let written = write_frame(&mut writer, &command).await;
        let Some(cnx) = cnx.upgrade() else {
            return;
        };
        match written {
            Ok(()) => cnx.lock().stats.record_send(is_ping),
            Err(e) => {
                cnx.close(Error::Disconnected(format!("write failed: {e}")));
                return;
            }
        }
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
