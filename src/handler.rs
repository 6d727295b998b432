//! Reconnecting attachment to a pooled connection.
//!
//! A [`Handler`] is the part of a producer or consumer that owns "which
//! connection am I on". It obtains a connection from the pool, registers
//! itself for the broken notification, and when that fires it detaches and
//! retries with exponential backoff until it is closed.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::connection::{
    AttachmentKind, BackoffConfig, Connection, ConnectionListener, ConnectionPool,
    ConnectionWeakRef, HandlerConfig, ReconnectionBackoff,
};
use crate::error::Error;
use crate::executor::{DeadlineTimer, TimerEvent};
use crate::future::AsyncResult;
use crate::resolver::AddressResolver;

static NEXT_HANDLER_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HandlerState {
    /// Created, not yet started.
    NotStarted = 0,
    /// Waiting for its first connection.
    Pending = 1,
    /// Attached at least once; reconnects on failure.
    Ready = 2,
    /// Close in progress.
    Closing = 3,
    /// Closed.
    Closed = 4,
    /// Gave up.
    Failed = 5,
}

impl HandlerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::NotStarted,
            1 => Self::Pending,
            2 => Self::Ready,
            3 => Self::Closing,
            4 => Self::Closed,
            _ => Self::Failed,
        }
    }

    /// Check if the handler still wants a connection.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Ready)
    }
}

/// Hooks the owning producer or consumer implements.
pub trait HandlerCallbacks: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// A connection was obtained and the handler is registered on it.
    ///
    /// Returning a retryable error schedules another attempt.
    fn connection_opened(&self, cnx: &Arc<Connection>) -> AsyncResult<()>;

    /// An attempt to obtain a connection failed.
    fn connection_failed(&self, error: &Error);

    /// The handler is about to move from `previous` to another connection.
    fn before_connection_change(&self, _previous: &Arc<Connection>) {}
}

/// Keeps a producer or consumer attached to a live connection.
pub struct Handler {
    id: u64,
    name: String,
    kind: AttachmentKind,
    logical_address: String,
    resolver: Arc<dyn AddressResolver>,
    pool: ConnectionPool,
    callbacks: Weak<dyn HandlerCallbacks>,
    this: Weak<Handler>,
    state: AtomicU8,
    connection: Mutex<ConnectionWeakRef>,
    backoff: Mutex<ReconnectionBackoff>,
    timer: DeadlineTimer,
    reconnection_pending: AtomicBool,
    epoch: AtomicU64,
    creation: Instant,
    operation_timeout: Duration,
}

impl Handler {
    /// Create a handler for `logical_address`, dialing whatever `resolver`
    /// returns on each attempt.
    pub fn new(
        pool: ConnectionPool,
        logical_address: impl Into<String>,
        resolver: Arc<dyn AddressResolver>,
        kind: AttachmentKind,
        callbacks: Weak<dyn HandlerCallbacks>,
        config: HandlerConfig,
    ) -> Arc<Self> {
        let name = callbacks
            .upgrade()
            .map(|callbacks| callbacks.name().to_string())
            .unwrap_or_else(|| "handler".to_string());
        let timer = pool.executor_provider().get().create_deadline_timer();

        Arc::new_cyclic(|this| Self {
            id: NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed),
            name,
            kind,
            logical_address: logical_address.into(),
            resolver,
            pool,
            callbacks,
            this: this.clone(),
            state: AtomicU8::new(HandlerState::NotStarted as u8),
            connection: Mutex::new(Weak::new()),
            backoff: Mutex::new(ReconnectionBackoff::new(config.backoff)),
            timer,
            reconnection_pending: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            creation: Instant::now(),
            operation_timeout: config.operation_timeout,
        })
    }

    fn lock_connection(&self) -> MutexGuard<'_, ConnectionWeakRef> {
        self.connection.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_backoff(&self) -> MutexGuard<'_, ReconnectionBackoff> {
        self.backoff.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Id this handler registers under.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Name used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state.
    pub fn state(&self) -> HandlerState {
        HandlerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Number of reconnection attempts made so far.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// The connection currently attached, if any.
    pub fn connection(&self) -> ConnectionWeakRef {
        self.lock_connection().clone()
    }

    /// Backoff parameters in use.
    pub fn backoff_config(&self) -> BackoffConfig {
        self.lock_backoff().config().clone()
    }

    /// Start obtaining a connection. Returns `false` if already started.
    pub fn start(self: &Arc<Self>) -> bool {
        if self
            .state
            .compare_exchange(
                HandlerState::NotStarted as u8,
                HandlerState::Pending as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return false;
        }
        self.grab_cnx();
        true
    }

    /// Ask the pool for a connection unless one is attached or an attempt
    /// is already in flight.
    pub fn grab_cnx(self: &Arc<Self>) {
        if self
            .reconnection_pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            info!(handler = %self.name, "ignoring reconnection attempt since one is already pending");
            return;
        }
        if self.connection().upgrade().is_some() {
            info!(handler = %self.name, "ignoring reconnection request since already connected");
            self.reconnection_pending.store(false, Ordering::Release);
            return;
        }

        let physical_address = self.resolver.resolve_host();
        debug!(
            handler = %self.name,
            logical_address = %self.logical_address,
            %physical_address,
            "getting connection from pool"
        );

        let handler = Arc::clone(self);
        self.pool
            .get_connection(&self.logical_address, &physical_address)
            .add_listener(move |result| {
                let result = result.and_then(|weak| {
                    weak.upgrade()
                        .ok_or_else(|| Error::Disconnected("connection released before use".into()))
                });
                match result {
                    Ok(cnx) => handler.connection_opened(cnx),
                    Err(e) => handler.connection_attempt_failed(e),
                }
            });
    }

    fn connection_attempt_failed(self: &Arc<Self>, error: Error) {
        self.reconnection_pending.store(false, Ordering::Release);
        let error = self.convert_to_timeout_if_necessary(error, self.creation);
        warn!(handler = %self.name, %error, "failed to obtain a connection");

        let give_up = matches!(error, Error::PoolClosed)
            || (self.state() == HandlerState::Pending && matches!(error, Error::Timeout));
        if let Some(callbacks) = self.callbacks.upgrade() {
            callbacks.connection_failed(&error);
        }
        if give_up {
            self.fail();
        } else {
            self.schedule_reconnection();
        }
    }

    fn connection_opened(self: &Arc<Self>, cnx: Arc<Connection>) {
        if !self.state().is_active() {
            self.reconnection_pending.store(false, Ordering::Release);
            return;
        }
        debug!(handler = %self.name, cnx = %cnx, "connected to broker");
        self.set_cnx(&cnx);

        let listener: Weak<dyn ConnectionListener> = self.this.clone();
        if let Err(e) = cnx.register(self.kind, self.id, listener) {
            debug!(handler = %self.name, cnx = %cnx, error = %e, "connection broke before registration");
            self.reset_cnx();
            self.reconnection_pending.store(false, Ordering::Release);
            self.schedule_reconnection();
            return;
        }
        if !self.state().is_active() {
            self.detach(&cnx);
            self.reconnection_pending.store(false, Ordering::Release);
            return;
        }

        let Some(callbacks) = self.callbacks.upgrade() else {
            self.reconnection_pending.store(false, Ordering::Release);
            return;
        };
        let handler = Arc::clone(self);
        callbacks.connection_opened(&cnx).add_listener(move |result| {
            handler.reconnection_pending.store(false, Ordering::Release);
            match result {
                Ok(()) => {
                    let _ = handler.state.compare_exchange(
                        HandlerState::Pending as u8,
                        HandlerState::Ready as u8,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                    handler.lock_backoff().mark_success();
                    info!(handler = %handler.name, cnx = %cnx, "attached to connection");
                }
                Err(e) if e.is_retryable() => {
                    warn!(handler = %handler.name, error = %e, "attach failed, retrying");
                    handler.detach(&cnx);
                    handler.reset_cnx();
                    handler.schedule_reconnection();
                }
                Err(e) => {
                    warn!(handler = %handler.name, error = %e, "attach failed permanently");
                    handler.detach(&cnx);
                    handler.reset_cnx();
                    handler.fail();
                }
            }
        });
    }

    fn handle_disconnection(self: &Arc<Self>, reason: &Error, cnx: &Arc<Connection>) {
        if let Some(current) = self.connection().upgrade() {
            if current.id() != cnx.id() {
                warn!(
                    handler = %self.name,
                    stale = %cnx,
                    "ignoring connection closed since we are already attached to a newer connection"
                );
                return;
            }
        }

        self.reset_cnx();

        if matches!(reason, Error::PoolClosed) && self.state().is_active() {
            if let Some(callbacks) = self.callbacks.upgrade() {
                callbacks.connection_failed(reason);
            }
            self.fail();
            return;
        }

        match self.state() {
            HandlerState::Pending | HandlerState::Ready => {
                info!(handler = %self.name, %reason, "connection closed, reconnecting");
                self.schedule_reconnection();
            }
            state => {
                debug!(handler = %self.name, ?state, "ignoring connection closed since the handler is not used anymore");
            }
        }
    }

    fn schedule_reconnection(self: &Arc<Self>) {
        if !self.state().is_active() {
            return;
        }
        let delay = self.lock_backoff().next();
        info!(
            handler = %self.name,
            delay_ms = delay.as_millis() as u64,
            "scheduling reconnection"
        );

        self.timer.expires_from_now(delay);
        let weak = Arc::downgrade(self);
        let name = self.name.clone();
        self.timer.async_wait(move |event| match weak.upgrade() {
            Some(handler) => handler.handle_timeout(event),
            None => debug!(handler = %name, "cancelling the reconnection since the handler is destroyed"),
        });
    }

    fn handle_timeout(self: &Arc<Self>, event: TimerEvent) {
        match event {
            TimerEvent::Cancelled => debug!(handler = %self.name, "ignoring cancelled reconnection timer"),
            TimerEvent::Expired if self.state().is_active() => {
                self.epoch.fetch_add(1, Ordering::AcqRel);
                self.grab_cnx();
            }
            TimerEvent::Expired => {}
        }
    }

    fn set_cnx(&self, cnx: &Arc<Connection>) {
        let previous = std::mem::replace(&mut *self.lock_connection(), Arc::downgrade(cnx));
        if let Some(previous) = previous.upgrade() {
            if previous.id() != cnx.id() {
                if let Some(callbacks) = self.callbacks.upgrade() {
                    callbacks.before_connection_change(&previous);
                }
            }
        }
    }

    fn reset_cnx(&self) {
        *self.lock_connection() = Weak::new();
    }

    fn detach(&self, cnx: &Connection) {
        match self.kind {
            AttachmentKind::Producer => cnx.remove_producer(self.id),
            AttachmentKind::Consumer => cnx.remove_consumer(self.id),
        };
    }

    fn fail(&self) {
        let _ = self.state.fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
            HandlerState::from_u8(state)
                .is_active()
                .then_some(HandlerState::Failed as u8)
        });
        self.timer.cancel();
    }

    /// Stop reconnecting and detach from the current connection.
    ///
    /// Returns `false` if already closing or closed.
    pub fn close(&self) -> bool {
        let previous = self.state.fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
            match HandlerState::from_u8(state) {
                HandlerState::Closing | HandlerState::Closed => None,
                _ => Some(HandlerState::Closing as u8),
            }
        });
        if previous.is_err() {
            return false;
        }

        self.timer.cancel();
        let cnx = std::mem::take(&mut *self.lock_connection());
        if let Some(cnx) = cnx.upgrade() {
            self.detach(&cnx);
        }
        self.state
            .store(HandlerState::Closed as u8, Ordering::Release);
        info!(handler = %self.name, "closed");
        true
    }

    /// Report a retryable error as [`Error::Timeout`] once the operation
    /// timeout has passed since `started`.
    pub fn convert_to_timeout_if_necessary(&self, error: Error, started: Instant) -> Error {
        if error.is_retryable() && started.elapsed() >= self.operation_timeout {
            Error::Timeout
        } else {
            error
        }
    }
}

impl ConnectionListener for Handler {
    fn connection_closed(&self, cnx: &Arc<Connection>, reason: &Error) {
        if let Some(this) = self.this.upgrade() {
            this.handle_disconnection(reason, cnx);
        }
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("logical_address", &self.logical_address)
            .field("state", &self.state())
            .field("epoch", &self.epoch())
            .finish()
    }
}
