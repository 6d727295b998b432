//! Execution contexts for connection I/O and timers.
//!
//! An [`ExecutorProvider`] hands out [`Executor`]s round-robin. Each executor
//! is bound to one tokio runtime, either owned (a dedicated I/O thread) or
//! borrowed from the application.

use std::fmt;
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use tokio::runtime::{Builder, Handle};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::debug;

/// A single I/O execution context.
pub struct Executor {
    handle: Handle,
    /// Present only when this executor owns its runtime thread.
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

impl Executor {
    fn owned(index: usize) -> io::Result<Self> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        let handle = runtime.handle().clone();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        thread::Builder::new()
            .name(format!("brokerpool-io-{index}"))
            .spawn(move || {
                runtime.block_on(async {
                    let _ = shutdown_rx.await;
                });
                runtime.shutdown_timeout(Duration::from_secs(1));
                debug!(index, "I/O thread stopped");
            })?;

        Ok(Self {
            handle,
            shutdown: Mutex::new(Some(shutdown_tx)),
        })
    }

    fn borrowed(handle: Handle) -> Self {
        Self {
            handle,
            shutdown: Mutex::new(None),
        }
    }

    /// Get the runtime handle new connections are bound to.
    pub fn get_io_context(&self) -> Handle {
        self.handle.clone()
    }

    /// Spawn a task on this executor.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// Create a timer that fires on this executor.
    pub fn create_deadline_timer(&self) -> DeadlineTimer {
        DeadlineTimer::new(self.handle.clone())
    }

    /// Stop the owned runtime thread. No-op for borrowed runtimes.
    pub fn close(&self) {
        let sender = self
            .shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sender) = sender {
            let _ = sender.send(());
        }
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("runtime", &self.handle.runtime_flavor())
            .finish()
    }
}

/// Round-robin provider of I/O executors.
pub struct ExecutorProvider {
    executors: Vec<Arc<Executor>>,
    next: AtomicUsize,
    closed: AtomicBool,
}

impl ExecutorProvider {
    /// Create a provider with `io_threads` dedicated runtime threads.
    pub fn new(io_threads: usize) -> io::Result<Self> {
        let executors = (0..io_threads.max(1))
            .map(|index| Executor::owned(index).map(Arc::new))
            .collect::<io::Result<Vec<_>>>()?;
        Ok(Self::from_executors(executors))
    }

    /// Create a provider running everything on an existing runtime.
    pub fn from_handle(handle: Handle) -> Self {
        Self::from_executors(vec![Arc::new(Executor::borrowed(handle))])
    }

    /// Create a provider on the runtime of the calling task.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a tokio runtime.
    pub fn current() -> Self {
        Self::from_handle(Handle::current())
    }

    fn from_executors(executors: Vec<Arc<Executor>>) -> Self {
        Self {
            executors,
            next: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Get the next executor.
    pub fn get(&self) -> Arc<Executor> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.executors.len();
        Arc::clone(&self.executors[index])
    }

    /// Number of executors in this provider.
    pub fn len(&self) -> usize {
        self.executors.len()
    }

    /// Always false; a provider holds at least one executor.
    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }

    /// Stop all owned runtime threads.
    ///
    /// Returns `false` if the provider was already closed.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        for executor in &self.executors {
            executor.close();
        }
        true
    }
}

impl fmt::Debug for ExecutorProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorProvider")
            .field("executors", &self.executors.len())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

/// How a timer wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    /// The deadline passed.
    Expired,
    /// The wait was cancelled, re-armed, or the timer was dropped.
    Cancelled,
}

struct TimerState {
    deadline: Instant,
    pending: Option<oneshot::Sender<()>>,
}

/// A re-armable one-shot timer.
///
/// At most one wait is outstanding; re-arming or starting a new wait cancels
/// the previous one.
pub struct DeadlineTimer {
    handle: Handle,
    state: Mutex<TimerState>,
}

impl DeadlineTimer {
    fn new(handle: Handle) -> Self {
        Self {
            handle,
            state: Mutex::new(TimerState {
                deadline: Instant::now(),
                pending: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TimerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set the deadline relative to now, cancelling any pending wait.
    ///
    /// Returns `true` if a pending wait was cancelled.
    pub fn expires_from_now(&self, delay: Duration) -> bool {
        let mut state = self.lock();
        state.deadline = Instant::now() + delay;
        state
            .pending
            .take()
            .is_some_and(|pending| pending.send(()).is_ok())
    }

    /// The current deadline.
    pub fn expiry(&self) -> Instant {
        self.lock().deadline
    }

    /// Invoke `callback` once the deadline passes or the wait is cancelled.
    pub fn async_wait<F>(&self, callback: F)
    where
        F: FnOnce(TimerEvent) + Send + 'static,
    {
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let deadline = {
            let mut state = self.lock();
            if let Some(previous) = state.pending.replace(cancel_tx) {
                let _ = previous.send(());
            }
            state.deadline
        };

        self.handle.spawn(async move {
            let event = tokio::select! {
                _ = sleep_until(deadline) => TimerEvent::Expired,
                _ = cancel_rx => TimerEvent::Cancelled,
            };
            callback(event);
        });
    }

    /// Cancel the pending wait.
    ///
    /// Returns `true` if a wait was still outstanding.
    pub fn cancel(&self) -> bool {
        self.lock()
            .pending
            .take()
            .is_some_and(|pending| pending.send(()).is_ok())
    }
}

impl fmt::Debug for DeadlineTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeadlineTimer")
            .field("deadline", &self.lock().deadline)
            .finish()
    }
}
