//! Single-assignment results shared between one producer and many waiters.
//!
//! A [`Promise`] is completed exactly once; every [`AsyncResult`] cloned from
//! it observes that same outcome. Waiters can attach listeners, block on the
//! result, or `.await` it.
//!
//! # Example
//!
//! ```
//! use brokerpool::future::Promise;
//!
//! let promise = Promise::new();
//! let result = promise.future();
//!
//! result.add_listener(|outcome: brokerpool::Result<u32>| {
//!     assert_eq!(outcome.unwrap(), 7);
//! });
//!
//! assert!(promise.set_value(7));
//! assert!(!promise.set_value(8));
//! assert_eq!(result.wait().unwrap(), 7);
//! ```

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use tracing::trace;

use crate::error::{Error, Result};

type Listener<T> = Box<dyn FnOnce(Result<T>) + Send>;

struct Inner<T> {
    outcome: Option<Result<T>>,
    listeners: Vec<Listener<T>>,
    wakers: Vec<Waker>,
}

struct Shared<T> {
    inner: Mutex<Inner<T>>,
    completed: Condvar,
}

impl<T> Shared<T> {
    fn new(outcome: Option<Result<T>>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                outcome,
                listeners: Vec::new(),
                wakers: Vec::new(),
            }),
            completed: Condvar::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The producing side of a single-assignment result.
///
/// Dropping a promise that was never completed fails it, so waiters never hang.
pub struct Promise<T: Clone + Send + 'static> {
    shared: Arc<Shared<T>>,
}

impl<T: Clone + Send + 'static> Promise<T> {
    /// Create a new, pending promise.
    pub fn new() -> Self {
        Self {
            shared: Shared::new(None),
        }
    }

    /// Get a result handle observing this promise.
    pub fn future(&self) -> AsyncResult<T> {
        AsyncResult {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Complete the promise.
    ///
    /// The first completion wins; later calls return `false` and leave the
    /// first outcome in place. Listeners run on the calling thread with no
    /// lock held.
    pub fn complete(&self, outcome: Result<T>) -> bool {
        let (listeners, wakers) = {
            let mut inner = self.shared.lock();
            if inner.outcome.is_some() {
                trace!("ignoring duplicate completion");
                return false;
            }
            inner.outcome = Some(outcome.clone());
            (
                std::mem::take(&mut inner.listeners),
                std::mem::take(&mut inner.wakers),
            )
        };
        self.shared.completed.notify_all();

        for listener in listeners {
            listener(outcome.clone());
        }
        for waker in wakers {
            waker.wake();
        }
        true
    }

    /// Complete the promise with a value.
    pub fn set_value(&self, value: T) -> bool {
        self.complete(Ok(value))
    }

    /// Complete the promise with a failure.
    pub fn set_failed(&self, error: Error) -> bool {
        self.complete(Err(error))
    }

    /// Check whether the promise has been completed.
    pub fn is_complete(&self) -> bool {
        self.shared.lock().outcome.is_some()
    }
}

impl<T: Clone + Send + 'static> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Drop for Promise<T> {
    fn drop(&mut self) {
        if !self.is_complete() {
            self.set_failed(Error::Disconnected("result abandoned".into()));
        }
    }
}

impl<T: Clone + Send + 'static> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("complete", &self.is_complete())
            .finish()
    }
}

/// The consuming side of a single-assignment result.
///
/// Cheap to clone; all clones share the same outcome.
pub struct AsyncResult<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for AsyncResult<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Clone + Send + 'static> AsyncResult<T> {
    /// Create an already completed result.
    pub fn ready(outcome: Result<T>) -> Self {
        Self {
            shared: Shared::new(Some(outcome)),
        }
    }

    /// Create an already failed result.
    pub fn failed(error: Error) -> Self {
        Self::ready(Err(error))
    }

    /// Attach a listener invoked exactly once with the outcome.
    ///
    /// If the result is already complete the listener runs immediately on the
    /// calling thread.
    pub fn add_listener<F>(&self, listener: F)
    where
        F: FnOnce(Result<T>) + Send + 'static,
    {
        let outcome = {
            let mut inner = self.shared.lock();
            match &inner.outcome {
                Some(outcome) => outcome.clone(),
                None => {
                    inner.listeners.push(Box::new(listener));
                    return;
                }
            }
        };
        listener(outcome);
    }

    /// Block the current thread until the result is complete.
    pub fn wait(&self) -> Result<T> {
        let mut inner = self.shared.lock();
        loop {
            if let Some(outcome) = &inner.outcome {
                return outcome.clone();
            }
            inner = self
                .shared
                .completed
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block until the result is complete or the timeout elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T>> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.shared.lock();
        loop {
            if let Some(outcome) = &inner.outcome {
                return Some(outcome.clone());
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            inner = self
                .shared
                .completed
                .wait_timeout(inner, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Get the outcome if already complete.
    pub fn try_get(&self) -> Option<Result<T>> {
        self.shared.lock().outcome.clone()
    }

    /// Check whether the result is complete.
    pub fn is_complete(&self) -> bool {
        self.shared.lock().outcome.is_some()
    }
}

impl<T: Clone> Future for AsyncResult<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut inner = self.shared.lock();
        if let Some(outcome) = &inner.outcome {
            return Poll::Ready(outcome.clone());
        }
        if !inner.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            inner.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

impl<T> fmt::Debug for AsyncResult<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.lock();
        f.debug_struct("AsyncResult")
            .field("complete", &inner.outcome.is_some())
            .field("listeners", &inner.listeners.len())
            .finish()
    }
}
