//! Connection pooling keyed by logical broker address.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, info, trace};

use crate::auth::Authentication;
use crate::error::{Error, Result};
use crate::executor::ExecutorProvider;
use crate::future::AsyncResult;

use super::backoff::ReconnectionBackoff;
use super::cnx::{Connection, ConnectionParams, ConnectionWeakRef};
use super::config::PoolConfig;
use super::transport::{Dialer, TcpDialer};

#[derive(Default)]
struct Registry {
    connections: HashMap<String, Arc<Connection>>,
    /// Backoff episode per logical address, shared with its connections.
    /// An entry lives only while its address has failures on record.
    episodes: HashMap<String, Arc<Mutex<ReconnectionBackoff>>>,
}

/// State shared between the pool handle and its connections.
pub(crate) struct PoolShared {
    config: PoolConfig,
    executors: Arc<ExecutorProvider>,
    /// Executors were built from `config.io_threads` and close with the pool.
    owns_executors: bool,
    auth: Arc<dyn Authentication>,
    dialer: Arc<dyn Dialer>,
    registry: Mutex<Registry>,
    closed: AtomicBool,
    key_counter: AtomicU64,
}

impl PoolShared {
    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pool_key(&self, logical_address: &str) -> String {
        if !self.config.pool_connections {
            let n = self.key_counter.fetch_add(1, Ordering::Relaxed);
            return format!("{logical_address}#{n}");
        }
        if self.config.connections_per_broker > 1 {
            let n = self.key_counter.fetch_add(1, Ordering::Relaxed);
            let slot = n % self.config.connections_per_broker as u64;
            return format!("{logical_address}-{slot}");
        }
        logical_address.to_string()
    }

    /// Forget the episode of `logical_address` once a connection reset it.
    pub(crate) fn release_episode(
        &self,
        logical_address: &str,
        episode: &Arc<Mutex<ReconnectionBackoff>>,
    ) {
        let mut registry = self.lock();
        let clean = registry
            .episodes
            .get(logical_address)
            .is_some_and(|stored| {
                Arc::ptr_eq(stored, episode)
                    && stored
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .consecutive_failures()
                        == 0
            });
        if clean {
            registry.episodes.remove(logical_address);
        }
    }

    /// Remove `cnx` from `key`, but only if it is still the stored entry.
    pub(crate) fn remove(&self, key: &str, cnx: &Connection) -> bool {
        let removed = {
            let mut registry = self.lock();
            match registry.connections.get(key) {
                Some(current) if current.id() == cnx.id() => registry.connections.remove(key),
                _ => None,
            }
        };

        if removed.is_some() {
            debug!(key, id = cnx.id(), "removed connection from pool");
            true
        } else {
            trace!(key, id = cnx.id(), "ignoring removal of a connection no longer pooled");
            false
        }
    }
}

/// Pool of broker connections.
///
/// At most one live connection exists per pool key. Concurrent requests for
/// the same key share one dial; broken connections are evicted and replaced
/// on the next request.
///
/// Cloning is cheap and yields a handle to the same pool.
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
}

impl ConnectionPool {
    /// Create a pool dialing over plain TCP on `config.io_threads` dedicated
    /// I/O threads. The threads stop when the pool is closed.
    pub fn create(config: PoolConfig, auth: Arc<dyn Authentication>) -> Result<Self> {
        let executors = Arc::new(ExecutorProvider::new(config.io_threads)?);
        Ok(Self::build(
            config,
            executors,
            true,
            auth,
            Arc::new(TcpDialer::new()),
        ))
    }

    /// Create a pool dialing over plain TCP.
    pub fn new(
        config: PoolConfig,
        executors: Arc<ExecutorProvider>,
        auth: Arc<dyn Authentication>,
    ) -> Self {
        Self::with_dialer(config, executors, auth, Arc::new(TcpDialer::new()))
    }

    /// Create a pool with a custom dialer.
    pub fn with_dialer(
        config: PoolConfig,
        executors: Arc<ExecutorProvider>,
        auth: Arc<dyn Authentication>,
        dialer: Arc<dyn Dialer>,
    ) -> Self {
        Self::build(config, executors, false, auth, dialer)
    }

    fn build(
        config: PoolConfig,
        executors: Arc<ExecutorProvider>,
        owns_executors: bool,
        auth: Arc<dyn Authentication>,
        dialer: Arc<dyn Dialer>,
    ) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                config,
                executors,
                owns_executors,
                auth,
                dialer,
                registry: Mutex::new(Registry::default()),
                closed: AtomicBool::new(false),
                key_counter: AtomicU64::new(0),
            }),
        }
    }

    /// Get a connection to a broker that is dialed directly.
    pub fn get(&self, address: &str) -> AsyncResult<ConnectionWeakRef> {
        self.get_connection(address, address)
    }

    /// Get a connection to `logical_address`, dialing `physical_address`
    /// if a new one is needed.
    ///
    /// Never blocks on I/O. A Ready entry completes the result immediately;
    /// a Pending entry shares the in-flight attempt. The physical address is
    /// only used when creating a connection.
    pub fn get_connection(
        &self,
        logical_address: &str,
        physical_address: &str,
    ) -> AsyncResult<ConnectionWeakRef> {
        if self.is_closed() {
            return AsyncResult::failed(Error::PoolClosed);
        }
        let key = self.shared.pool_key(logical_address);

        let (cnx, replaced) = {
            let mut registry = self.shared.lock();
            if self.is_closed() {
                return AsyncResult::failed(Error::PoolClosed);
            }

            if let Some(existing) = registry.connections.get(&key) {
                if !existing.state().is_broken() {
                    trace!(key, id = existing.id(), "reusing pooled connection");
                    return existing.connect_future();
                }
                debug!(key, id = existing.id(), "replacing broken connection");
            }

            let backoff = Arc::clone(
                registry
                    .episodes
                    .entry(logical_address.to_string())
                    .or_insert_with(|| {
                        Arc::new(Mutex::new(ReconnectionBackoff::new(
                            self.shared.config.backoff.clone(),
                        )))
                    }),
            );

            let cnx = Connection::new(ConnectionParams {
                pool_key: key.clone(),
                logical_address: logical_address.to_string(),
                physical_address: physical_address.to_string(),
                config: self.shared.config.connection_config.clone(),
                executor: self.shared.executors.get(),
                auth: Arc::clone(&self.shared.auth),
                dialer: Arc::clone(&self.shared.dialer),
                backoff,
                pool: Arc::downgrade(&self.shared),
            });
            let replaced = registry.connections.insert(key, Arc::clone(&cnx));
            (cnx, replaced)
        };
        drop(replaced);

        info!(
            logical_address,
            physical_address,
            id = cnx.id(),
            "creating connection"
        );
        let future = cnx.connect_future();
        cnx.start();
        future
    }

    /// Remove `cnx` from `key` if it is still the stored entry.
    ///
    /// Returns `false` when the key now holds a newer connection, or nothing.
    pub fn remove(&self, key: &str, cnx: &Connection) -> bool {
        self.shared.remove(key, cnx)
    }

    /// Close the pool and every pooled connection.
    ///
    /// Pending connect results fail with [`Error::PoolClosed`] and later
    /// requests fail immediately. Returns `false` if already closed.
    pub fn close(&self) -> bool {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return false;
        }

        let connections: Vec<_> = {
            let mut registry = self.shared.lock();
            registry.episodes.clear();
            registry.connections.drain().map(|(_, cnx)| cnx).collect()
        };

        info!(count = connections.len(), "closing connection pool");
        for cnx in connections {
            cnx.close(Error::PoolClosed);
        }
        if self.shared.owns_executors {
            self.shared.executors.close();
        }
        true
    }

    /// Check if the pool has been closed.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Number of pooled connections, in any state.
    pub fn connection_count(&self) -> usize {
        self.shared.lock().connections.len()
    }

    /// Snapshot of the pooled connections.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.shared.lock().connections.values().cloned().collect()
    }

    /// The executors connections are spread over.
    pub fn executor_provider(&self) -> &Arc<ExecutorProvider> {
        &self.shared.executors
    }

    /// The pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    #[cfg(test)]
    fn episode_count(&self) -> usize {
        self.shared.lock().episodes.len()
    }

    /// Delay the backoff episode of `logical_address` currently prescribes.
    pub fn reconnect_delay(&self, logical_address: &str) -> Duration {
        let episode = self.shared.lock().episodes.get(logical_address).cloned();
        match episode {
            Some(episode) => episode
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .current_delay(),
            None => Duration::ZERO,
        }
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("connections", &self.connection_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthDisabled;
    use crate::connection::testing::{DialBehavior, MockBroker, quick_config, test_pool, wait_until};
    use tokio::sync::{Barrier, Notify};

    async fn ready_id(pool: &ConnectionPool, logical: &str, physical: &str) -> u64 {
        pool.get_connection(logical, physical)
            .await
            .unwrap()
            .upgrade()
            .unwrap()
            .id()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_share_one_dial() {
        let broker = MockBroker::new();
        let pool = test_pool(&broker, quick_config());
        let barrier = Arc::new(Barrier::new(32));

        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let pool = pool.clone();
                let barrier = Arc::clone(&barrier);
                tokio::spawn(async move {
                    barrier.wait().await;
                    ready_id(&pool, "broker-1:6650", "broker-1:6650").await
                })
            })
            .collect();

        let mut ids = Vec::new();
        for task in tasks {
            ids.push(task.await.unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(broker.dial_count("broker-1:6650"), 1);
        assert_eq!(pool.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_keyed_by_logical_address() {
        let broker = MockBroker::new();
        let pool = test_pool(&broker, quick_config());

        let first = ready_id(&pool, "pulsar://broker-1:6650", "pulsar://proxy-a:6650").await;
        let second = ready_id(&pool, "pulsar://broker-1:6650", "pulsar://proxy-b:6650").await;
        assert_eq!(first, second);
        assert_eq!(broker.dial_count("proxy-a:6650"), 1);
        assert_eq!(broker.dial_count("proxy-b:6650"), 0);

        let other = ready_id(&pool, "pulsar://broker-2:6650", "pulsar://proxy-a:6650").await;
        assert_ne!(first, other);
        assert_eq!(broker.dial_count("proxy-a:6650"), 2);
    }

    #[tokio::test]
    async fn test_ready_connection_completes_immediately() {
        let broker = MockBroker::new();
        let pool = test_pool(&broker, quick_config());
        let id = ready_id(&pool, "broker-1:6650", "broker-1:6650").await;

        let result = pool.get("broker-1:6650");
        assert!(result.is_complete());
        let cnx = result.try_get().unwrap().unwrap().upgrade().unwrap();
        assert_eq!(cnx.id(), id);
    }

    #[tokio::test]
    async fn test_stale_removal_is_ignored() {
        let broker = MockBroker::new();
        let pool = test_pool(&broker, quick_config());

        let a = pool.get("broker-1:6650").await.unwrap().upgrade().unwrap();
        a.close(Error::Disconnected("test".into()));
        assert_eq!(pool.connection_count(), 0);

        let b = pool.get("broker-1:6650").await.unwrap().upgrade().unwrap();
        assert_ne!(a.id(), b.id());

        // A late removal of the old generation must not evict the new one.
        assert!(!pool.remove(a.pool_key(), &a));
        assert_eq!(ready_id(&pool, "broker-1:6650", "broker-1:6650").await, b.id());
        assert_eq!(broker.dial_count("broker-1:6650"), 2);
    }

    #[tokio::test]
    async fn test_broken_connection_replaced() {
        let broker = MockBroker::new();
        let pool = test_pool(&broker, quick_config());

        let first = ready_id(&pool, "broker-1:6650", "broker-1:6650").await;
        broker.kill_sessions("broker-1:6650");
        assert!(wait_until(Duration::from_secs(2), || pool.connection_count() == 0).await);

        let second = ready_id(&pool, "broker-1:6650", "broker-1:6650").await;
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_request_does_not_block_on_dial() {
        let broker = MockBroker::new();
        broker.set_behavior("broker-1:6650", DialBehavior::Hang);
        let pool = test_pool(&broker, quick_config());

        let started = std::time::Instant::now();
        let first = pool.get("broker-1:6650");
        let second = pool.get("broker-1:6650");
        assert!(started.elapsed() < Duration::from_millis(100));
        assert!(!first.is_complete());
        assert!(!second.is_complete());

        tokio::task::yield_now().await;
        assert!(wait_until(Duration::from_secs(1), || broker.dial_count("broker-1:6650") == 1).await);
        pool.close();
        assert!(matches!(first.await, Err(Error::PoolClosed)));
        assert!(matches!(second.await, Err(Error::PoolClosed)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_share_one_failure() {
        let broker = MockBroker::new();
        let release = Arc::new(Notify::new());
        broker.set_behavior(
            "broker-1:6650",
            DialBehavior::RefuseOnSignal(Arc::clone(&release)),
        );
        let pool = test_pool(&broker, quick_config());
        let barrier = Arc::new(Barrier::new(16));
        let (requested_tx, mut requested_rx) = tokio::sync::mpsc::unbounded_channel();

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let pool = pool.clone();
                let barrier = Arc::clone(&barrier);
                let requested = requested_tx.clone();
                tokio::spawn(async move {
                    barrier.wait().await;
                    let result = pool.get("broker-1:6650");
                    let _ = requested.send(());
                    result.await
                })
            })
            .collect();

        for _ in 0..16 {
            requested_rx.recv().await.unwrap();
        }
        release.notify_one();

        let mut messages = Vec::new();
        for task in tasks {
            match task.await.unwrap() {
                Err(e @ Error::ConnectFailed(_)) => messages.push(e.to_string()),
                other => panic!("expected ConnectFailed, got {other:?}"),
            }
        }
        messages.dedup();
        assert_eq!(messages.len(), 1);
        assert_eq!(broker.dial_count("broker-1:6650"), 1);
        assert_eq!(pool.connection_count(), 0);
    }

    #[test]
    fn test_get_after_executor_shutdown() {
        let executors = Arc::new(ExecutorProvider::new(1).unwrap());
        assert!(executors.close());
        // Give the I/O thread time to drop its runtime.
        std::thread::sleep(Duration::from_millis(1_500));

        let broker = MockBroker::new();
        let pool = ConnectionPool::with_dialer(
            quick_config(),
            executors,
            Arc::new(AuthDisabled),
            Arc::clone(&broker) as Arc<dyn Dialer>,
        );

        let (tx, rx) = std::sync::mpsc::channel();
        let requester = pool.clone();
        std::thread::spawn(move || {
            let outcome = requester
                .get("broker-1:6650")
                .wait_timeout(Duration::from_secs(1));
            let _ = tx.send(outcome);
        });

        let outcome = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("get_connection blocked after executor shutdown");
        assert!(matches!(outcome, Some(Err(Error::ConnectFailed(_)))));
        assert_eq!(pool.connection_count(), 0);
        assert_eq!(broker.dial_count("broker-1:6650"), 0);
    }

    #[test]
    fn test_create_owns_io_threads() {
        let pool = ConnectionPool::create(
            quick_config().with_io_threads(2),
            Arc::new(AuthDisabled),
        )
        .unwrap();
        assert_eq!(pool.executor_provider().len(), 2);

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let outcome = pool.get(&address).wait_timeout(Duration::from_secs(5));
        assert!(matches!(outcome, Some(Err(Error::ConnectFailed(_)))));

        assert!(pool.close());
        assert!(!pool.executor_provider().close());
    }

    #[tokio::test]
    async fn test_episode_released_after_success() {
        let broker = MockBroker::new();
        broker.set_behavior("broker-1:6650", DialBehavior::Refuse);
        let pool = test_pool(&broker, quick_config());

        assert!(pool.get("broker-1:6650").await.is_err());
        assert_eq!(pool.episode_count(), 1);

        broker.set_behavior("broker-1:6650", DialBehavior::Accept);
        pool.get("broker-1:6650").await.unwrap();
        assert_eq!(pool.episode_count(), 0);

        for n in 0..8 {
            pool.get(&format!("broker-{n}:6650")).await.unwrap();
        }
        assert_eq!(pool.episode_count(), 0);
        assert_eq!(pool.connection_count(), 9);
    }

    #[tokio::test]
    async fn test_close_fails_pending_requests() {
        let broker = MockBroker::new();
        broker.set_behavior("broker-1:6650", DialBehavior::Hang);
        let pool = test_pool(&broker, quick_config());

        let pending = pool.get("broker-1:6650");
        assert!(!pending.is_complete());

        assert!(pool.close());
        assert!(matches!(pending.await, Err(Error::PoolClosed)));
        assert_eq!(pool.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let broker = MockBroker::new();
        let pool = test_pool(&broker, quick_config());
        let cnx = pool.get("broker-1:6650").await.unwrap().upgrade().unwrap();

        assert!(pool.close());
        assert!(!pool.close());
        assert!(pool.is_closed());
        assert!(cnx.state().is_broken());
        assert!(matches!(cnx.close_reason(), Some(Error::PoolClosed)));

        let after = pool.get("broker-1:6650");
        assert!(after.is_complete());
        assert!(matches!(after.await, Err(Error::PoolClosed)));
        assert_eq!(broker.dial_count("broker-1:6650"), 1);
    }

    #[tokio::test]
    async fn test_pooling_disabled() {
        let broker = MockBroker::new();
        let pool = test_pool(&broker, quick_config().with_pooling(false));

        let first = ready_id(&pool, "broker-1:6650", "broker-1:6650").await;
        let second = ready_id(&pool, "broker-1:6650", "broker-1:6650").await;
        assert_ne!(first, second);
        assert_eq!(broker.dial_count("broker-1:6650"), 2);
        assert_eq!(pool.connection_count(), 2);
    }

    #[tokio::test]
    async fn test_connections_per_broker() {
        let broker = MockBroker::new();
        let pool = test_pool(&broker, quick_config().with_connections_per_broker(2));

        let mut ids = Vec::new();
        for _ in 0..4 {
            ids.push(ready_id(&pool, "broker-1:6650", "broker-1:6650").await);
        }
        assert_ne!(ids[0], ids[1]);
        assert_eq!(ids[0], ids[2]);
        assert_eq!(ids[1], ids[3]);
        assert_eq!(broker.dial_count("broker-1:6650"), 2);

        let mut keys: Vec<_> = pool
            .connections()
            .iter()
            .map(|cnx| cnx.pool_key().to_string())
            .collect();
        keys.sort();
        assert_eq!(keys, vec!["broker-1:6650-0", "broker-1:6650-1"]);
    }

    #[tokio::test]
    async fn test_failed_attempt_leaves_no_entry() {
        let broker = MockBroker::new();
        broker.set_behavior("broker-1:6650", DialBehavior::Refuse);
        let pool = test_pool(&broker, quick_config());

        assert!(pool.get("broker-1:6650").await.is_err());
        assert!(pool.get("broker-1:6650").await.is_err());
        assert_eq!(pool.connection_count(), 0);
        assert_eq!(broker.dial_count("broker-1:6650"), 2);
        assert_eq!(pool.reconnect_delay("broker-1:6650"), Duration::from_millis(200));
    }
}
