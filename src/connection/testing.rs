//! In-memory broker used by the connection tests.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::{Notify, mpsc};

use crate::auth::AuthDisabled;
use crate::codec::{read_frame, write_frame};
use crate::command::{Command, DEFAULT_MAX_FRAME_SIZE, PROTOCOL_VERSION};
use crate::error::{Error, Result};
use crate::executor::ExecutorProvider;

use super::cnx::{Connection, ConnectionListener};
use super::config::PoolConfig;
use super::pool::ConnectionPool;
use super::transport::{BoxedStream, DialFuture, Dialer};

/// How the broker reacts to a dial of a given target.
#[derive(Debug, Clone, Default)]
pub(crate) enum DialBehavior {
    /// Complete the handshake and answer pings.
    #[default]
    Accept,
    /// Fail the dial.
    Refuse,
    /// Never complete the dial.
    Hang,
    /// Fail the dial once the signal is notified.
    RefuseOnSignal(Arc<Notify>),
    /// Answer `Connect` with an `Error` frame.
    Reject(String),
    /// Accept the stream but never answer `Connect`.
    Silent,
    /// Complete the handshake but never answer pings.
    IgnorePings,
}

#[derive(Debug, Default)]
struct MockState {
    behaviors: HashMap<String, DialBehavior>,
    dials: HashMap<String, usize>,
    sessions: Vec<(String, Arc<Notify>)>,
}

#[derive(Debug, Default)]
pub(crate) struct MockBroker {
    state: Mutex<MockState>,
    connects: Arc<Mutex<Vec<Command>>>,
}

impl MockBroker {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub(crate) fn set_behavior(&self, target: &str, behavior: DialBehavior) {
        self.lock().behaviors.insert(target.to_string(), behavior);
    }

    pub(crate) fn dial_count(&self, target: &str) -> usize {
        self.lock().dials.get(target).copied().unwrap_or(0)
    }

    /// Every `Connect` command received, in arrival order.
    pub(crate) fn connects(&self) -> Vec<Command> {
        self.connects.lock().unwrap().clone()
    }

    /// Drop every open session to `target`.
    pub(crate) fn kill_sessions(&self, target: &str) {
        let mut state = self.lock();
        state.sessions.retain(|(session_target, kill)| {
            if session_target == target {
                kill.notify_one();
                false
            } else {
                true
            }
        });
    }
}

impl Dialer for MockBroker {
    fn dial<'a>(&'a self, target: &'a str) -> DialFuture<'a> {
        Box::pin(async move {
            let behavior = {
                let mut state = self.lock();
                *state.dials.entry(target.to_string()).or_default() += 1;
                state.behaviors.get(target).cloned().unwrap_or_default()
            };

            match behavior {
                DialBehavior::Refuse => Err(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    "connection refused",
                )),
                DialBehavior::Hang => std::future::pending::<io::Result<BoxedStream>>().await,
                DialBehavior::RefuseOnSignal(signal) => {
                    signal.notified().await;
                    Err(io::Error::new(
                        io::ErrorKind::ConnectionRefused,
                        "connection refused",
                    ))
                }
                behavior => {
                    let (client, server) = tokio::io::duplex(64 * 1024);
                    let kill = Arc::new(Notify::new());
                    self.lock()
                        .sessions
                        .push((target.to_string(), Arc::clone(&kill)));
                    let connects = Arc::clone(&self.connects);
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = kill.notified() => {}
                            _ = serve_session(server, behavior, connects) => {}
                        }
                    });
                    Ok(Box::new(client) as BoxedStream)
                }
            }
        })
    }
}

async fn serve_session(
    stream: DuplexStream,
    behavior: DialBehavior,
    connects: Arc<Mutex<Vec<Command>>>,
) -> Result<()> {
    let (mut reader, mut writer): (ReadHalf<DuplexStream>, WriteHalf<DuplexStream>) =
        tokio::io::split(stream);

    let connect = read_frame(&mut reader, DEFAULT_MAX_FRAME_SIZE).await?;
    connects.lock().unwrap().push(connect);

    match behavior {
        DialBehavior::Reject(message) => {
            let error = Command::Error { code: 1, message };
            return write_frame(&mut writer, &error).await;
        }
        DialBehavior::Silent => return std::future::pending().await,
        _ => {}
    }

    let connected = Command::Connected {
        server_version: "mock-broker".into(),
        protocol_version: PROTOCOL_VERSION,
        max_message_size: 5 * 1024 * 1024,
    };
    write_frame(&mut writer, &connected).await?;

    let answer_pings = !matches!(behavior, DialBehavior::IgnorePings);
    loop {
        if let Command::Ping = read_frame(&mut reader, DEFAULT_MAX_FRAME_SIZE).await? {
            if answer_pings {
                write_frame(&mut writer, &Command::Pong).await?;
            }
        }
    }
}

/// Pool config with keep-alive off and a short connect timeout.
pub(crate) fn quick_config() -> PoolConfig {
    let mut config = PoolConfig::default();
    config.connection_config = config
        .connection_config
        .without_keep_alive()
        .with_connect_timeout(Duration::from_secs(2));
    config
}

/// Pool on the test runtime dialing `broker`.
pub(crate) fn test_pool(broker: &Arc<MockBroker>, config: PoolConfig) -> ConnectionPool {
    ConnectionPool::with_dialer(
        config,
        Arc::new(ExecutorProvider::current()),
        Arc::new(AuthDisabled),
        Arc::clone(broker) as Arc<dyn Dialer>,
    )
}

/// Poll `condition` until it holds or `limit` elapses.
pub(crate) async fn wait_until<F>(limit: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Listener that forwards its id on every broken notification.
pub(crate) struct RecordingListener {
    id: u64,
    notify: mpsc::UnboundedSender<u64>,
    reasons: Mutex<Vec<Error>>,
}

impl RecordingListener {
    pub(crate) fn new(id: u64, notify: mpsc::UnboundedSender<u64>) -> Arc<Self> {
        Arc::new(Self {
            id,
            notify,
            reasons: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn reasons(&self) -> Vec<Error> {
        self.reasons.lock().unwrap().clone()
    }
}

impl ConnectionListener for RecordingListener {
    fn connection_closed(&self, _cnx: &Arc<Connection>, reason: &Error) {
        self.reasons.lock().unwrap().push(reason.clone());
        let _ = self.notify.send(self.id);
    }
}
