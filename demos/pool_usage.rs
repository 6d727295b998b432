//! Connection pool example.
//!
//! This example starts a tiny in-process broker, then shows how the pool
//! shares connections per logical address and how a handler reconnects
//! after the broker drops its session.
//!
//! Run with: cargo run --example pool_usage
//! Set RUST_LOG=brokerpool=debug for the lifecycle logs.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use brokerpool::codec::{read_frame, write_frame};
use brokerpool::command::DEFAULT_MAX_FRAME_SIZE;
use brokerpool::connection::HandlerConfig;
use brokerpool::{
    AsyncResult, AttachmentKind, AuthToken, Command, Connection, ConnectionPool, Error,
    Handler, HandlerCallbacks, PROTOCOL_VERSION, PoolConfig, StaticAddress,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

async fn serve_session(socket: TcpStream, peer: SocketAddr) -> brokerpool::Result<()> {
    let (mut reader, mut writer) = socket.into_split();
    let connect = read_frame(&mut reader, DEFAULT_MAX_FRAME_SIZE).await?;
    println!("[broker] {peer} sent {:?}", connect.command_type());
    let connected = Command::Connected {
        server_version: "demo-broker".into(),
        protocol_version: PROTOCOL_VERSION,
        max_message_size: 5 * 1024 * 1024,
    };
    write_frame(&mut writer, &connected).await?;
    loop {
        if read_frame(&mut reader, DEFAULT_MAX_FRAME_SIZE).await? == Command::Ping {
            write_frame(&mut writer, &Command::Pong).await?;
        }
    }
}

/// Accepts sessions, answers pings, and drops every session when told to.
async fn run_broker(listener: TcpListener, mut kill: mpsc::UnboundedReceiver<()>) {
    let (drop_tx, _) = tokio::sync::broadcast::channel::<()>(4);
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let Ok((socket, peer)) = accepted else { return };
                let mut dropped = drop_tx.subscribe();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = dropped.recv() => println!("[broker] dropping session with {peer}"),
                        _ = serve_session(socket, peer) => {}
                    }
                });
            }
            Some(()) = kill.recv() => {
                let _ = drop_tx.send(());
            }
        }
    }
}

struct DemoProducer {
    attached: mpsc::UnboundedSender<u64>,
}

impl HandlerCallbacks for DemoProducer {
    fn name(&self) -> &str {
        "demo-producer"
    }

    fn connection_opened(&self, cnx: &Arc<Connection>) -> AsyncResult<()> {
        println!("[producer] attached to {cnx} (connection #{})", cnx.id());
        let _ = self.attached.send(cnx.id());
        AsyncResult::ready(Ok(()))
    }

    fn connection_failed(&self, error: &Error) {
        println!("[producer] connection attempt failed: {error}");
    }
}

#[tokio::main]
async fn main() -> brokerpool::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("=== Broker Connection Pool ===\n");

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let address = listener.local_addr()?.to_string();
    let (kill_tx, kill_rx) = mpsc::unbounded_channel();
    tokio::spawn(run_broker(listener, kill_rx));

    let pool = ConnectionPool::create(
        PoolConfig::default().with_io_threads(2),
        Arc::new(AuthToken::from_token("demo-token")),
    )?;

    // Example 1: concurrent requests share one connection
    println!("--- Example 1: Sharing ---");
    let first = pool.get(&address);
    let second = pool.get(&address);
    let (first, second) = (first.await?, second.await?);
    if let (Some(a), Some(b)) = (first.upgrade(), second.upgrade()) {
        println!("both requests got connection #{} and #{}", a.id(), b.id());
        println!("server version: {:?}", a.server_version());
    }
    println!("pooled connections: {}\n", pool.connection_count());

    // Example 2: a handler reconnects when the broker drops the session
    println!("--- Example 2: Reconnection ---");
    let (attached_tx, mut attached_rx) = mpsc::unbounded_channel();
    let producer = Arc::new(DemoProducer {
        attached: attached_tx,
    });
    let callbacks: Weak<dyn HandlerCallbacks> = Arc::downgrade(&producer) as Weak<dyn HandlerCallbacks>;
    let handler = Handler::new(
        pool.clone(),
        address.clone(),
        Arc::new(StaticAddress(address.clone())),
        AttachmentKind::Producer,
        callbacks,
        HandlerConfig::default(),
    );
    handler.start();
    attached_rx.recv().await;

    let _ = kill_tx.send(());
    attached_rx.recv().await;
    println!("handler state after reconnect: {:?}\n", handler.state());

    // Example 3: closing
    println!("--- Example 3: Shutdown ---");
    handler.close();
    pool.close();
    let after = pool.get(&address).await;
    println!("request after close: {:?}", after.err());

    tokio::time::sleep(Duration::from_millis(50)).await;
    Ok(())
}
