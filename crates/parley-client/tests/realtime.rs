//! Full loop over real sockets: client sessions against the gateway router.

mod common;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::extract::WebSocketUpgrade;
use axum::routing::get;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use common::{MemoryStore, create, store_for};
use parley_client::RealtimeClient;
use parley_client::session::{self, SessionConfig, SessionState};
use parley_client::store::StoreConfig;
use parley_gateway::connection::ConnectionConfig;
use parley_gateway::dispatcher::Dispatcher;
use parley_gateway::routes::{GatewayState, router};
use parley_types::models::{RoomId, User};

async fn serve(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn start_gateway() -> SocketAddr {
    let state = GatewayState {
        dispatcher: Dispatcher::new(),
        config: ConnectionConfig::default(),
    };
    serve(router(state)).await
}

fn ws_url(addr: SocketAddr) -> String {
    format!("ws://{}", addr)
}

fn client_with(backend: &MemoryStore, config: SessionConfig) -> RealtimeClient {
    let (store, outbox) = store_for(backend, StoreConfig::default());
    RealtimeClient::start(store, outbox, config)
}

fn client_for(backend: &MemoryStore, base_url: &str) -> RealtimeClient {
    client_with(
        backend,
        SessionConfig {
            base_url: base_url.to_string(),
            initial_backoff: Duration::from_millis(20),
            ..SessionConfig::default()
        },
    )
}

/// TCP forwarder in front of the gateway whose links can be cut, and which
/// can refuse new links for a while.
struct Relay {
    addr: SocketAddr,
    open: Arc<AtomicBool>,
    links: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Relay {
    async fn start(upstream: SocketAddr) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let open = Arc::new(AtomicBool::new(true));
        let links = Arc::new(Mutex::new(Vec::new()));

        let (accepting, tracked) = (Arc::clone(&open), Arc::clone(&links));
        tokio::spawn(async move {
            while let Ok((mut client, _)) = listener.accept().await {
                if !accepting.load(Ordering::SeqCst) {
                    continue;
                }
                let link = tokio::spawn(async move {
                    if let Ok(mut server) = TcpStream::connect(upstream).await {
                        let _ = tokio::io::copy_bidirectional(&mut client, &mut server).await;
                    }
                });
                tracked.lock().unwrap().push(link);
            }
        });
        Self { addr, open, links }
    }

    /// Drop every live link and refuse new ones.
    fn cut(&self) {
        self.open.store(false, Ordering::SeqCst);
        for link in self.links.lock().unwrap().drain(..) {
            link.abort();
        }
    }

    fn reopen(&self) {
        self.open.store(true, Ordering::SeqCst);
    }
}

async fn roster_reaches(roster: &mut watch::Receiver<Vec<User>>, len: usize) -> bool {
    tokio::time::timeout(Duration::from_secs(5), roster.wait_for(|users| users.len() == len))
        .await
        .is_ok_and(|r| r.is_ok())
}

async fn state_reaches(
    client: &RealtimeClient,
    room: &RoomId,
    wanted: impl Fn(SessionState) -> bool,
) -> bool {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if client.session_state(room).await.is_some_and(&wanted) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok()
}

#[tokio::test]
async fn messages_and_presence_flow_between_two_clients() {
    let base_url = ws_url(start_gateway().await);
    let backend = MemoryStore::new("alice");
    let alice = client_for(&backend, &base_url);
    let bob = client_for(&backend.as_user("bob"), &base_url);
    let channel = RoomId::channel("c1");

    alice.open_channel("c1").await.unwrap();
    bob.open_channel("c1").await.unwrap();

    let mut roster = alice.presence(&channel);
    let both_here = tokio::time::timeout(
        Duration::from_secs(5),
        roster.wait_for(|users| users.len() == 2),
    )
    .await
    .is_ok_and(|r| r.is_ok());
    assert!(both_here);
    assert_eq!(alice.session_state(&channel).await, Some(SessionState::Connected));

    let mut changes = bob.store().subscribe_changes();
    let hello = alice
        .store()
        .create_message(create("c1", "hello"))
        .await
        .unwrap();

    let arrived = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if bob.store().message(&hello.id).is_some() {
                break;
            }
            if changes.changed().await.is_err() {
                break;
            }
        }
    })
    .await;
    assert!(arrived.is_ok());
    assert_eq!(bob.store().channel_messages("c1").len(), 1);

    bob.shutdown().await;
    let alone = tokio::time::timeout(
        Duration::from_secs(5),
        roster.wait_for(|users| users.len() == 1),
    )
    .await
    .is_ok_and(|r| r.is_ok());
    assert!(alone);

    alice.shutdown().await;
}

#[tokio::test]
async fn a_dropped_session_reconnects_and_flushes_what_was_published_offline() {
    let gateway = start_gateway().await;
    let relay = Relay::start(gateway).await;
    let backend = MemoryStore::new("alice");
    let alice = client_for(&backend, &ws_url(gateway));
    let bob = client_with(
        &backend.as_user("bob"),
        SessionConfig {
            base_url: ws_url(relay.addr),
            max_reconnect_attempts: 50,
            initial_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_millis(100),
            ..SessionConfig::default()
        },
    );
    let channel = RoomId::channel("c1");

    alice.open_channel("c1").await.unwrap();
    bob.open_channel("c1").await.unwrap();
    let mut roster = alice.presence(&channel);
    assert!(roster_reaches(&mut roster, 2).await);

    relay.cut();
    assert!(roster_reaches(&mut roster, 1).await);
    assert!(state_reaches(&bob, &channel, |s| matches!(s, SessionState::Reconnecting { .. })).await);

    // Confirmed while the socket is down: waits in the offline buffer.
    let note = bob
        .store()
        .create_message(create("c1", "written offline"))
        .await
        .unwrap();
    assert!(alice.store().message(&note.id).is_none());

    relay.reopen();
    assert!(roster_reaches(&mut roster, 2).await);
    assert!(state_reaches(&bob, &channel, |s| s == SessionState::Connected).await);

    let mut changes = alice.store().subscribe_changes();
    let arrived = tokio::time::timeout(Duration::from_secs(5), async {
        while alice.store().message(&note.id).is_none() {
            if changes.changed().await.is_err() {
                break;
            }
        }
    })
    .await;
    assert!(arrived.is_ok());
    assert!(alice.store().message(&note.id).is_some());

    bob.shutdown().await;
    alice.shutdown().await;
}

#[tokio::test]
async fn reopening_a_failed_channel_starts_a_fresh_session() {
    let gateway = start_gateway().await;
    let relay = Relay::start(gateway).await;
    let backend = MemoryStore::new("alice");
    let alice = client_for(&backend, &ws_url(gateway));
    let bob = client_with(
        &backend.as_user("bob"),
        SessionConfig {
            base_url: ws_url(relay.addr),
            max_reconnect_attempts: 2,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(10),
            ..SessionConfig::default()
        },
    );
    let channel = RoomId::channel("c1");

    alice.open_channel("c1").await.unwrap();
    bob.open_channel("c1").await.unwrap();
    let mut roster = alice.presence(&channel);
    assert!(roster_reaches(&mut roster, 2).await);

    relay.cut();
    assert!(state_reaches(&bob, &channel, |s| s == SessionState::Failed).await);
    assert!(roster_reaches(&mut roster, 1).await);

    relay.reopen();
    bob.open_channel("c1").await.unwrap();
    assert!(roster_reaches(&mut roster, 2).await);
    assert!(state_reaches(&bob, &channel, |s| s == SessionState::Connected).await);

    bob.shutdown().await;
    alice.shutdown().await;
}

#[tokio::test]
async fn a_gateway_that_hangs_up_at_once_uses_up_the_retries() {
    let app = Router::new().route(
        "/parties/chat/{room}",
        get(|ws: WebSocketUpgrade| async move { ws.on_upgrade(|socket| async move { drop(socket) }) }),
    );
    let addr = serve(app).await;
    let config = SessionConfig {
        base_url: ws_url(addr),
        max_reconnect_attempts: 3,
        initial_backoff: Duration::from_millis(5),
        max_backoff: Duration::from_millis(10),
        ..SessionConfig::default()
    };
    let (inbound_tx, _inbound_rx) = mpsc::unbounded_channel();
    let session = session::spawn(RoomId::channel("c1"), User::new("u1"), config, inbound_tx);

    let mut states = session.state_changes();
    let failed = tokio::time::timeout(
        Duration::from_secs(5),
        states.wait_for(|s| *s == SessionState::Failed),
    )
    .await
    .is_ok_and(|r| r.is_ok());
    assert!(failed);
    session.close().await;
}
