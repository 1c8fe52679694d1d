use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use parley_types::events::{Frame, PresenceMessage};
use parley_types::models::{RoomId, User};

use crate::command::Outgoing;
use crate::error::SyncError;
use crate::presence::PresenceBoard;
use crate::session::{self, Inbound, SessionConfig, SessionHandle, SessionState};
use crate::store::SyncStore;

/// Wires a [`SyncStore`] to the hub: one session for the active channel, one
/// for the open thread, presence rosters for both, and the two pumps that
/// carry confirmed local changes out and remote events in.
#[derive(Clone)]
pub struct RealtimeClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    store: SyncStore,
    presence: PresenceBoard,
    config: SessionConfig,
    sessions: AsyncMutex<HashMap<RoomId, SessionHandle>>,
    focus: Mutex<Focus>,
    inbound: mpsc::UnboundedSender<Inbound>,
    cancel: CancellationToken,
    pumps: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Default)]
struct Focus {
    channel: Option<String>,
    thread: Option<String>,
}

impl RealtimeClient {
    /// Start the pumps. `outbox` is the receiver returned by [`SyncStore::new`].
    pub fn start(
        store: SyncStore,
        outbox: mpsc::UnboundedReceiver<Outgoing>,
        config: SessionConfig,
    ) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let client = Self {
            inner: Arc::new(ClientInner {
                store,
                presence: PresenceBoard::new(),
                config,
                sessions: AsyncMutex::new(HashMap::new()),
                focus: Mutex::new(Focus::default()),
                inbound: inbound_tx,
                cancel: CancellationToken::new(),
                pumps: Mutex::new(Vec::new()),
            }),
        };

        let outbound = tokio::spawn(client.clone().pump_outbox(outbox));
        let inbound = tokio::spawn(client.clone().pump_inbound(inbound_rx));
        client
            .inner
            .pumps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([outbound, inbound]);
        client
    }

    pub fn store(&self) -> &SyncStore {
        &self.inner.store
    }

    pub fn presence(&self, room: &RoomId) -> watch::Receiver<Vec<User>> {
        self.inner.presence.subscribe(room)
    }

    pub async fn session_state(&self, room: &RoomId) -> Option<SessionState> {
        self.inner.sessions.lock().await.get(room).map(SessionHandle::state)
    }

    /// Switch to a channel: close the previous channel's session, join the
    /// new room, then fetch its first page.
    pub async fn open_channel(&self, channel_id: &str) -> Result<(), SyncError> {
        let previous = self.set_focus(|focus| focus.channel.replace(channel_id.to_string()));
        if let Some(previous) = previous.filter(|p| p != channel_id) {
            self.close_room(&RoomId::channel(&previous)).await;
            self.inner.store.clear_channel(&previous);
        }
        self.open_room(RoomId::channel(channel_id)).await;
        self.inner.store.load_channel(channel_id).await
    }

    pub async fn open_thread(&self, thread_id: &str) -> Result<(), SyncError> {
        let previous = self.set_focus(|focus| focus.thread.replace(thread_id.to_string()));
        if let Some(previous) = previous.filter(|p| p != thread_id) {
            self.close_room(&RoomId::thread(&previous)).await;
            self.inner.store.close_thread(&previous);
        }
        self.open_room(RoomId::thread(thread_id)).await;
        self.inner.store.load_thread(thread_id).await
    }

    pub async fn close_thread(&self) {
        if let Some(thread_id) = self.set_focus(|focus| focus.thread.take()) {
            self.close_room(&RoomId::thread(&thread_id)).await;
            self.inner.store.close_thread(&thread_id);
        }
    }

    /// Close every session and stop the pumps.
    pub async fn shutdown(&self) {
        let sessions: Vec<SessionHandle> = {
            let mut sessions = self.inner.sessions.lock().await;
            sessions.drain().map(|(_, handle)| handle).collect()
        };
        for handle in sessions {
            self.inner.presence.clear(handle.room());
            handle.close().await;
        }
        self.inner.cancel.cancel();
        let pumps: Vec<JoinHandle<()>> = self
            .inner
            .pumps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for pump in pumps {
            if let Err(e) = pump.await {
                warn!("realtime pump ended abnormally: {}", e);
            }
        }
        info!("realtime client shut down");
    }

    fn set_focus<R>(&self, f: impl FnOnce(&mut Focus) -> R) -> R {
        let mut focus = self.inner.focus.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut focus)
    }

    async fn open_room(&self, room: RoomId) {
        let mut sessions = self.inner.sessions.lock().await;
        match sessions.get(&room).map(SessionHandle::state) {
            Some(SessionState::Failed | SessionState::Closed) => {
                info!("replacing ended session for {}", room);
                if let Some(stale) = sessions.remove(&room) {
                    stale.close().await;
                }
            }
            Some(_) => return,
            None => debug!("opening session for {}", room),
        }
        let handle = session::spawn(
            room.clone(),
            self.inner.store.me().clone(),
            self.inner.config.clone(),
            self.inner.inbound.clone(),
        );
        sessions.insert(room, handle);
    }

    async fn close_room(&self, room: &RoomId) {
        let handle = self.inner.sessions.lock().await.remove(room);
        if let Some(handle) = handle {
            handle.close().await;
        }
        self.inner.presence.clear(room);
    }

    async fn pump_outbox(self, mut outbox: mpsc::UnboundedReceiver<Outgoing>) {
        loop {
            let outgoing = tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                outgoing = outbox.recv() => match outgoing {
                    Some(outgoing) => outgoing,
                    None => break,
                },
            };
            let sessions = self.inner.sessions.lock().await;
            match sessions.get(&outgoing.room) {
                Some(handle) => {
                    if let Err(e) = handle.publish(&outgoing.event) {
                        warn!("could not publish to {}: {}", outgoing.room, e);
                    }
                }
                None => debug!("no session for {}, not publishing", outgoing.room),
            }
        }
    }

    async fn pump_inbound(self, mut inbound: mpsc::UnboundedReceiver<Inbound>) {
        loop {
            let Inbound { room, raw } = tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                inbound = inbound.recv() => match inbound {
                    Some(inbound) => inbound,
                    None => break,
                },
            };
            match Frame::parse(&raw) {
                Ok(Frame::Presence(PresenceMessage::Presence { users })) => {
                    self.inner.presence.update(&room, users);
                }
                Ok(Frame::Presence(other)) => {
                    debug!("ignoring client presence message on {}: {:?}", room, other);
                }
                Ok(Frame::Channel(event)) => {
                    self.inner.store.apply_event(&room, event.into());
                }
                Ok(Frame::Thread(event)) => {
                    self.inner.store.apply_event(&room, event.into());
                }
                Err(e) => warn!("dropping frame on {}: {}", room, SyncError::from(e)),
            }
        }
    }
}
