//! One websocket per room.
//!
//! A session announces its user on every (re)connect, forwards what the room
//! relays, and publishes this client's confirmed changes. While the socket is
//! down, published events wait in a bounded buffer and go out, in order,
//! right after the next announce.

use std::collections::VecDeque;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use parley_types::events::{DomainEvent, PresenceMessage};
use parley_types::models::{RoomId, User};

use crate::error::SyncError;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Gateway origin, e.g. `ws://127.0.0.1:3000`.
    pub base_url: String,
    pub max_reconnect_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Events kept while disconnected. The oldest are dropped past this.
    pub offline_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            base_url: "ws://127.0.0.1:3000".to_string(),
            max_reconnect_attempts: 8,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
            offline_buffer: 256,
        }
    }
}

impl SessionConfig {
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1 << exp)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    /// Closed on request.
    Closed,
    /// Gave up after the configured number of attempts.
    Failed,
}

/// Raw text received on a room socket.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub room: RoomId,
    pub raw: String,
}

pub struct SessionHandle {
    room: RoomId,
    outgoing: mpsc::UnboundedSender<String>,
    state: watch::Receiver<SessionState>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub fn room(&self) -> &RoomId {
        &self.room
    }

    /// Queue an event for the room. Never waits on the socket.
    pub fn publish(&self, event: &DomainEvent) -> Result<(), SyncError> {
        let raw = serde_json::to_string(event).map_err(|e| SyncError::Rejected(e.to_string()))?;
        self.outgoing.send(raw).map_err(|_| SyncError::SessionClosed)
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Announce departure and close the socket.
    pub async fn close(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!("session task for {} ended abnormally: {}", self.room, e);
        }
    }
}

/// Open a session for `room`. Everything the room relays is forwarded to
/// `inbound`.
pub fn spawn(
    room: RoomId,
    user: User,
    config: SessionConfig,
    inbound: mpsc::UnboundedSender<Inbound>,
) -> SessionHandle {
    let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(SessionState::Connecting);
    let cancel = CancellationToken::new();

    let task = SessionTask {
        room: room.clone(),
        user,
        config,
        inbound,
        outgoing: outgoing_rx,
        offline: VecDeque::new(),
        state: state_tx,
        cancel: cancel.clone(),
    };
    let task = tokio::spawn(task.run());

    SessionHandle {
        room,
        outgoing: outgoing_tx,
        state: state_rx,
        cancel,
        task,
    }
}

enum Ended {
    /// Closed on request, or nobody is left to talk to.
    Shutdown,
    /// Lost the socket. `heard` is set once the room sent anything at all.
    Dropped { reason: String, heard: bool },
}

impl Ended {
    fn dropped(reason: impl ToString) -> Self {
        Ended::Dropped {
            reason: reason.to_string(),
            heard: false,
        }
    }
}

struct SessionTask {
    room: RoomId,
    user: User,
    config: SessionConfig,
    inbound: mpsc::UnboundedSender<Inbound>,
    outgoing: mpsc::UnboundedReceiver<String>,
    offline: VecDeque<String>,
    state: watch::Sender<SessionState>,
    cancel: CancellationToken,
}

impl SessionTask {
    async fn run(mut self) {
        let url = format!(
            "{}/parties/chat/{}",
            self.config.base_url.trim_end_matches('/'),
            self.room
        );
        let mut attempt = 0u32;

        loop {
            let connected = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                connected = tokio_tungstenite::connect_async(url.as_str()) => connected,
            };

            match connected {
                Ok((socket, _)) => {
                    self.state.send_replace(SessionState::Connected);
                    info!("session for {} connected", self.room);
                    match self.pump(socket).await {
                        Ended::Shutdown => break,
                        Ended::Dropped { reason, heard } => {
                            warn!("session for {} dropped: {}", self.room, reason);
                            // A socket the gateway hangs up on before saying
                            // anything counts against the retry budget.
                            if heard {
                                attempt = 0;
                            }
                        }
                    }
                }
                Err(e) => warn!("session for {} failed to connect: {}", self.room, e),
            }

            attempt += 1;
            if attempt > self.config.max_reconnect_attempts {
                warn!("session for {} giving up after {} attempts", self.room, attempt - 1);
                self.outgoing.close();
                self.state.send_replace(SessionState::Failed);
                return;
            }
            self.state.send_replace(SessionState::Reconnecting { attempt });
            let delay = self.config.backoff(attempt);
            if !self.wait(delay).await {
                break;
            }
        }

        self.state.send_replace(SessionState::Closed);
        debug!("session for {} closed", self.room);
    }

    /// Sleep before the next attempt, buffering publishes meanwhile.
    /// Returns false if the session was closed while waiting.
    async fn wait(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return false,
                _ = &mut sleep => return true,
                raw = self.outgoing.recv() => match raw {
                    Some(raw) => self.buffer(raw),
                    None => return false,
                },
            }
        }
    }

    fn buffer(&mut self, raw: String) {
        if self.offline.len() >= self.config.offline_buffer {
            self.offline.pop_front();
            warn!("offline buffer for {} full, dropping oldest event", self.room);
        }
        self.offline.push_back(raw);
    }

    async fn pump(&mut self, socket: Socket) -> Ended {
        let (mut sink, mut stream) = socket.split();

        let hello = match serde_json::to_string(&PresenceMessage::AddUser(self.user.clone())) {
            Ok(hello) => hello,
            Err(e) => return Ended::dropped(e),
        };
        if let Err(e) = sink.send(Message::Text(hello.into())).await {
            return Ended::dropped(e);
        }

        if !self.offline.is_empty() {
            debug!("flushing {} buffered events to {}", self.offline.len(), self.room);
        }
        while let Some(raw) = self.offline.pop_front() {
            if let Err(e) = sink.send(Message::Text(raw.clone().into())).await {
                self.offline.push_front(raw);
                return Ended::dropped(e);
            }
        }

        let mut heard = false;
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.say_goodbye(&mut sink).await;
                    return Ended::Shutdown;
                }
                raw = self.outgoing.recv() => match raw {
                    Some(raw) => {
                        if let Err(e) = sink.send(Message::Text(raw.clone().into())).await {
                            self.buffer(raw);
                            return Ended::Dropped { reason: e.to_string(), heard };
                        }
                    }
                    None => {
                        self.say_goodbye(&mut sink).await;
                        return Ended::Shutdown;
                    }
                },
                incoming = stream.next() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        heard = true;
                        let frame = Inbound {
                            room: self.room.clone(),
                            raw: text.as_str().to_string(),
                        };
                        if self.inbound.send(frame).is_err() {
                            self.say_goodbye(&mut sink).await;
                            return Ended::Shutdown;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return Ended::Dropped { reason: "closed by gateway".to_string(), heard };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Ended::Dropped { reason: e.to_string(), heard },
                },
            }
        }
    }

    async fn say_goodbye<S>(&self, sink: &mut S)
    where
        S: futures_util::Sink<Message> + Unpin,
    {
        let bye = PresenceMessage::RemoveUser {
            id: self.user.id.clone(),
        };
        if let Ok(raw) = serde_json::to_string(&bye) {
            let _ = sink.send(Message::Text(raw.into())).await;
        }
        let _ = sink.close().await;
    }
}
