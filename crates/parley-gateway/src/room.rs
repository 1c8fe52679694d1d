use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use parley_types::events::{Frame, PresenceMessage};
use parley_types::models::{RoomId, User};

use crate::dispatcher::Dispatcher;
use crate::presence::PresenceTable;

/// A text frame queued for one connection. Shared so a relay to N members
/// allocates once.
pub type Outbound = Arc<str>;

pub(crate) enum RoomCommand {
    Join {
        conn_id: Uuid,
        tx: mpsc::UnboundedSender<Outbound>,
    },
    Inbound {
        conn_id: Uuid,
        raw: String,
    },
    Leave {
        conn_id: Uuid,
    },
    Roster {
        reply: oneshot::Sender<Vec<User>>,
    },
}

/// Cheap handle to a running room actor.
#[derive(Clone)]
pub struct RoomHandle {
    room_id: RoomId,
    /// Distinguishes this actor from a later one spawned for the same room id.
    pub(crate) token: Uuid,
    pub(crate) tx: mpsc::UnboundedSender<RoomCommand>,
}

impl RoomHandle {
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Queue raw socket text from a member. Returns false if the room is gone.
    pub fn inbound(&self, conn_id: Uuid, raw: String) -> bool {
        self.tx.send(RoomCommand::Inbound { conn_id, raw }).is_ok()
    }

    pub fn leave(&self, conn_id: Uuid) {
        let _ = self.tx.send(RoomCommand::Leave { conn_id });
    }

    pub async fn roster(&self) -> Option<Vec<User>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(RoomCommand::Roster { reply }).ok()?;
        rx.await.ok()
    }
}

/// The actor that owns one room's membership. Every command for the room is
/// handled here, one at a time, so a roster recompute and the broadcast that
/// follows it are never interleaved with another event of the same room.
pub(crate) struct Room {
    id: RoomId,
    token: Uuid,
    dispatcher: Dispatcher,
    members: HashMap<Uuid, mpsc::UnboundedSender<Outbound>>,
    presence: PresenceTable,
}

impl Room {
    /// Spawn a room actor and return its handle.
    pub(crate) fn spawn(id: RoomId, dispatcher: Dispatcher) -> RoomHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let token = Uuid::new_v4();
        let room = Room {
            id: id.clone(),
            token,
            dispatcher,
            members: HashMap::new(),
            presence: PresenceTable::new(),
        };
        tokio::spawn(room.run(rx));
        RoomHandle {
            room_id: id,
            token,
            tx,
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<RoomCommand>) {
        info!("room {} opened", self.id);

        while let Some(cmd) = rx.recv().await {
            let mut next = Some(cmd);
            while let Some(cmd) = next.take() {
                self.handle(cmd);
                if self.members.is_empty() {
                    next = self.dispatcher.retire(&self.id, self.token, &mut rx).await;
                    if next.is_none() {
                        info!("room {} closed (last member left)", self.id);
                        return;
                    }
                }
            }
        }
    }

    fn handle(&mut self, cmd: RoomCommand) {
        match cmd {
            RoomCommand::Join { conn_id, tx } => self.join(conn_id, tx),
            RoomCommand::Inbound { conn_id, raw } => self.handle_inbound(conn_id, &raw),
            RoomCommand::Leave { conn_id } => self.leave(conn_id),
            RoomCommand::Roster { reply } => {
                let _ = reply.send(self.presence.roster());
            }
        }
    }

    fn join(&mut self, conn_id: Uuid, tx: mpsc::UnboundedSender<Outbound>) {
        self.presence.attach(conn_id);
        self.members.insert(conn_id, tx);
        debug!("{} joined room {} ({} members)", conn_id, self.id, self.members.len());

        if let Some(snapshot) = self.presence_frame() {
            self.send_to(conn_id, snapshot);
        }
    }

    fn leave(&mut self, conn_id: Uuid) {
        if self.members.remove(&conn_id).is_none() {
            return;
        }
        let user = self.presence.detach(conn_id);
        debug!(
            "{} left room {} (user {:?}, {} members)",
            conn_id,
            self.id,
            user.map(|u| u.id),
            self.members.len()
        );
        self.broadcast_presence();
    }

    fn handle_inbound(&mut self, conn_id: Uuid, raw: &str) {
        if !self.members.contains_key(&conn_id) {
            debug!("dropping frame from {} which is not in room {}", conn_id, self.id);
            return;
        }

        match Frame::parse(raw) {
            Ok(Frame::Presence(PresenceMessage::AddUser(user))) => {
                debug!("{} announced {} in room {}", conn_id, user.id, self.id);
                self.presence.announce(conn_id, user);
                self.broadcast_presence();
            }
            Ok(Frame::Presence(PresenceMessage::RemoveUser { id })) => {
                debug!("{} withdrew {} in room {}", conn_id, id, self.id);
                self.presence.clear(conn_id);
                self.broadcast_presence();
            }
            Ok(Frame::Presence(PresenceMessage::Presence { .. })) => {
                warn!("{} sent a presence snapshot to room {}, dropping", conn_id, self.id);
            }
            Ok(Frame::Channel(_)) | Ok(Frame::Thread(_)) => self.relay(conn_id, raw),
            Err(e) => {
                warn!(
                    "room {} bad frame from {}: {} -- raw: {}",
                    self.id,
                    conn_id,
                    e,
                    &raw[..floor_char_boundary(raw, 200)]
                );
            }
        }
    }

    /// Forward the frame as received to every member except its sender.
    fn relay(&self, from: Uuid, raw: &str) {
        let frame: Outbound = Arc::from(raw);
        let mut delivered = 0usize;
        for (conn_id, tx) in &self.members {
            if *conn_id == from {
                continue;
            }
            if tx.send(frame.clone()).is_ok() {
                delivered += 1;
            }
        }
        trace!("room {} relayed frame from {} to {} members", self.id, from, delivered);
    }

    fn broadcast_presence(&self) {
        let Some(snapshot) = self.presence_frame() else {
            return;
        };
        for tx in self.members.values() {
            let _ = tx.send(snapshot.clone());
        }
    }

    fn send_to(&self, conn_id: Uuid, frame: Outbound) {
        if let Some(tx) = self.members.get(&conn_id) {
            let _ = tx.send(frame);
        }
    }

    fn presence_frame(&self) -> Option<Outbound> {
        let snapshot = PresenceMessage::Presence {
            users: self.presence.roster(),
        };
        match serde_json::to_string(&snapshot) {
            Ok(json) => Some(Arc::from(json)),
            Err(e) => {
                error!("room {} failed to encode presence snapshot: {}", self.id, e);
                None
            }
        }
    }
}

fn floor_char_boundary(s: &str, max: usize) -> usize {
    if s.len() <= max {
        return s.len();
    }
    (0..=max).rev().find(|&i| s.is_char_boundary(i)).unwrap_or(0)
}
