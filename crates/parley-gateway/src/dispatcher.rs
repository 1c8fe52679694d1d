use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use parley_types::models::{RoomId, User};

use crate::room::{Outbound, Room, RoomCommand, RoomHandle};

/// Routes connections to per-room actors.
///
/// The registry lock only guards the room-id -> handle map. It is held to
/// look up, spawn or retire a room, never while a room handles an event, so
/// rooms run fully independently of each other.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    /// Live rooms: room id -> actor handle
    rooms: RwLock<HashMap<RoomId, RoomHandle>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                rooms: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Attach a connection to a room, spawning the room on first join.
    /// The room immediately queues a presence snapshot on `tx`.
    pub async fn join(
        &self,
        room_id: RoomId,
        conn_id: Uuid,
        tx: mpsc::UnboundedSender<Outbound>,
    ) -> RoomHandle {
        {
            let rooms = self.inner.rooms.read().await;
            if let Some(handle) = rooms.get(&room_id) {
                if send_join(handle, conn_id, &tx) {
                    return handle.clone();
                }
            }
        }

        let mut rooms = self.inner.rooms.write().await;
        if let Some(handle) = rooms.get(&room_id) {
            if send_join(handle, conn_id, &tx) {
                return handle.clone();
            }
        }

        let handle = Room::spawn(room_id.clone(), self.clone());
        send_join(&handle, conn_id, &tx);
        rooms.insert(room_id, handle.clone());
        handle
    }

    /// Called by a room actor once it has no members. Either hands back a
    /// command that raced in (and the room keeps running) or removes the
    /// room from the registry.
    pub(crate) async fn retire(
        &self,
        room_id: &RoomId,
        token: Uuid,
        rx: &mut mpsc::UnboundedReceiver<RoomCommand>,
    ) -> Option<RoomCommand> {
        let mut rooms = self.inner.rooms.write().await;
        if let Ok(cmd) = rx.try_recv() {
            return Some(cmd);
        }
        if rooms.get(room_id).is_some_and(|h| h.token == token) {
            rooms.remove(room_id);
        }
        None
    }

    /// Current roster of a room, or `None` if nobody is connected to it.
    pub async fn roster(&self, room_id: &RoomId) -> Option<Vec<User>> {
        let handle = self.inner.rooms.read().await.get(room_id).cloned()?;
        handle.roster().await
    }

    /// Number of live rooms.
    pub async fn room_count(&self) -> usize {
        self.inner.rooms.read().await.len()
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

fn send_join(handle: &RoomHandle, conn_id: Uuid, tx: &mpsc::UnboundedSender<Outbound>) -> bool {
    handle
        .tx
        .send(RoomCommand::Join {
            conn_id,
            tx: tx.clone(),
        })
        .is_ok()
}
