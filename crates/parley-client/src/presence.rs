use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use tokio::sync::watch;

use parley_types::models::{RoomId, User};

/// Latest presence roster per room. One place subscribes to the sockets;
/// views watch the board.
#[derive(Default)]
pub struct PresenceBoard {
    rooms: Mutex<HashMap<RoomId, watch::Sender<Vec<User>>>>,
}

impl PresenceBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, room: &RoomId) -> watch::Receiver<Vec<User>> {
        let mut rooms = self.rooms.lock().unwrap_or_else(PoisonError::into_inner);
        rooms
            .entry(room.clone())
            .or_insert_with(|| watch::channel(Vec::new()).0)
            .subscribe()
    }

    /// Replace a room's roster with a fresh snapshot.
    pub fn update(&self, room: &RoomId, users: Vec<User>) {
        let mut rooms = self.rooms.lock().unwrap_or_else(PoisonError::into_inner);
        match rooms.get(room) {
            Some(tx) => {
                tx.send_replace(users);
            }
            None => {
                rooms.insert(room.clone(), watch::channel(users).0);
            }
        }
    }

    pub fn current(&self, room: &RoomId) -> Vec<User> {
        let rooms = self.rooms.lock().unwrap_or_else(PoisonError::into_inner);
        rooms.get(room).map(|tx| tx.borrow().clone()).unwrap_or_default()
    }

    /// Forget a room whose session closed. Watchers see an empty roster.
    pub fn clear(&self, room: &RoomId) {
        let mut rooms = self.rooms.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = rooms.remove(room) {
            tx.send_replace(Vec::new());
        }
    }
}
