use std::collections::{HashMap, HashSet, VecDeque};

use parley_types::models::{ChatMessage, RoomId};

/// How many confirmed or deleted ids are remembered for echo detection.
const RECENT_CAPACITY: usize = 512;

/// Bounded set of recently seen ids. Oldest entries fall out first.
#[derive(Debug, Clone)]
pub struct RecentIds {
    order: VecDeque<String>,
    ids: HashSet<String>,
    capacity: usize,
}

impl RecentIds {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            ids: HashSet::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn insert(&mut self, id: &str) {
        if !self.ids.insert(id.to_string()) {
            return;
        }
        self.order.push_back(id.to_string());
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.ids.remove(&old);
            }
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn remove(&mut self, id: &str) -> bool {
        if !self.ids.remove(id) {
            return false;
        }
        self.order.retain(|x| x != id);
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl Default for RecentIds {
    fn default() -> Self {
        Self::with_capacity(RECENT_CAPACITY)
    }
}

/// A create this session has applied optimistically and not yet settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCreate {
    pub channel_id: String,
    pub thread_id: Option<String>,
    pub op_id: String,
}

/// Bookkeeping for this session's own operations, used to recognize their
/// echoes when the hub relays them back.
#[derive(Debug, Clone)]
pub struct PendingOps {
    echo_guard: bool,
    creates: HashMap<String, PendingCreate>,
    confirmed: RecentIds,
    increments: RecentIds,
    tombstones: RecentIds,
    editing: HashMap<String, Option<ChatMessage>>,
}

impl PendingOps {
    pub fn new(echo_guard: bool) -> Self {
        Self {
            echo_guard,
            creates: HashMap::new(),
            confirmed: RecentIds::default(),
            increments: RecentIds::default(),
            tombstones: RecentIds::default(),
            editing: HashMap::new(),
        }
    }

    pub fn echo_guard(&self) -> bool {
        self.echo_guard
    }

    // -- creates --

    pub fn begin_create(&mut self, temp_id: &str, create: PendingCreate) {
        self.creates.insert(temp_id.to_string(), create);
    }

    pub fn pending_create(&self, temp_id: &str) -> Option<&PendingCreate> {
        self.creates.get(temp_id)
    }

    /// Settle a create. The durable id is remembered so a later
    /// `message:created` or `thread:reply:created` for it counts as an echo.
    pub fn confirm_create(&mut self, temp_id: &str, durable_id: &str) -> Option<PendingCreate> {
        let create = self.creates.remove(temp_id)?;
        if self.echo_guard {
            self.confirmed.insert(durable_id);
        }
        Some(create)
    }

    pub fn abandon_create(&mut self, temp_id: &str) -> Option<PendingCreate> {
        self.creates.remove(temp_id)
    }

    pub fn is_own_create(&self, id: &str) -> bool {
        self.echo_guard && self.confirmed.contains(id)
    }

    // -- reply-count increments --

    /// Remember an increment this session published so its relay is ignored.
    pub fn record_increment(&mut self, room: &RoomId, op_id: &str) {
        if self.echo_guard {
            self.increments.insert(&increment_key(room, op_id));
        }
    }

    /// True (once) if the increment was published by this session.
    pub fn take_increment(&mut self, room: &RoomId, op_id: &str) -> bool {
        if !self.echo_guard {
            return false;
        }
        self.increments.remove(&increment_key(room, op_id))
    }

    // -- deletes --

    pub fn tombstone(&mut self, id: &str) {
        self.tombstones.insert(id);
    }

    pub fn is_tombstoned(&self, id: &str) -> bool {
        self.tombstones.contains(id)
    }

    pub fn revive(&mut self, id: &str) {
        self.tombstones.remove(id);
    }

    // -- edits --

    pub fn begin_edit(&mut self, id: &str) {
        self.editing.insert(id.to_string(), None);
    }

    pub fn is_editing(&self, id: &str) -> bool {
        self.editing.contains_key(id)
    }

    /// Hold a remote update for a message this session is editing. The newest
    /// one wins.
    pub fn defer_update(&mut self, message: ChatMessage) {
        if let Some(slot) = self.editing.get_mut(&message.id) {
            let newer = slot
                .as_ref()
                .is_none_or(|held| held.updated_at <= message.updated_at);
            if newer {
                *slot = Some(message);
            }
        }
    }

    /// End an edit, handing back any remote update that arrived meanwhile.
    pub fn finish_edit(&mut self, id: &str) -> Option<ChatMessage> {
        self.editing.remove(id).flatten()
    }
}

fn increment_key(room: &RoomId, op_id: &str) -> String {
    format!("{}#{}", room, op_id)
}

impl Default for PendingOps {
    fn default() -> Self {
        Self::new(true)
    }
}
