use std::collections::HashMap;

use uuid::Uuid;

use parley_types::models::User;

/// Presence state for the connections attached to one room.
///
/// The table stores only what each connection announced. The roster handed
/// to clients is always recomputed from it, so there is no second copy that
/// could drift.
#[derive(Debug, Default)]
pub struct PresenceTable {
    attached: HashMap<Uuid, Attachment>,
    next_seq: u64,
}

#[derive(Debug)]
struct Attachment {
    seq: u64,
    user: Option<User>,
}

impl PresenceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a connection with no presence yet.
    pub fn attach(&mut self, conn_id: Uuid) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.attached
            .entry(conn_id)
            .or_insert(Attachment { seq, user: None });
    }

    /// Set the user announced by a connection, replacing any earlier one.
    /// Returns false if the connection is not attached.
    pub fn announce(&mut self, conn_id: Uuid, user: User) -> bool {
        match self.attached.get_mut(&conn_id) {
            Some(attachment) => {
                attachment.user = Some(user);
                true
            }
            None => false,
        }
    }

    /// Forget the user announced by a connection; the connection stays attached.
    pub fn clear(&mut self, conn_id: Uuid) -> bool {
        match self.attached.get_mut(&conn_id) {
            Some(attachment) => attachment.user.take().is_some(),
            None => false,
        }
    }

    /// Detach a connection. Returns the user it had announced, if any.
    pub fn detach(&mut self, conn_id: Uuid) -> Option<User> {
        self.attached.remove(&conn_id).and_then(|a| a.user)
    }

    pub fn is_empty(&self) -> bool {
        self.attached.is_empty()
    }

    pub fn len(&self) -> usize {
        self.attached.len()
    }

    /// Users present in the room, one entry per user id.
    ///
    /// Entries are ordered by the first connection (in attach order) that
    /// announced each id, and carry the profile of the most recently attached
    /// connection for that id.
    pub fn roster(&self) -> Vec<User> {
        let mut ordered: Vec<&Attachment> = self.attached.values().collect();
        ordered.sort_by_key(|a| a.seq);
        roster(ordered.into_iter().filter_map(|a| a.user.as_ref()))
    }
}

/// Dedup-by-id over users in connection order: first position, last value.
pub fn roster<'a>(users: impl IntoIterator<Item = &'a User>) -> Vec<User> {
    let mut out: Vec<User> = Vec::new();
    for user in users {
        match out.iter_mut().find(|u| u.id == user.id) {
            Some(existing) => *existing = user.clone(),
            None => out.push(user.clone()),
        }
    }
    out
}
