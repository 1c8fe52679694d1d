use std::collections::HashMap;

use parley_types::models::ChatMessage;

/// Sort order of a feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedOrder {
    /// Channel feed: `(createdAt desc, id desc)`.
    NewestFirst,
    /// Thread feed: `(createdAt asc, id asc)`.
    OldestFirst,
}

/// An ordered run of cached messages plus the cursor for the next older page.
/// Ids are unique within a window.
#[derive(Debug, Clone, PartialEq)]
pub struct Window {
    order: FeedOrder,
    items: Vec<ChatMessage>,
    next_cursor: Option<String>,
}

impl Window {
    pub fn new(order: FeedOrder) -> Self {
        Self {
            order,
            items: Vec::new(),
            next_cursor: None,
        }
    }

    pub fn channel() -> Self {
        Self::new(FeedOrder::NewestFirst)
    }

    pub fn thread() -> Self {
        Self::new(FeedOrder::OldestFirst)
    }

    pub fn order(&self) -> FeedOrder {
        self.order
    }

    pub fn items(&self) -> &[ChatMessage] {
        &self.items
    }

    pub fn next_cursor(&self) -> Option<&str> {
        self.next_cursor.as_deref()
    }

    pub fn has_more(&self) -> bool {
        self.next_cursor.is_some()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.items.iter().position(|m| m.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.position(id).is_some()
    }

    pub fn get(&self, id: &str) -> Option<&ChatMessage> {
        self.items.iter().find(|m| m.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut ChatMessage> {
        self.items.iter_mut().find(|m| m.id == id)
    }

    /// Replace the contents with a freshly fetched first page. Optimistic
    /// entries that are still waiting on the store survive the refresh.
    pub fn reset(&mut self, items: Vec<ChatMessage>, next_cursor: Option<String>) {
        let optimistic: Vec<ChatMessage> = self
            .items
            .drain(..)
            .filter(ChatMessage::is_optimistic)
            .collect();
        self.next_cursor = next_cursor;
        for msg in items {
            self.upsert(msg);
        }
        match self.order {
            FeedOrder::NewestFirst => {
                let fetched = std::mem::replace(&mut self.items, optimistic);
                self.items.extend(fetched);
            }
            FeedOrder::OldestFirst => self.items.extend(optimistic),
        }
    }

    /// Append an older page at the far end. Returns how many entries were new.
    pub fn append_page(&mut self, items: Vec<ChatMessage>, next_cursor: Option<String>) -> usize {
        self.next_cursor = next_cursor;
        let before = self.items.len();
        for msg in items {
            if !self.contains(&msg.id) {
                self.items.push(msg);
            }
        }
        self.items.len() - before
    }

    /// Put a locally created entry where the newest message is shown.
    pub fn push_newest(&mut self, msg: ChatMessage) {
        match self.order {
            FeedOrder::NewestFirst => self.items.insert(0, msg),
            FeedOrder::OldestFirst => self.items.push(msg),
        }
    }

    /// Insert at the sorted position, or overwrite in place if the id is
    /// already cached. Returns true if a new entry was added.
    pub fn upsert(&mut self, msg: ChatMessage) -> bool {
        if let Some(existing) = self.get_mut(&msg.id) {
            *existing = msg;
            return false;
        }
        let order = self.order;
        let index = self
            .items
            .iter()
            .position(|m| precedes(order, &msg, m))
            .unwrap_or(self.items.len());
        self.items.insert(index, msg);
        true
    }

    /// Swap the entry `old_id` for `msg` at the same position. If `msg.id`
    /// is already cached elsewhere the old entry is dropped instead, so a
    /// durable id never appears twice.
    pub fn replace(&mut self, old_id: &str, msg: ChatMessage) -> bool {
        let Some(old_pos) = self.position(old_id) else {
            return false;
        };
        if msg.id != old_id {
            if let Some(dup) = self.position(&msg.id) {
                self.items[dup] = msg;
                self.items.remove(old_pos);
                return true;
            }
        }
        self.items[old_pos] = msg;
        true
    }

    pub fn remove(&mut self, id: &str) -> Option<(usize, ChatMessage)> {
        let pos = self.position(id)?;
        Some((pos, self.items.remove(pos)))
    }

    /// Put an entry back at a recorded index (clamped to the current length).
    fn insert_at(&mut self, index: usize, msg: ChatMessage) {
        if let Some(existing) = self.get_mut(&msg.id) {
            *existing = msg;
            return;
        }
        let index = index.min(self.items.len());
        self.items.insert(index, msg);
    }
}

/// Whether `a` belongs before `b` in a feed of the given order.
fn precedes(order: FeedOrder, a: &ChatMessage, b: &ChatMessage) -> bool {
    let a_key = (a.created_at, a.id.as_str());
    let b_key = (b.created_at, b.id.as_str());
    match order {
        FeedOrder::NewestFirst => a_key > b_key,
        FeedOrder::OldestFirst => a_key < b_key,
    }
}

/// A thread panel: the parent message and its replies, oldest first.
#[derive(Debug, Clone, PartialEq)]
pub struct ThreadView {
    pub parent: ChatMessage,
    pub replies: Window,
}

/// Where one copy of a message lives in the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    Channel { channel_id: String, index: usize },
    ThreadParent { thread_id: String },
    ThreadReply { thread_id: String, index: usize },
}

/// Part of the cache a mutation captures before touching it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SliceKey {
    /// Every cached copy of one message (or its absence).
    Message(String),
    /// A whole thread view (or its absence).
    Thread(String),
}

#[derive(Debug, Clone)]
enum Slice {
    Message {
        id: String,
        copies: Vec<(Location, ChatMessage)>,
    },
    Thread {
        thread_id: String,
        view: Option<ThreadView>,
    },
}

/// Prior state of the slices a mutation touched. Restoring it puts exactly
/// those slices back and leaves the rest of the cache alone.
#[derive(Debug, Clone)]
pub struct CacheSnapshot {
    slices: Vec<Slice>,
}

/// Cached views for every open channel and thread.
#[derive(Debug, Clone, Default)]
pub struct SyncCache {
    channels: HashMap<String, Window>,
    threads: HashMap<String, ThreadView>,
}

impl SyncCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn channel(&self, channel_id: &str) -> Option<&Window> {
        self.channels.get(channel_id)
    }

    pub fn channel_mut(&mut self, channel_id: &str) -> Option<&mut Window> {
        self.channels.get_mut(channel_id)
    }

    /// The channel window, created empty if this is the first thing seen for it.
    pub fn channel_entry(&mut self, channel_id: &str) -> &mut Window {
        self.channels
            .entry(channel_id.to_string())
            .or_insert_with(Window::channel)
    }

    pub fn drop_channel(&mut self, channel_id: &str) -> bool {
        self.channels.remove(channel_id).is_some()
    }

    pub fn thread(&self, thread_id: &str) -> Option<&ThreadView> {
        self.threads.get(thread_id)
    }

    pub fn thread_mut(&mut self, thread_id: &str) -> Option<&mut ThreadView> {
        self.threads.get_mut(thread_id)
    }

    /// Install a fetched thread. Optimistic replies already cached for it are kept.
    pub fn set_thread(&mut self, thread_id: &str, parent: ChatMessage, replies: Vec<ChatMessage>) {
        let view = self
            .threads
            .entry(thread_id.to_string())
            .or_insert_with(|| ThreadView {
                parent: parent.clone(),
                replies: Window::thread(),
            });
        view.parent = parent;
        view.replies.reset(replies, None);
    }

    pub fn evict_thread(&mut self, thread_id: &str) -> Option<ThreadView> {
        self.threads.remove(thread_id)
    }

    /// First cached copy of a message, looking at channel feeds, thread
    /// parents, then thread replies.
    pub fn find(&self, id: &str) -> Option<&ChatMessage> {
        self.channels
            .values()
            .find_map(|w| w.get(id))
            .or_else(|| self.threads.get(id).map(|t| &t.parent))
            .or_else(|| self.threads.values().find_map(|t| t.replies.get(id)))
    }

    /// Apply `f` to every cached copy of a message. Returns how many copies
    /// were touched.
    pub fn update_copies(&mut self, id: &str, mut f: impl FnMut(&mut ChatMessage)) -> usize {
        let mut touched = 0;
        for window in self.channels.values_mut() {
            if let Some(msg) = window.get_mut(id) {
                f(msg);
                touched += 1;
            }
        }
        for view in self.threads.values_mut() {
            if view.parent.id == id {
                f(&mut view.parent);
                touched += 1;
            }
            if let Some(msg) = view.replies.get_mut(id) {
                f(msg);
                touched += 1;
            }
        }
        touched
    }

    /// Remove a message from every feed it appears in. Thread parents are
    /// not touched here; a deleted parent's thread is evicted separately.
    pub fn remove_everywhere(&mut self, id: &str) -> Option<ChatMessage> {
        let mut removed = None;
        for window in self.channels.values_mut() {
            if let Some((_, msg)) = window.remove(id) {
                removed.get_or_insert(msg);
            }
        }
        for view in self.threads.values_mut() {
            if let Some((_, msg)) = view.replies.remove(id) {
                removed.get_or_insert(msg);
            }
        }
        removed
    }

    /// Every location holding a copy of the message.
    pub fn locate(&self, id: &str) -> Vec<(Location, ChatMessage)> {
        let mut copies = Vec::new();
        for (channel_id, window) in &self.channels {
            if let Some(index) = window.position(id) {
                copies.push((
                    Location::Channel {
                        channel_id: channel_id.clone(),
                        index,
                    },
                    window.items[index].clone(),
                ));
            }
        }
        for (thread_id, view) in &self.threads {
            if view.parent.id == id {
                copies.push((
                    Location::ThreadParent {
                        thread_id: thread_id.clone(),
                    },
                    view.parent.clone(),
                ));
            }
            if let Some(index) = view.replies.position(id) {
                copies.push((
                    Location::ThreadReply {
                        thread_id: thread_id.clone(),
                        index,
                    },
                    view.replies.items[index].clone(),
                ));
            }
        }
        copies
    }

    pub fn snapshot(&self, keys: &[SliceKey]) -> CacheSnapshot {
        let slices = keys
            .iter()
            .map(|key| match key {
                SliceKey::Message(id) => Slice::Message {
                    id: id.clone(),
                    copies: self.locate(id),
                },
                SliceKey::Thread(thread_id) => Slice::Thread {
                    thread_id: thread_id.clone(),
                    view: self.threads.get(thread_id).cloned(),
                },
            })
            .collect();
        CacheSnapshot { slices }
    }

    pub fn restore(&mut self, snapshot: CacheSnapshot) {
        for slice in snapshot.slices.into_iter().rev() {
            match slice {
                Slice::Thread { thread_id, view } => match view {
                    Some(view) => {
                        self.threads.insert(thread_id, view);
                    }
                    None => {
                        self.threads.remove(&thread_id);
                    }
                },
                Slice::Message { id, mut copies } => {
                    self.remove_everywhere(&id);
                    copies.sort_by_key(|(location, _)| match location {
                        Location::Channel { index, .. } | Location::ThreadReply { index, .. } => *index,
                        Location::ThreadParent { .. } => 0,
                    });
                    for (location, msg) in copies {
                        self.put_back(location, msg);
                    }
                }
            }
        }
    }

    fn put_back(&mut self, location: Location, msg: ChatMessage) {
        match location {
            Location::Channel { channel_id, index } => {
                self.channel_entry(&channel_id).insert_at(index, msg);
            }
            Location::ThreadParent { thread_id } => {
                if let Some(view) = self.threads.get_mut(&thread_id) {
                    view.parent = msg;
                }
            }
            Location::ThreadReply { thread_id, index } => {
                if let Some(view) = self.threads.get_mut(&thread_id) {
                    view.replies.insert_at(index, msg);
                }
            }
        }
    }
}
