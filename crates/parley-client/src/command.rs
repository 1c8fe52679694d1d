//! Optimistic mutations.
//!
//! A command applies its guess to the cache, calls the message store, then
//! either confirms with the authoritative result or restores the slices it
//! captured beforehand. [`crate::store::SyncStore`] drives the sequence and
//! serializes commands that target the same message.

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use parley_types::api::{CreateMessage, DeletedMessage, ReactionSummary};
use parley_types::events::{ChannelEvent, DomainEvent, ThreadEvent};
use parley_types::models::{ChatMessage, GroupReaction, OPTIMISTIC_PREFIX, RoomId, RoomKind, User};

use crate::cache::{CacheSnapshot, SliceKey};
use crate::error::SyncError;
use crate::message_store::MessageStore;
use crate::pending::PendingCreate;
use crate::reconcile::{SyncState, bump_reaction};

/// An event to publish on a room after a mutation is confirmed.
#[derive(Debug, Clone, PartialEq)]
pub struct Outgoing {
    pub room: RoomId,
    pub event: DomainEvent,
}

impl Outgoing {
    pub fn new(room: RoomId, event: impl Into<DomainEvent>) -> Self {
        Self {
            room,
            event: event.into(),
        }
    }
}

#[async_trait]
pub trait Command: Send + Sync {
    type Output: Send + 'static;

    /// Message id this command is serialized on.
    fn target(&self) -> String;

    /// Cache slices to capture before `apply`.
    fn slices(&self, state: &SyncState) -> Vec<SliceKey>;

    fn apply(&mut self, state: &mut SyncState);

    async fn execute(&self, store: &dyn MessageStore) -> Result<Self::Output, SyncError>;

    /// Fold the store's answer into the cache and return what to publish.
    fn confirm(&mut self, state: &mut SyncState, output: &Self::Output) -> Vec<Outgoing>;

    fn rollback(&mut self, state: &mut SyncState, snapshot: CacheSnapshot) {
        state.cache.restore(snapshot);
    }

    /// The store no longer has the target. Undo the guess, then drop
    /// whatever is still cached under that id.
    fn vanished(&mut self, state: &mut SyncState, snapshot: CacheSnapshot) {
        self.rollback(state, snapshot);
        let target = self.target();
        state.cache.remove_everywhere(&target);
        state.cache.evict_thread(&target);
    }
}

// -- create --

/// Post a message, or a thread reply when `thread_id` is set.
#[derive(Debug, Clone)]
pub struct CreateMessageCmd {
    input: CreateMessage,
    author: User,
    temp_id: String,
    op_id: String,
}

impl CreateMessageCmd {
    pub fn new(input: CreateMessage, author: User) -> Self {
        Self {
            input,
            author,
            temp_id: format!("{}{}", OPTIMISTIC_PREFIX, Uuid::new_v4()),
            op_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn temp_id(&self) -> &str {
        &self.temp_id
    }

    fn placeholder(&self) -> ChatMessage {
        let now = Utc::now();
        ChatMessage {
            id: self.temp_id.clone(),
            content: Some(self.input.content.clone()),
            image_url: self.input.image_url.clone(),
            created_at: now,
            updated_at: now,
            author_id: self.author.id.clone(),
            author_email: self.author.email.clone(),
            author_name: self.author.full_name.clone(),
            author_avatar: self.author.picture.clone(),
            channel_id: Some(self.input.channel_id.clone()),
            thread_id: self.input.thread_id.clone(),
            reactions: Vec::new(),
            reply_count: 0,
        }
    }
}

#[async_trait]
impl Command for CreateMessageCmd {
    type Output = ChatMessage;

    fn target(&self) -> String {
        self.temp_id.clone()
    }

    fn slices(&self, _state: &SyncState) -> Vec<SliceKey> {
        vec![SliceKey::Message(self.temp_id.clone())]
    }

    fn apply(&mut self, state: &mut SyncState) {
        state.pending.begin_create(
            &self.temp_id,
            PendingCreate {
                channel_id: self.input.channel_id.clone(),
                thread_id: self.input.thread_id.clone(),
                op_id: self.op_id.clone(),
            },
        );
        let placeholder = self.placeholder();
        match &self.input.thread_id {
            None => state
                .cache
                .channel_entry(&self.input.channel_id)
                .push_newest(placeholder),
            Some(thread_id) => {
                if let Some(view) = state.cache.thread_mut(thread_id) {
                    view.replies.push_newest(placeholder);
                }
                state.bump_replies(thread_id, 1);
            }
        }
    }

    async fn execute(&self, store: &dyn MessageStore) -> Result<ChatMessage, SyncError> {
        store.create_message(self.input.clone()).await
    }

    fn confirm(&mut self, state: &mut SyncState, created: &ChatMessage) -> Vec<Outgoing> {
        state.pending.confirm_create(&self.temp_id, &created.id);
        let channel_room = RoomId::channel(&self.input.channel_id);

        let Some(thread_id) = self.input.thread_id.clone() else {
            if let Some(window) = state.cache.channel_mut(&self.input.channel_id) {
                if !window.replace(&self.temp_id, created.clone()) {
                    window.upsert(created.clone());
                }
            }
            return vec![Outgoing::new(
                channel_room,
                ChannelEvent::MessageCreated {
                    message: created.clone(),
                },
            )];
        };

        if let Some(view) = state.cache.thread_mut(&thread_id) {
            if !view.replies.replace(&self.temp_id, created.clone()) {
                view.replies.upsert(created.clone());
            }
        }
        state.pending.record_increment(&channel_room, &self.op_id);
        vec![
            Outgoing::new(
                RoomId::thread(&thread_id),
                ThreadEvent::ReplyCreated {
                    reply: created.clone(),
                },
            ),
            Outgoing::new(
                channel_room,
                ChannelEvent::RepliesIncrement {
                    message_id: thread_id,
                    delta: 1,
                    op_id: Some(self.op_id.clone()),
                },
            ),
        ]
    }

    fn rollback(&mut self, state: &mut SyncState, snapshot: CacheSnapshot) {
        state.cache.restore(snapshot);
        state.pending.abandon_create(&self.temp_id);
        if let Some(thread_id) = &self.input.thread_id {
            state.bump_replies(thread_id, -1);
        }
    }
}

// -- update --

/// Replace a message's text. The cache only changes once the store accepts it.
#[derive(Debug, Clone)]
pub struct UpdateMessageCmd {
    id: String,
    content: String,
}

impl UpdateMessageCmd {
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
        }
    }
}

#[async_trait]
impl Command for UpdateMessageCmd {
    type Output = ChatMessage;

    fn target(&self) -> String {
        self.id.clone()
    }

    fn slices(&self, _state: &SyncState) -> Vec<SliceKey> {
        Vec::new()
    }

    fn apply(&mut self, state: &mut SyncState) {
        state.pending.begin_edit(&self.id);
    }

    async fn execute(&self, store: &dyn MessageStore) -> Result<ChatMessage, SyncError> {
        store.update_message(&self.id, &self.content).await
    }

    fn confirm(&mut self, state: &mut SyncState, updated: &ChatMessage) -> Vec<Outgoing> {
        let deferred = state.pending.finish_edit(&self.id);
        state.merge_update(updated);
        if let Some(remote) = deferred.filter(|m| m.updated_at > updated.updated_at) {
            state.merge_update(&remote);
        }
        match &updated.channel_id {
            Some(channel_id) => vec![Outgoing::new(
                RoomId::channel(channel_id),
                ChannelEvent::MessageUpdated {
                    message: updated.clone(),
                },
            )],
            None => Vec::new(),
        }
    }

    fn rollback(&mut self, state: &mut SyncState, _snapshot: CacheSnapshot) {
        if let Some(remote) = state.pending.finish_edit(&self.id) {
            state.merge_update(&remote);
        }
    }
}

// -- delete --

/// Remove a message. Removing a reply lowers its parent's count; removing a
/// parent drops its cached thread.
#[derive(Debug, Clone)]
pub struct DeleteMessageCmd {
    id: String,
    /// Parent whose count `apply` lowered.
    parent: Option<String>,
}

impl DeleteMessageCmd {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            parent: None,
        }
    }
}

#[async_trait]
impl Command for DeleteMessageCmd {
    type Output = DeletedMessage;

    fn target(&self) -> String {
        self.id.clone()
    }

    // The parent is not captured. Rollback reverses only this decrement.
    fn slices(&self, _state: &SyncState) -> Vec<SliceKey> {
        vec![
            SliceKey::Message(self.id.clone()),
            SliceKey::Thread(self.id.clone()),
        ]
    }

    fn apply(&mut self, state: &mut SyncState) {
        state.pending.tombstone(&self.id);
        self.parent = state.cache.find(&self.id).and_then(|m| m.thread_id.clone());
        state.apply_delete(&self.id, self.parent.as_deref(), false);
    }

    async fn execute(&self, store: &dyn MessageStore) -> Result<DeletedMessage, SyncError> {
        store.delete_message(&self.id).await
    }

    fn confirm(&mut self, state: &mut SyncState, deleted: &DeletedMessage) -> Vec<Outgoing> {
        if deleted.has_replies {
            state.cache.evict_thread(&deleted.message_id);
        }
        vec![Outgoing::new(
            RoomId::channel(&deleted.channel_id),
            ChannelEvent::MessageDeleted {
                message_id: deleted.message_id.clone(),
                thread_id: deleted.thread_id.clone(),
                has_replies: deleted.has_replies,
            },
        )]
    }

    fn rollback(&mut self, state: &mut SyncState, snapshot: CacheSnapshot) {
        state.cache.restore(snapshot);
        state.pending.revive(&self.id);
        if let Some(parent) = &self.parent {
            state.bump_replies(parent, 1);
        }
    }

    /// Someone else got there first. The optimistic removal already matches
    /// the store, and the tombstone keeps their relayed delete from counting
    /// twice.
    fn vanished(&mut self, state: &mut SyncState, _snapshot: CacheSnapshot) {
        state.cache.evict_thread(&self.id);
    }
}

// -- reactions --

/// Toggle this viewer's reaction on one emoji.
#[derive(Debug, Clone)]
pub struct ToggleReactionCmd {
    message_id: String,
    emoji: String,
    rooms: Vec<RoomId>,
    /// Reaction list before and after the guess.
    guess: Option<(Vec<GroupReaction>, Vec<GroupReaction>)>,
}

impl ToggleReactionCmd {
    pub fn new(message_id: impl Into<String>, emoji: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            emoji: emoji.into(),
            rooms: Vec::new(),
            guess: None,
        }
    }

    /// Rooms whose members can see this message: the thread room for a
    /// reply, otherwise the channel room plus the thread room when the
    /// message heads an open thread.
    fn audience(&self, state: &SyncState) -> Vec<RoomId> {
        let Some(msg) = state.cache.find(&self.message_id) else {
            return Vec::new();
        };
        if let Some(thread_id) = &msg.thread_id {
            return vec![RoomId::thread(thread_id)];
        }
        let mut rooms = Vec::new();
        if let Some(channel_id) = &msg.channel_id {
            rooms.push(RoomId::channel(channel_id));
        }
        if state.cache.thread(&self.message_id).is_some() {
            rooms.push(RoomId::thread(&self.message_id));
        }
        rooms
    }
}

#[async_trait]
impl Command for ToggleReactionCmd {
    type Output = ReactionSummary;

    fn target(&self) -> String {
        self.message_id.clone()
    }

    // Only the reaction list is touched, and only that is put back.
    fn slices(&self, _state: &SyncState) -> Vec<SliceKey> {
        Vec::new()
    }

    fn apply(&mut self, state: &mut SyncState) {
        self.rooms = self.audience(state);
        self.guess = state.cache.find(&self.message_id).map(|msg| {
            let before = msg.reactions.clone();
            let mut after = before.clone();
            bump_reaction(&mut after, &self.emoji);
            (before, after)
        });
        let emoji = &self.emoji;
        state
            .cache
            .update_copies(&self.message_id, |msg| bump_reaction(&mut msg.reactions, emoji));
    }

    async fn execute(&self, store: &dyn MessageStore) -> Result<ReactionSummary, SyncError> {
        store.toggle_reaction(&self.message_id, &self.emoji).await
    }

    fn confirm(&mut self, state: &mut SyncState, summary: &ReactionSummary) -> Vec<Outgoing> {
        state.replace_reactions(&summary.message_id, &summary.reactions);
        self.rooms
            .iter()
            .map(|room| match room.kind {
                RoomKind::Channel => Outgoing::new(
                    room.clone(),
                    ChannelEvent::ReactionUpdated {
                        message_id: summary.message_id.clone(),
                        reactions: summary.reactions.clone(),
                    },
                ),
                RoomKind::Thread => Outgoing::new(
                    room.clone(),
                    ThreadEvent::ReactionUpdated {
                        message_id: summary.message_id.clone(),
                        reactions: summary.reactions.clone(),
                        thread_id: room.id.clone(),
                    },
                ),
            })
            .collect()
    }

    /// Put back the list as it was when nothing else touched it since the
    /// guess; otherwise flip this viewer's reaction back on top of what
    /// arrived meanwhile.
    fn rollback(&mut self, state: &mut SyncState, _snapshot: CacheSnapshot) {
        let Some((before, after)) = self.guess.take() else {
            return;
        };
        let emoji = &self.emoji;
        state.cache.update_copies(&self.message_id, |msg| {
            if msg.reactions == after {
                msg.reactions = before.clone();
            } else {
                bump_reaction(&mut msg.reactions, emoji);
            }
        });
    }
}
