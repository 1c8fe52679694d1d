use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tracing::{debug, info, warn};

use parley_types::api::{
    CreateMessage, DEFAULT_PAGE_LIMIT, DeletedMessage, MAX_PAGE_LIMIT, ReactionSummary,
    SearchQuery, SearchResults,
};
use parley_types::events::DomainEvent;
use parley_types::models::{ChatMessage, RoomId, RoomKind, User};

use crate::cache::ThreadView;
use crate::command::{
    Command, CreateMessageCmd, DeleteMessageCmd, Outgoing, ToggleReactionCmd, UpdateMessageCmd,
};
use crate::error::SyncError;
use crate::message_store::MessageStore;
use crate::reconcile::{EventOutcome, SyncState};

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Channel page size, capped at the store's maximum.
    pub page_limit: u32,
    /// Recognize relays of this session's own creates and increments.
    pub echo_guard: bool,
    /// Pages a seek may load before giving up.
    pub seek_attempts: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            page_limit: DEFAULT_PAGE_LIMIT,
            echo_guard: true,
            seek_attempts: 10,
        }
    }
}

/// Cached channel and thread views for one signed-in user.
///
/// Reads never wait on the network. Mutations go through [`Command`]s, which
/// hold a per-message lock for their whole apply/execute/settle sequence, so
/// two writes to the same message never interleave. Events to publish after a
/// confirmed write are pushed onto the outbox returned by [`SyncStore::new`].
#[derive(Clone)]
pub struct SyncStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    backend: Arc<dyn MessageStore>,
    me: User,
    config: StoreConfig,
    state: Mutex<SyncState>,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    outbox: mpsc::UnboundedSender<Outgoing>,
    changes: watch::Sender<u64>,
}

impl SyncStore {
    pub fn new(
        backend: Arc<dyn MessageStore>,
        me: User,
        config: StoreConfig,
    ) -> (Self, mpsc::UnboundedReceiver<Outgoing>) {
        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        let (changes, _) = watch::channel(0);
        let state = SyncState::new(config.echo_guard);
        let store = Self {
            inner: Arc::new(StoreInner {
                backend,
                me,
                config,
                state: Mutex::new(state),
                locks: Mutex::new(HashMap::new()),
                outbox,
                changes,
            }),
        };
        (store, outbox_rx)
    }

    pub fn me(&self) -> &User {
        &self.inner.me
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// Ticks whenever cached data changes.
    pub fn subscribe_changes(&self) -> watch::Receiver<u64> {
        self.inner.changes.subscribe()
    }

    // -- loading --

    /// Fetch the newest page of a channel, replacing what is cached.
    pub async fn load_channel(&self, channel_id: &str) -> Result<(), SyncError> {
        let page = self
            .inner
            .backend
            .list_messages(channel_id, None, self.page_limit())
            .await?;
        debug!("loaded {} messages for channel {}", page.items.len(), channel_id);
        self.with_state(|state| {
            let items = live(state, page.items);
            state.cache.channel_entry(channel_id).reset(items, page.next_cursor);
        });
        self.notify();
        Ok(())
    }

    /// Fetch the next older page. Returns false when the feed is exhausted.
    pub async fn load_older(&self, channel_id: &str) -> Result<bool, SyncError> {
        let cursor = self.with_state(|state| {
            state
                .cache
                .channel(channel_id)
                .map(|w| w.next_cursor().map(str::to_string))
        });
        let cursor = match cursor {
            // Never loaded: the first page is the older page.
            None => {
                self.load_channel(channel_id).await?;
                return Ok(true);
            }
            Some(None) => return Ok(false),
            Some(Some(cursor)) => cursor,
        };

        let page = self
            .inner
            .backend
            .list_messages(channel_id, Some(&cursor), self.page_limit())
            .await?;
        let added = self.with_state(|state| {
            let items = live(state, page.items);
            state
                .cache
                .channel_entry(channel_id)
                .append_page(items, page.next_cursor)
        });
        debug!("channel {}: {} older messages", channel_id, added);
        self.notify();
        Ok(true)
    }

    pub async fn load_thread(&self, thread_id: &str) -> Result<(), SyncError> {
        let thread = self.inner.backend.list_thread_replies(thread_id).await?;
        self.with_state(|state| {
            let replies = live(state, thread.messages);
            state.cache.set_thread(thread_id, thread.parent, replies);
        });
        self.notify();
        Ok(())
    }

    pub fn clear_channel(&self, channel_id: &str) {
        self.with_state(|state| state.cache.drop_channel(channel_id));
        self.notify();
    }

    pub fn close_thread(&self, thread_id: &str) {
        self.with_state(|state| state.cache.evict_thread(thread_id));
        self.notify();
    }

    // -- reads --

    pub fn channel_messages(&self, channel_id: &str) -> Vec<ChatMessage> {
        self.with_state(|state| {
            state
                .cache
                .channel(channel_id)
                .map(|w| w.items().to_vec())
                .unwrap_or_default()
        })
    }

    pub fn has_more(&self, channel_id: &str) -> bool {
        self.with_state(|state| state.cache.channel(channel_id).is_some_and(|w| w.has_more()))
    }

    pub fn thread(&self, thread_id: &str) -> Option<ThreadView> {
        self.with_state(|state| state.cache.thread(thread_id).cloned())
    }

    pub fn message(&self, id: &str) -> Option<ChatMessage> {
        self.with_state(|state| state.cache.find(id).cloned())
    }

    pub(crate) fn channel_position(&self, channel_id: &str, id: &str) -> Option<usize> {
        self.with_state(|state| state.cache.channel(channel_id).and_then(|w| w.position(id)))
    }

    // -- mutations --

    /// Post a message, or a reply when `input.thread_id` is set.
    pub async fn create_message(&self, input: CreateMessage) -> Result<ChatMessage, SyncError> {
        self.run(CreateMessageCmd::new(input, self.inner.me.clone()))
            .await
    }

    pub async fn update_message(&self, id: &str, content: &str) -> Result<ChatMessage, SyncError> {
        self.run(UpdateMessageCmd::new(id, content)).await
    }

    pub async fn delete_message(&self, id: &str) -> Result<DeletedMessage, SyncError> {
        self.run(DeleteMessageCmd::new(id)).await
    }

    pub async fn toggle_reaction(
        &self,
        message_id: &str,
        emoji: &str,
    ) -> Result<ReactionSummary, SyncError> {
        self.run(ToggleReactionCmd::new(message_id, emoji)).await
    }

    pub async fn search(&self, query: SearchQuery) -> Result<SearchResults, SyncError> {
        query
            .validate()
            .map_err(|reason| SyncError::Rejected(reason.to_string()))?;
        self.inner.backend.search_messages(query).await
    }

    // -- remote events --

    /// Fold an event received on `room` into the cache.
    pub fn apply_event(&self, room: &RoomId, event: DomainEvent) -> EventOutcome {
        let outcome = self.with_state(|state| match (room.kind, event) {
            (RoomKind::Channel, DomainEvent::Channel(event)) => {
                state.apply_channel_event(room, event)
            }
            (RoomKind::Thread, DomainEvent::Thread(event)) => state.apply_thread_event(room, event),
            (_, event) => {
                warn!("dropping {:?} received on room {}", event, room);
                EventOutcome::Ignored
            }
        });
        match outcome {
            EventOutcome::Applied => self.notify(),
            EventOutcome::Echo => debug!("ignoring echo on room {}", room),
            EventOutcome::Deferred => debug!("deferring update on room {} until local edit settles", room),
            EventOutcome::Ignored => {}
        }
        outcome
    }

    // -- internals --

    /// Run a command to completion. It is driven on its own task so the
    /// store call settles and the cache is confirmed or rolled back even if
    /// the caller stops waiting.
    pub async fn run<C>(&self, command: C) -> Result<C::Output, SyncError>
    where
        C: Command + 'static,
    {
        let store = self.clone();
        tokio::spawn(async move { store.drive(command).await })
            .await
            .map_err(|e| SyncError::Interrupted(e.to_string()))?
    }

    async fn drive<C: Command>(&self, mut command: C) -> Result<C::Output, SyncError> {
        let target = command.target();
        let lock = self.lock_for(&target);
        let guard = lock.lock().await;

        let snapshot = self.with_state(|state| {
            let snapshot = state.cache.snapshot(&command.slices(state));
            command.apply(state);
            snapshot
        });
        self.notify();

        let result = match command.execute(self.inner.backend.as_ref()).await {
            Ok(output) => {
                let outgoing = self.with_state(|state| command.confirm(state, &output));
                for event in outgoing {
                    if self.inner.outbox.send(event).is_err() {
                        debug!("outbox closed, not publishing change to {}", target);
                    }
                }
                Ok(output)
            }
            Err(err) => {
                self.with_state(|state| match &err {
                    SyncError::NotFound(_) => command.vanished(state, snapshot),
                    _ => command.rollback(state, snapshot),
                });
                if cfg!(debug_assertions) {
                    warn!("rolled back {}: {:?}", target, err);
                } else {
                    info!("rolled back a change: {}", err.user_message());
                }
                Err(err)
            }
        };
        self.notify();

        drop(guard);
        self.release_lock(&target, lock);
        result
    }

    fn lock_for(&self, id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.inner.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(id.to_string()).or_default())
    }

    fn release_lock(&self, id: &str, lock: Arc<AsyncMutex<()>>) {
        let mut locks = self.inner.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // Only the map and this caller still hold it.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(id);
        }
    }

    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut SyncState) -> R) -> R {
        let mut state = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    fn notify(&self) {
        self.inner.changes.send_modify(|tick| *tick = tick.wrapping_add(1));
    }

    fn page_limit(&self) -> u32 {
        self.inner.config.page_limit.clamp(1, MAX_PAGE_LIMIT)
    }
}

/// Drop fetched rows this session has already deleted.
fn live(state: &SyncState, items: Vec<ChatMessage>) -> Vec<ChatMessage> {
    items
        .into_iter()
        .filter(|m| !state.pending.is_tombstoned(&m.id))
        .collect()
}
