#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use parley_client::store::{StoreConfig, SyncStore};
use parley_client::{MessageStore, SyncError};
use parley_client::command::Outgoing;
use parley_types::api::{
    CreateMessage, DeletedMessage, MessagePage, ReactionSummary, SearchQuery, SearchResults,
    ThreadReplies,
};
use parley_types::models::{ChatMessage, User, group_reactions};
use tokio::sync::mpsc;

#[derive(Default)]
struct Db {
    messages: Vec<ChatMessage>,
    reactions: Vec<(String, String, String)>,
    next_id: u64,
    clock: i64,
    fail_next: Option<SyncError>,
    delay: Duration,
}

impl Db {
    fn tick(&mut self) -> DateTime<Utc> {
        self.clock += 1;
        Utc.timestamp_opt(1_700_000_000 + self.clock, 0).unwrap()
    }

    fn insert(&mut self, channel_id: &str, thread_id: Option<&str>, author: &str, content: &str) -> ChatMessage {
        self.next_id += 1;
        let now = self.tick();
        let msg = ChatMessage {
            id: format!("m{:04}", self.next_id),
            content: Some(content.to_string()),
            image_url: None,
            created_at: now,
            updated_at: now,
            author_id: author.to_string(),
            author_email: None,
            author_name: None,
            author_avatar: None,
            channel_id: Some(channel_id.to_string()),
            thread_id: thread_id.map(str::to_string),
            reactions: Vec::new(),
            reply_count: 0,
        };
        self.messages.push(msg.clone());
        msg
    }

    /// A message as `viewer` would receive it from the store.
    fn view(&self, msg: &ChatMessage, viewer: &str) -> ChatMessage {
        let rows = self
            .reactions
            .iter()
            .filter(|(id, _, _)| *id == msg.id)
            .map(|(_, emoji, user)| (emoji.as_str(), user.as_str()));
        let mut out = msg.clone();
        out.reactions = group_reactions(rows, viewer);
        out.reply_count = self
            .messages
            .iter()
            .filter(|m| m.thread_id.as_deref() == Some(msg.id.as_str()))
            .count() as u32;
        out
    }

    fn get(&self, id: &str) -> Result<&ChatMessage, SyncError> {
        self.messages
            .iter()
            .find(|m| m.id == id)
            .ok_or_else(|| SyncError::NotFound(id.to_string()))
    }
}

/// In-memory message store shared by several viewers.
#[derive(Clone)]
pub struct MemoryStore {
    db: Arc<Mutex<Db>>,
    viewer: String,
}

impl MemoryStore {
    pub fn new(viewer: &str) -> Self {
        Self {
            db: Arc::new(Mutex::new(Db::default())),
            viewer: viewer.to_string(),
        }
    }

    /// Same data, seen by another user.
    pub fn as_user(&self, viewer: &str) -> Self {
        Self {
            db: Arc::clone(&self.db),
            viewer: viewer.to_string(),
        }
    }

    pub fn seed(&self, channel_id: &str, author: &str, content: &str) -> ChatMessage {
        self.db.lock().unwrap().insert(channel_id, None, author, content)
    }

    pub fn seed_reply(&self, thread_id: &str, author: &str, content: &str) -> ChatMessage {
        let mut db = self.db.lock().unwrap();
        let channel = db.get(thread_id).unwrap().channel_id.clone().unwrap();
        db.insert(&channel, Some(thread_id), author, content)
    }

    pub fn seed_reaction(&self, message_id: &str, emoji: &str, user: &str) {
        self.db
            .lock()
            .unwrap()
            .reactions
            .push((message_id.into(), emoji.into(), user.into()));
    }

    /// Remove a message without anyone being told.
    pub fn vanish(&self, id: &str) {
        self.db.lock().unwrap().messages.retain(|m| m.id != id);
    }

    /// The next mutation fails with `err`.
    pub fn fail_next(&self, err: SyncError) {
        self.db.lock().unwrap().fail_next = Some(err);
    }

    /// Every call waits this long before touching data.
    pub fn set_delay(&self, delay: Duration) {
        self.db.lock().unwrap().delay = delay;
    }

    pub fn reactions_on(&self, message_id: &str) -> usize {
        let db = self.db.lock().unwrap();
        db.reactions.iter().filter(|(id, _, _)| id == message_id).count()
    }

    async fn pause(&self) {
        let delay = self.db.lock().unwrap().delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    async fn mutation(&self) -> Result<std::sync::MutexGuard<'_, Db>, SyncError> {
        self.pause().await;
        let mut db = self.db.lock().unwrap();
        let failure = db.fail_next.take();
        match failure {
            Some(err) => Err(err),
            None => Ok(db),
        }
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn list_messages(
        &self,
        channel_id: &str,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<MessagePage, SyncError> {
        self.pause().await;
        let db = self.db.lock().unwrap();
        let mut feed: Vec<&ChatMessage> = db
            .messages
            .iter()
            .filter(|m| m.channel_id.as_deref() == Some(channel_id) && m.thread_id.is_none())
            .collect();
        feed.sort_by(|a, b| (b.created_at, &b.id).cmp(&(a.created_at, &a.id)));

        let start = match cursor {
            Some(cursor) => feed.iter().position(|m| m.id == cursor).map_or(feed.len(), |i| i + 1),
            None => 0,
        };
        let page: Vec<ChatMessage> = feed
            .iter()
            .skip(start)
            .take(limit as usize)
            .map(|m| db.view(m, &self.viewer))
            .collect();
        let next_cursor = if start + page.len() < feed.len() {
            page.last().map(|m| m.id.clone())
        } else {
            None
        };
        Ok(MessagePage {
            items: page,
            next_cursor,
        })
    }

    async fn list_thread_replies(&self, thread_id: &str) -> Result<ThreadReplies, SyncError> {
        self.pause().await;
        let db = self.db.lock().unwrap();
        let parent = db.view(db.get(thread_id)?, &self.viewer);
        let mut messages: Vec<ChatMessage> = db
            .messages
            .iter()
            .filter(|m| m.thread_id.as_deref() == Some(thread_id))
            .map(|m| db.view(m, &self.viewer))
            .collect();
        messages.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        Ok(ThreadReplies { parent, messages })
    }

    async fn create_message(&self, input: CreateMessage) -> Result<ChatMessage, SyncError> {
        let mut db = self.mutation().await?;
        if let Some(thread_id) = &input.thread_id {
            db.get(thread_id)?;
        }
        let mut msg = db.insert(
            &input.channel_id,
            input.thread_id.as_deref(),
            &self.viewer,
            &input.content,
        );
        msg.image_url = input.image_url;
        if let Some(stored) = db.messages.iter_mut().find(|m| m.id == msg.id) {
            stored.image_url = msg.image_url.clone();
        }
        Ok(msg)
    }

    async fn update_message(&self, id: &str, content: &str) -> Result<ChatMessage, SyncError> {
        let mut db = self.mutation().await?;
        if db.get(id)?.author_id != self.viewer {
            return Err(SyncError::Forbidden);
        }
        let now = db.tick();
        let stored = db.messages.iter_mut().find(|m| m.id == id).unwrap();
        stored.content = Some(content.to_string());
        stored.updated_at = now;
        let stored = stored.clone();
        Ok(db.view(&stored, &self.viewer))
    }

    async fn delete_message(&self, id: &str) -> Result<DeletedMessage, SyncError> {
        let mut db = self.mutation().await?;
        let msg = db.get(id)?.clone();
        let has_replies = db.messages.iter().any(|m| m.thread_id.as_deref() == Some(id));
        db.messages
            .retain(|m| m.id != id && m.thread_id.as_deref() != Some(id));
        Ok(DeletedMessage {
            message_id: msg.id,
            channel_id: msg.channel_id.unwrap_or_default(),
            thread_id: msg.thread_id,
            has_replies,
        })
    }

    async fn toggle_reaction(
        &self,
        message_id: &str,
        emoji: &str,
    ) -> Result<ReactionSummary, SyncError> {
        let mut db = self.mutation().await?;
        let msg = db.get(message_id)?.clone();
        let before = db.reactions.len();
        db.reactions
            .retain(|(id, e, u)| !(id == message_id && e == emoji && *u == self.viewer));
        if db.reactions.len() == before {
            db.reactions
                .push((message_id.into(), emoji.into(), self.viewer.clone()));
        }
        Ok(ReactionSummary {
            message_id: message_id.to_string(),
            reactions: db.view(&msg, &self.viewer).reactions,
        })
    }

    async fn search_messages(&self, query: SearchQuery) -> Result<SearchResults, SyncError> {
        self.pause().await;
        let db = self.db.lock().unwrap();
        let needle = query.query.to_lowercase();
        let hits: Vec<ChatMessage> = db
            .messages
            .iter()
            .filter(|m| query.channel_id.is_none() || m.channel_id == query.channel_id)
            .filter(|m| {
                m.content
                    .as_deref()
                    .is_some_and(|c| c.to_lowercase().contains(&needle))
            })
            .map(|m| db.view(m, &self.viewer))
            .collect();
        let total_count = hits.len() as u64;
        Ok(SearchResults {
            items: hits.into_iter().take(query.effective_limit() as usize).collect(),
            next_cursor: None,
            total_count,
        })
    }
}

pub fn store_for(
    backend: &MemoryStore,
    config: StoreConfig,
) -> (SyncStore, mpsc::UnboundedReceiver<Outgoing>) {
    SyncStore::new(
        Arc::new(backend.clone()),
        User::new(backend.viewer.clone()),
        config,
    )
}

pub fn drain(outbox: &mut mpsc::UnboundedReceiver<Outgoing>) -> Vec<Outgoing> {
    let mut out = Vec::new();
    while let Ok(event) = outbox.try_recv() {
        out.push(event);
    }
    out
}

pub fn create(channel_id: &str, content: &str) -> CreateMessage {
    CreateMessage {
        channel_id: channel_id.to_string(),
        content: content.to_string(),
        image_url: None,
        thread_id: None,
    }
}

pub fn reply(channel_id: &str, thread_id: &str, content: &str) -> CreateMessage {
    CreateMessage {
        thread_id: Some(thread_id.to_string()),
        ..create(channel_id, content)
    }
}

pub fn ids(messages: &[ChatMessage]) -> Vec<String> {
    messages.iter().map(|m| m.id.clone()).collect()
}
