use serde::{Deserialize, Serialize};

use crate::models::{ChatMessage, GroupReaction};

// -- Listing --

pub const DEFAULT_PAGE_LIMIT: u32 = 30;
pub const MAX_PAGE_LIMIT: u32 = 100;

/// One page of a channel feed, newest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePage {
    pub items: Vec<ChatMessage>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

/// A thread parent plus all of its replies, oldest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadReplies {
    pub parent: ChatMessage,
    pub messages: Vec<ChatMessage>,
}

// -- Mutations --

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateMessage {
    pub channel_id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletedMessage {
    pub message_id: String,
    pub channel_id: String,
    #[serde(default)]
    pub thread_id: Option<String>,
    pub has_replies: bool,
}

/// Authoritative reaction list after a toggle, relative to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionSummary {
    pub message_id: String,
    pub reactions: Vec<GroupReaction>,
}

// -- Search --

pub const DEFAULT_SEARCH_LIMIT: u32 = 20;
pub const MAX_SEARCH_LIMIT: u32 = 50;
pub const MAX_SEARCH_QUERY_CHARS: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchQuery {
    pub query: String,
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub cursor: Option<String>,
    #[serde(default)]
    pub limit: Option<u32>,
}

impl SearchQuery {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            channel_id: None,
            cursor: None,
            limit: None,
        }
    }

    /// Checks the bounds the store enforces so callers fail before a round trip.
    pub fn validate(&self) -> Result<(), &'static str> {
        let chars = self.query.chars().count();
        if chars == 0 {
            return Err("search query is empty");
        }
        if chars > MAX_SEARCH_QUERY_CHARS {
            return Err("search query is too long");
        }
        match self.limit {
            Some(0) => Err("search limit must be at least 1"),
            Some(n) if n > MAX_SEARCH_LIMIT => Err("search limit is too large"),
            _ => Ok(()),
        }
    }

    pub fn effective_limit(&self) -> u32 {
        self.limit.unwrap_or(DEFAULT_SEARCH_LIMIT)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResults {
    pub items: Vec<ChatMessage>,
    #[serde(default)]
    pub next_cursor: Option<String>,
    pub total_count: u64,
}
