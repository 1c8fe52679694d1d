use async_trait::async_trait;

use parley_types::api::{
    CreateMessage, DeletedMessage, MessagePage, ReactionSummary, SearchQuery, SearchResults,
    ThreadReplies,
};
use parley_types::models::ChatMessage;

use crate::error::SyncError;

/// The durable message store. The sync core never decides a persistence
/// outcome itself; it only reacts to what these calls return.
///
/// Implementations map their failures onto [`SyncError`]: missing targets to
/// `NotFound`, authorization failures to `Forbidden`, bad input to
/// `Rejected`, and I/O to `Transient`.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Channel feed page, newest first. `cursor` is the last id of the
    /// previous page.
    async fn list_messages(
        &self,
        channel_id: &str,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<MessagePage, SyncError>;

    async fn list_thread_replies(&self, thread_id: &str) -> Result<ThreadReplies, SyncError>;

    async fn create_message(&self, input: CreateMessage) -> Result<ChatMessage, SyncError>;

    async fn update_message(&self, id: &str, content: &str) -> Result<ChatMessage, SyncError>;

    async fn delete_message(&self, id: &str) -> Result<DeletedMessage, SyncError>;

    async fn toggle_reaction(
        &self,
        message_id: &str,
        emoji: &str,
    ) -> Result<ReactionSummary, SyncError>;

    async fn search_messages(&self, query: SearchQuery) -> Result<SearchResults, SyncError>;
}
