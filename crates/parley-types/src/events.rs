use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{ChatMessage, GroupReaction, User};

/// Errors raised while decoding or validating a frame.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("frame has no string `type` tag")]
    MissingType,

    #[error("unknown event type {0:?}")]
    UnknownType(String),

    #[error("invalid frame: {0}")]
    Invalid(&'static str),
}

/// Presence traffic. `add-user` and `remove-user` flow client -> hub,
/// `presence` snapshots flow hub -> client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum PresenceMessage {
    #[serde(rename = "add-user")]
    AddUser(User),

    #[serde(rename = "remove-user")]
    RemoveUser { id: String },

    #[serde(rename = "presence")]
    Presence { users: Vec<User> },
}

impl PresenceMessage {
    pub const TYPES: [&'static str; 3] = ["add-user", "remove-user", "presence"];
}

/// Events relayed through a channel room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all_fields = "camelCase")]
pub enum ChannelEvent {
    #[serde(rename = "message:created")]
    MessageCreated { message: ChatMessage },

    #[serde(rename = "message:updated")]
    MessageUpdated { message: ChatMessage },

    #[serde(rename = "message:deleted")]
    MessageDeleted {
        message_id: String,
        #[serde(default)]
        thread_id: Option<String>,
        has_replies: bool,
    },

    #[serde(rename = "reaction:updated")]
    ReactionUpdated {
        message_id: String,
        reactions: Vec<GroupReaction>,
    },

    /// Signed change to a parent's reply counter. `op_id` identifies the
    /// submission that caused it so the originator can recognize its own echo.
    #[serde(rename = "message:replies:increment")]
    RepliesIncrement {
        message_id: String,
        delta: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        op_id: Option<String>,
    },
}

impl ChannelEvent {
    pub const TYPES: [&'static str; 5] = [
        "message:created",
        "message:updated",
        "message:deleted",
        "reaction:updated",
        "message:replies:increment",
    ];
}

/// Events relayed through a thread room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all_fields = "camelCase")]
pub enum ThreadEvent {
    #[serde(rename = "thread:reply:created")]
    ReplyCreated { reply: ChatMessage },

    #[serde(rename = "thread:reaction:updated")]
    ReactionUpdated {
        message_id: String,
        reactions: Vec<GroupReaction>,
        thread_id: String,
    },
}

impl ThreadEvent {
    pub const TYPES: [&'static str; 2] = ["thread:reply:created", "thread:reaction:updated"];
}

/// Any client-authored event the hub relays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DomainEvent {
    Channel(ChannelEvent),
    Thread(ThreadEvent),
}

impl From<ChannelEvent> for DomainEvent {
    fn from(event: ChannelEvent) -> Self {
        Self::Channel(event)
    }
}

impl From<ThreadEvent> for DomainEvent {
    fn from(event: ThreadEvent) -> Self {
        Self::Thread(event)
    }
}

/// A decoded and validated frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Presence(PresenceMessage),
    Channel(ChannelEvent),
    Thread(ThreadEvent),
}

impl Frame {
    /// Decode raw socket text. The `type` tag selects which closed union the
    /// payload must satisfy; anything else is rejected whole.
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(raw)?;
        let tag = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingType)?;

        let frame = if PresenceMessage::TYPES.contains(&tag) {
            Self::Presence(serde_json::from_value(value)?)
        } else if ChannelEvent::TYPES.contains(&tag) {
            Self::Channel(serde_json::from_value(value)?)
        } else if ThreadEvent::TYPES.contains(&tag) {
            Self::Thread(serde_json::from_value(value)?)
        } else {
            return Err(ProtocolError::UnknownType(tag.to_string()));
        };

        frame.validate()?;
        Ok(frame)
    }

    fn validate(&self) -> Result<(), ProtocolError> {
        match self {
            Self::Presence(PresenceMessage::AddUser(user)) => validate_user(user),
            Self::Presence(PresenceMessage::RemoveUser { id }) => non_empty(id, "user id"),
            Self::Presence(PresenceMessage::Presence { users }) => {
                users.iter().try_for_each(validate_user)
            }
            Self::Channel(ChannelEvent::MessageCreated { message })
            | Self::Channel(ChannelEvent::MessageUpdated { message }) => validate_message(message),
            Self::Channel(ChannelEvent::MessageDeleted { message_id, .. }) => {
                non_empty(message_id, "message id")
            }
            Self::Channel(ChannelEvent::ReactionUpdated { message_id, reactions }) => {
                non_empty(message_id, "message id")?;
                validate_reactions(reactions)
            }
            Self::Channel(ChannelEvent::RepliesIncrement { message_id, .. }) => {
                non_empty(message_id, "message id")
            }
            Self::Thread(ThreadEvent::ReplyCreated { reply }) => {
                validate_message(reply)?;
                match reply.thread_id.as_deref() {
                    Some(id) if !id.is_empty() => Ok(()),
                    _ => Err(ProtocolError::Invalid("thread reply without thread id")),
                }
            }
            Self::Thread(ThreadEvent::ReactionUpdated {
                message_id,
                reactions,
                thread_id,
            }) => {
                non_empty(message_id, "message id")?;
                non_empty(thread_id, "thread id")?;
                validate_reactions(reactions)
            }
        }
    }
}

fn non_empty(value: &str, what: &'static str) -> Result<(), ProtocolError> {
    if value.trim().is_empty() {
        return Err(ProtocolError::Invalid(what));
    }
    Ok(())
}

fn validate_user(user: &User) -> Result<(), ProtocolError> {
    non_empty(&user.id, "user id")?;
    if let Some(email) = &user.email {
        let well_formed = email
            .split_once('@')
            .is_some_and(|(local, domain)| !local.is_empty() && domain.contains('.'))
            && !email.contains(char::is_whitespace);
        if !well_formed {
            return Err(ProtocolError::Invalid("user email"));
        }
    }
    Ok(())
}

fn validate_message(message: &ChatMessage) -> Result<(), ProtocolError> {
    non_empty(&message.id, "message id")?;
    non_empty(&message.author_id, "author id")?;
    validate_reactions(&message.reactions)
}

fn validate_reactions(reactions: &[GroupReaction]) -> Result<(), ProtocolError> {
    reactions
        .iter()
        .try_for_each(|r| non_empty(&r.emoji, "reaction emoji"))
}
