use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Prefix for ids minted by a client before the store has assigned a durable one.
pub const OPTIMISTIC_PREFIX: &str = "optimistic-";

/// Identity announced by a connection. Only `id` is required; the rest is
/// display data and may be null.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub full_name: Option<String>,
    pub email: Option<String>,
    pub picture: Option<String>,
}

impl User {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            full_name: None,
            email: None,
            picture: None,
        }
    }

    pub fn with_name(mut self, full_name: impl Into<String>) -> Self {
        self.full_name = Some(full_name.into());
        self
    }
}

/// One emoji bucket as seen by a particular viewer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupReaction {
    pub emoji: String,
    pub count: u32,
    pub reacted_by_me: bool,
}

/// A message as it travels over the realtime socket and as it sits in the
/// client cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub author_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_avatar: Option<String>,
    pub channel_id: Option<String>,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub reactions: Vec<GroupReaction>,
    #[serde(default)]
    pub reply_count: u32,
}

impl ChatMessage {
    /// Whether this entry still carries a client-minted id.
    pub fn is_optimistic(&self) -> bool {
        self.id.starts_with(OPTIMISTIC_PREFIX)
    }

    /// Apply a signed reply delta, clamping at zero.
    pub fn apply_reply_delta(&mut self, delta: i64) {
        self.reply_count = clamp_count(i64::from(self.reply_count) + delta);
    }
}

fn clamp_count(value: i64) -> u32 {
    u32::try_from(value.max(0)).unwrap_or(u32::MAX)
}

/// Fold raw `(emoji, user_id)` rows into per-emoji buckets relative to `viewer`.
/// Buckets keep the order in which each emoji was first seen.
pub fn group_reactions<'a, I>(rows: I, viewer: &str) -> Vec<GroupReaction>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut groups: Vec<GroupReaction> = Vec::new();
    for (emoji, user_id) in rows {
        let mine = user_id == viewer;
        match groups.iter_mut().find(|g| g.emoji == emoji) {
            Some(group) => {
                group.count += 1;
                group.reacted_by_me |= mine;
            }
            None => groups.push(GroupReaction {
                emoji: emoji.to_string(),
                count: 1,
                reacted_by_me: mine,
            }),
        }
    }
    groups
}

/// Scope of a hub room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomKind {
    Channel,
    Thread,
}

impl RoomKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Channel => "channel",
            Self::Thread => "thread",
        }
    }
}

/// Address of a hub room, rendered on the wire as `{kind}-{id}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoomId {
    pub kind: RoomKind,
    pub id: String,
}

impl RoomId {
    pub fn channel(id: impl Into<String>) -> Self {
        Self {
            kind: RoomKind::Channel,
            id: id.into(),
        }
    }

    pub fn thread(id: impl Into<String>) -> Self {
        Self {
            kind: RoomKind::Thread,
            id: id.into(),
        }
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.kind.as_str(), self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid room name: {0:?}")]
pub struct InvalidRoom(pub String);

impl FromStr for RoomId {
    type Err = InvalidRoom;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s.split_once('-').ok_or_else(|| InvalidRoom(s.to_string()))?;
        let kind = match kind {
            "channel" => RoomKind::Channel,
            "thread" => RoomKind::Thread,
            _ => return Err(InvalidRoom(s.to_string())),
        };
        if id.is_empty() {
            return Err(InvalidRoom(s.to_string()));
        }
        Ok(Self {
            kind,
            id: id.to_string(),
        })
    }
}
