use parley_types::events::ProtocolError;

/// Failures surfaced by the sync store and sessions.
///
/// Echoes of changes this session already applied are not errors; they show
/// up as [`crate::reconcile::EventOutcome::Echo`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    /// A remote event failed decoding or validation and was dropped.
    #[error("invalid event: {0}")]
    Validation(String),

    /// The target no longer exists in the message store.
    #[error("not found: {0}")]
    NotFound(String),

    /// The message store refused the caller.
    #[error("forbidden")]
    Forbidden,

    /// The message store refused the input itself.
    #[error("rejected: {0}")]
    Rejected(String),

    /// Socket or fetch failure. Safe to retry.
    #[error("network error: {0}")]
    Transient(String),

    /// The realtime session for the room is gone.
    #[error("session closed")]
    SessionClosed,

    /// The mutation task stopped before it could settle.
    #[error("interrupted: {0}")]
    Interrupted(String),
}

impl SyncError {
    /// Short text suitable for showing to a user.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Validation(_) => "Received an update that could not be read.",
            Self::NotFound(_) => "That message no longer exists.",
            Self::Forbidden => "You don't have permission to do that.",
            Self::Rejected(_) => "That change couldn't be saved.",
            Self::Transient(_) => "Connection problem. Please try again.",
            Self::SessionClosed => "Live updates are disconnected.",
            Self::Interrupted(_) => "Something went wrong. Please try again.",
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<ProtocolError> for SyncError {
    fn from(e: ProtocolError) -> Self {
        Self::Validation(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transient(e.to_string())
    }
}
