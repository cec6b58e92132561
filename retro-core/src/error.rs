use crate::types::RowKey;

/// A local precondition failed. Nothing was mutated and nothing was sent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("No board is loaded")]
    BoardNotLoaded,

    #[error("Board is archived; content is read-only")]
    BoardArchived,

    #[error("Board is locked for new cards")]
    CardCreationDisabled,

    #[error("Voting is disabled on this board")]
    VotingDisabled,

    #[error("Join the board before {0}")]
    NotJoined(&'static str),

    #[error("Participant not found: {0}")]
    ParticipantNotFound(String),

    #[error("Column not found: {0}")]
    ColumnNotFound(String),

    #[error("Card not found: {0}")]
    CardNotFound(String),

    #[error("Action item not found: {0}")]
    ActionItemNotFound(String),

    #[error("Card {0} cannot be combined with itself")]
    SelfCombine(String),

    #[error("Board already has the maximum of {max} columns")]
    TooManyColumns { max: usize },

    #[error("{0} must not be empty")]
    EmptyText(&'static str),

    #[error("Timer duration must be positive")]
    InvalidDuration,

    #[error("Cannot {action} a timer that is {status}")]
    InvalidTimerTransition {
        action: &'static str,
        status: &'static str,
    },
}

/// The durable record store rejected or never answered a request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("Write rejected: {0}")]
    Rejected(String),

    #[error("Row not found: {0}")]
    NotFound(RowKey),

    #[error("Duplicate row: {0}")]
    Duplicate(RowKey),

    #[error("Board not found: {0}")]
    BoardNotFound(String),

    #[error("Request timed out after {0} ms")]
    Timeout(u64),

    #[error("Record store unavailable: {0}")]
    Unavailable(String),
}

/// A broadcast or presence channel operation failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel {0} is closed")]
    Closed(String),

    #[error("Channel unavailable: {0}")]
    Unavailable(String),

    #[error("Malformed payload for {event}: {reason}")]
    Payload { event: String, reason: String },
}

/// Error returned by every engine operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Write failed and was rolled back: {0}")]
    Write(#[from] StoreError),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

impl SyncError {
    pub fn is_validation(&self) -> bool {
        matches!(self, SyncError::Validation(_))
    }
}
