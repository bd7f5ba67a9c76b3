use thiserror::Error;

/// Top-level error returned by the chat and call core.
#[derive(Error, Debug)]
pub enum ChatError {
    /// A read or write against the remote channel failed. Never retried and
    /// never rolls back optimistic state.
    #[error("Remote channel error: {0}")]
    Remote(#[from] ChannelError),

    #[error("Upload failed: {0}")]
    Upload(String),

    /// An outbound call was attempted while another call is in progress.
    #[error("Signaling conflict: a call is already in progress")]
    SignalingConflict,

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Malformed node: {0}")]
    Decode(#[from] DecodeError),

    /// A local value could not be turned into JSON. Not a channel failure.
    #[error("Failed to encode payload: {0}")]
    Encode(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Only the author can modify this message")]
    NotAuthor,

    #[error("Media engine error: {0}")]
    Media(String),

    #[error("HTTP error: {0}")]
    Http(String),
}

/// Transport-level failure of a remote channel primitive.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Channel unavailable at {path}: {reason}")]
    Unavailable { path: String, reason: String },

    #[error("Permission denied at {0}")]
    PermissionDenied(String),

    #[error("Invalid path: {0:?}")]
    InvalidPath(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// A node read from the channel did not have the shape of its entity.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("{path}: {reason}")]
    Malformed { path: String, reason: String },

    #[error("message {0} has no text, image or audio")]
    EmptyMessage(String),
}

impl From<serde_json::Error> for ChannelError {
    fn from(e: serde_json::Error) -> Self {
        ChannelError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(e: serde_json::Error) -> Self {
        ChatError::Encode(e.to_string())
    }
}

/// Convenience alias used throughout the core.
pub type Result<T> = std::result::Result<T, ChatError>;
