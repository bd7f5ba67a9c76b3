use async_trait::async_trait;
use chatline_shared::types::{CallKind, RoomId, UserId};
use chatline_shared::ChatError;
use chatline_store::Subscription;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// Microphone or camera access was refused.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Media engine connection error: {0}")]
    ConnectionError(String),

    #[error("Not joined to room {0}")]
    NotJoined(String),
}

impl From<MediaError> for ChatError {
    fn from(e: MediaError) -> Self {
        match e {
            MediaError::PermissionDenied(device) => ChatError::PermissionDenied(device),
            other => ChatError::Media(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

/// Captured local media, owned by the engine and addressed by handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalStream {
    pub handle: u64,
    pub kind: CallKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEvent {
    RemoteStreamAdded { stream_id: String },
    RemoteStreamRemoved { stream_id: String },
}

/// The external media engine a call runs on once signaling has connected
/// both parties.
#[async_trait]
pub trait MediaBridge: Send + Sync {
    /// Acquire microphone (and camera, for video calls).
    async fn create_local_stream(&self, kind: CallKind) -> Result<LocalStream, MediaError>;

    async fn join_room(&self, room: &RoomId, user: &UserId, token: &str) -> Result<(), MediaError>;

    async fn publish(&self, stream: &LocalStream, stream_id: &str) -> Result<(), MediaError>;

    async fn leave_room(&self, room: &RoomId);

    fn set_track_enabled(&self, stream: &LocalStream, track: TrackKind, enabled: bool);

    fn stop_local_stream(&self, stream: &LocalStream);

    /// Remote stream arrivals and departures in every room this bridge has
    /// joined.
    fn events(&self) -> Subscription<MediaEvent>;
}
