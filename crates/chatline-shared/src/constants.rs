use std::time::Duration;

/// Application name
pub const APP_NAME: &str = "Chatline";

/// Number of most recent messages a conversation view opens with
pub const INITIAL_WINDOW: usize = 50;

/// Messages added to the window by each backward page load
pub const PAGE_INCREMENT: usize = 50;

/// Idle time after the last keystroke before the typing node is removed
pub const TYPING_IDLE: Duration = Duration::from_secs(2);

/// Maximum age of a typing signal an aggregate view still trusts (ms)
pub const TYPING_FRESHNESS_MS: i64 = 5_000;

/// Conversation preview used when the last message is an image
pub const PHOTO_PREVIEW: &str = "📷 Photo";

/// Conversation preview used when the last message is a voice note
pub const VOICE_PREVIEW: &str = "🎤 Voice message";

/// Folder uploads are placed in on the object store
pub const UPLOAD_FOLDER: &str = "chat_media";
