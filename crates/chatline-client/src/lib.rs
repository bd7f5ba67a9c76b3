//! # chatline-client
//!
//! The client-side chat core: a [`Session`] created on login owns
//! presence, the call signaler and contact lookups, and opens
//! [`ConversationView`]s that assemble a conversation's live message
//! stream and coalesce typing signals.

pub mod assembler;
pub mod config;
pub mod contacts;
pub mod events;
pub mod notify;
pub mod presence;
pub mod session;
pub mod typing;
pub mod upload;

#[cfg(test)]
mod test_support;

pub use assembler::{AssemblerDeps, MessageStreamAssembler};
pub use config::ClientConfig;
pub use contacts::Contacts;
pub use events::{Notice, NoticeBus, NoticeKind};
pub use notify::{Notifier, PushClient};
pub use presence::PresenceTracker;
pub use session::{ConversationView, Session, SessionDeps};
pub use typing::{InboxTypingWatcher, TypingCoalescer, TypingWatcher};
pub use upload::{MediaUploader, UploadClient};

use tracing_subscriber::EnvFilter;

/// Install the global `tracing` subscriber. `RUST_LOG` overrides the
/// default filter. Calling it twice is harmless.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("chatline_client=debug,chatline_media=info,warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init();
}
