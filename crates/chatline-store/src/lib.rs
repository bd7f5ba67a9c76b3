//! # chatline-store
//!
//! The remote channel the chat core runs on: a key-path addressable,
//! real-time document store with point reads and writes, subscriptions,
//! windowed subscriptions and disconnect hooks.
//!
//! The crate exposes the [`RemoteChannel`] trait the rest of the workspace
//! programs against, a disposable [`Subscription`] handle, the
//! [`TeardownScope`] that owns listener tasks, and [`MemoryHub`], a complete
//! in-process implementation.

pub mod channel;
pub mod memory;
pub mod scope;

pub use channel::{server_timestamp, Entry, RemoteChannel, Subscription};
pub use chatline_shared::ChannelError;
pub use memory::{MemoryChannel, MemoryHub};
pub use scope::TeardownScope;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ChannelError>;
