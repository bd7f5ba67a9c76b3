//! # chatline-media
//!
//! Audio/video calling: the [`CallSignaler`] handshake state machine that
//! rings, accepts, rejects and tears down calls over the remote channel,
//! the [`MediaBridge`] seam to the media engine, and the call-token
//! provider the engine requires before a room can be joined.

pub mod bridge;
pub mod loopback;
pub mod signaling;
pub mod token;

pub use bridge::{LocalStream, MediaBridge, MediaError, MediaEvent, TrackKind};
pub use loopback::{LoopbackBridge, LoopbackMedia};
pub use signaling::{CallNotice, CallSignaler, CallState, CallerIdentity};
pub use token::{CallTokenProvider, HttpTokenProvider};
