//! # chatline-shared
//!
//! Identifiers, entity types, key-path layout and the error taxonomy used by
//! every other chatline crate.

pub mod api;
pub mod constants;
pub mod error;
pub mod models;
pub mod paths;
pub mod types;

pub use error::{ChannelError, ChatError, DecodeError};
