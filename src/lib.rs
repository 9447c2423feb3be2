//! cueFlow: message scheduling core for a radio player.
//!
//! Queued voice messages are interleaved with a looped background program,
//! which is ducked while a message plays. Scheduling, persistence, fades and
//! the playback loop live here; the `cueflow` CLI consumes this crate.

pub mod audio_runtime;
pub mod config;
pub mod error;
pub mod fade;
pub mod message_item;
pub mod message_queue_manager;
pub mod player;
pub mod queue_service;
pub mod serializer;
pub mod sources;

pub use error::{Error, Result};
