//! Error type shared by the scheduler, persistence, fades and player glue.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// A message with this filename is already queued.
    #[error("Message '{0}' is already in the queue")]
    DuplicateMessage(String),

    /// Priorities start at 1.
    #[error("Invalid priority {0} (must be 1 or greater)")]
    InvalidPriority(u8),

    #[error("Message '{0}' not found in the queue")]
    MessageNotFound(String),

    #[error("Unknown fade preset '{0}'. Expected: professional, fast, smooth, dramatic")]
    UnknownPreset(String),

    #[error("Unknown fade curve '{0}'. Expected: linear, exponential, logarithmic, smooth")]
    UnknownCurve(String),

    #[error("Background source '{0}' already exists")]
    DuplicateSource(String),

    #[error("Background source '{0}' not found")]
    SourceNotFound(String),

    /// The media backend refused or failed a command.
    #[error("Player error: {0}")]
    Player(String),

    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
