//! Error types
//!
//! A single error enum covers every fallible operation in the crate. Which of
//! these are fatal is decided by the caller: the coordinator contains
//! per-frame failures, while startup and kill failures end the process.

use std::io;

use crate::frame::FrameId;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for live output operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No frame buffer exists under this id (not yet written, or already released)
    #[error("frame buffer not found: {0}")]
    NotFound(FrameId),

    /// Release of a frame that is not attached (double delete or delete without get)
    #[error("frame buffer not attached, cannot release: {0}")]
    NotFoundOnDelete(FrameId),

    /// Backing buffer is smaller than the requested frame shape
    #[error("frame buffer {id} holds {actual} bytes, shape needs {expected}")]
    ShapeMismatch {
        id: FrameId,
        expected: usize,
        actual: usize,
    },

    /// Channel name is not part of the configured channel table
    #[error("unknown channel: {0}")]
    UnknownChannel(String),

    /// Encoder subprocess could not be started
    #[error("failed to spawn encoder for channel {channel}: {source}")]
    EncoderSpawn {
        channel: String,
        #[source]
        source: io::Error,
    },

    /// Encoder subprocess has exited or closed its pipes
    #[error("encoder for channel {0} is no longer running")]
    EncoderDead(String),

    /// Forced termination of an encoder subprocess failed
    #[error("failed to kill encoder for channel {channel}: {source}")]
    KillFailed {
        channel: String,
        #[source]
        source: io::Error,
    },

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Config(#[from] config::ConfigError),

    /// Malformed frame metadata record
    #[error("invalid frame metadata: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

impl Error {
    /// Whether the error means the encoder behind a channel is gone
    pub fn is_encoder_dead(&self) -> bool {
        matches!(self, Error::EncoderDead(_))
    }
}
