use thiserror::Error;

use crate::events::ChannelId;

#[derive(Debug, Error)]
pub enum TrackerError {
    /// Every authentication strategy was rejected by the control API. Fatal
    /// for the client that hit it; other matches keep running.
    #[error("all authentication strategies rejected by {url}")]
    Authentication { url: String },

    /// Timeout, malformed payload or transport failure on a remote call.
    /// Logged and retried next cycle, never fatal.
    #[error("transient fetch failure: {0}")]
    TransientFetch(String),

    /// Operation attempted against a match in the wrong lifecycle state.
    /// Converted into a user-facing rejection at the command boundary.
    #[error("{0}")]
    State(String),

    /// Inbound kill event carried a bad shared secret.
    #[error("kill event rejected: shared secret mismatch")]
    IngestionAuth,

    /// Outbound in-game message rejected locally before any delivery.
    #[error("message of {length} chars exceeds the {cap} char cap")]
    MessageTooLong { length: usize, cap: usize },

    #[error("no active match for channel {0}")]
    UnknownChannel(ChannelId),
}

impl TrackerError {
    pub fn state(message: impl Into<String>) -> Self {
        TrackerError::State(message.into())
    }
}
