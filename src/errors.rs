use thiserror::Error;

/// Failures raised by the feed core.
///
/// Only `Authentication` and un-retried `Transport` errors ever leave the
/// feed worker. The packet-level variants are logged and absorbed so that the
/// receive loop keeps running.
#[derive(Debug, Error)]
pub enum FeedError {
    /// The APRS-IS server rejected the login. Retrying with the same
    /// credentials will not help.
    #[error("APRS-IS login rejected for {callsign}: {reason}")]
    Authentication { callsign: String, reason: String },

    /// Network level failure: DNS, connect, read/write, idle timeout or the
    /// server closing the socket.
    #[error("APRS-IS transport error: {0}")]
    Transport(String),

    /// A single line from the feed could not be decoded.
    #[error("malformed APRS packet '{raw}': {reason}")]
    MalformedPacket { raw: String, reason: String },

    /// The entity sink could not accept a notification.
    #[error("entity sink unavailable for {station_id}/{metric}: {reason}")]
    SinkUnavailable {
        station_id: String,
        metric: String,
        reason: String,
    },
}

impl FeedError {
    pub fn transport(message: impl Into<String>) -> Self {
        FeedError::Transport(message.into())
    }

    /// Whether an immortal worker may reconnect after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FeedError::Transport(_))
    }
}

impl From<std::io::Error> for FeedError {
    fn from(e: std::io::Error) -> Self {
        FeedError::Transport(e.to_string())
    }
}
