//! Error types for audio capture and detection

use thiserror::Error;

pub type Result<T> = std::result::Result<T, AudioError>;

#[derive(Error, Debug)]
pub enum AudioError {
    /// The capture device could not be found or opened. Fatal once the
    /// daemon's retry budget is exhausted.
    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    /// A running stream stopped delivering blocks (disconnect, overrun,
    /// backend error). Retried with backoff before escalating.
    #[error("audio stream fault: {0}")]
    StreamFault(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AudioError {
    pub fn device<S: Into<String>>(msg: S) -> Self {
        Self::DeviceUnavailable(msg.into())
    }

    pub fn stream<S: Into<String>>(msg: S) -> Self {
        Self::StreamFault(msg.into())
    }

    pub fn invalid_config<S: Into<String>>(msg: S) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Whether the daemon may retry the operation that produced this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StreamFault(_) | Self::DeviceUnavailable(_))
    }
}
