use thiserror::Error;

/// Application-wide error type
///
/// A full relay queue is not represented here: dropping a frame is an
/// expected outcome of `RelaySender::try_enqueue`, not a failure.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Frame source unavailable [{location}]: {reason}")]
    SourceUnavailable { location: String, reason: String },

    #[error("Frame source terminated: {0}")]
    SourceTerminated(String),

    #[error("Encode error: {0}")]
    EncodeError(String),

    #[error("Send failure: {0}")]
    SendFailure(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias used across the crate
pub type Result<T> = std::result::Result<T, AppError>;
