//! Common error types for tunectl

use thiserror::Error;

/// Common result type for tunectl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types shared by the daemon, the client and observers
#[derive(Error, Debug)]
pub enum Error {
    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed JSON on the wire or in a record file
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A frame could not be read or exceeded the size limit
    #[error("Framing error: {0}")]
    Frame(String),
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for Error {
    fn from(err: toml::ser::Error) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<tokio_util::codec::LinesCodecError> for Error {
    fn from(err: tokio_util::codec::LinesCodecError) -> Self {
        match err {
            tokio_util::codec::LinesCodecError::Io(e) => Error::Io(e),
            tokio_util::codec::LinesCodecError::MaxLineLengthExceeded => {
                Error::Frame("frame exceeds maximum length".to_string())
            }
        }
    }
}
