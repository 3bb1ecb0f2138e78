//! Error types for tunectl
//!
//! Every variant maps onto a wire [`ErrorCode`] (so the singleton can report it
//! to a client) and onto a process exit code (so the CLI can report it to a
//! shell or a key binding).

use thiserror::Error;
use tunectl_common::protocol::{ErrorCode, ErrorDescriptor};

/// Main error type for tunectl
#[derive(Error, Debug)]
pub enum Error {
    /// No singleton holds the instance lock
    #[error("No running instance")]
    NoRunningInstance,

    /// A superseded singleton did not release the lock in time
    #[error("Stale lock not released: {0}")]
    StaleLockTimeout(String),

    /// Output device switch failed; playback state left unchanged
    #[error("Output device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Media backend did not acknowledge a command in time
    #[error("Media backend unresponsive: {0}")]
    BackendUnresponsive(String),

    /// Malformed or unexpected control-channel message
    #[error("Channel protocol error: {0}")]
    ChannelProtocol(String),

    /// The singleton accepted the connection but never answered
    #[error("Instance did not answer within {0} ms")]
    InstanceUnresponsive(u64),

    /// Command arrived after `quit`
    #[error("Instance is shutting down")]
    ShuttingDown,

    /// Media backend rejected a command
    #[error("Media backend error: {0}")]
    Backend(String),

    /// System mixer query or update failed
    #[error("Mixer error: {0}")]
    Mixer(String),

    /// Configuration loading errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// File I/O errors
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON errors outside the control channel (lock records, backend IPC)
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Convenience Result type using tunectl Error
pub type Result<T> = std::result::Result<T, Error>;

impl From<tunectl_common::Error> for Error {
    fn from(err: tunectl_common::Error) -> Self {
        match err {
            tunectl_common::Error::Io(e) => Error::Io(e),
            tunectl_common::Error::Json(e) => Error::ChannelProtocol(e.to_string()),
            tunectl_common::Error::Frame(msg) => Error::ChannelProtocol(msg),
            tunectl_common::Error::Config(msg) => Error::Config(msg),
        }
    }
}

impl Error {
    /// Wire code reported to clients
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::NoRunningInstance => ErrorCode::NoRunningInstance,
            Error::StaleLockTimeout(_) => ErrorCode::StaleLockTimeout,
            Error::DeviceUnavailable(_) => ErrorCode::DeviceUnavailable,
            Error::BackendUnresponsive(_) => ErrorCode::BackendUnresponsive,
            Error::ChannelProtocol(_) | Error::Json(_) => ErrorCode::ChannelProtocolError,
            Error::ShuttingDown => ErrorCode::ShuttingDown,
            Error::InstanceUnresponsive(_)
            | Error::Backend(_)
            | Error::Mixer(_)
            | Error::Config(_)
            | Error::Io(_)
            | Error::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Process exit status for the CLI
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::NoRunningInstance => 3,
            Error::DeviceUnavailable(_) => 4,
            Error::StaleLockTimeout(_) => 5,
            Error::BackendUnresponsive(_) => 6,
            Error::ChannelProtocol(_) => 7,
            Error::InstanceUnresponsive(_) => 8,
            _ => 1,
        }
    }

    pub fn to_descriptor(&self) -> ErrorDescriptor {
        ErrorDescriptor::new(self.code(), self.to_string())
    }

    /// Rebuild an error received from the singleton
    pub fn from_descriptor(descriptor: ErrorDescriptor) -> Self {
        let ErrorDescriptor { code, message } = descriptor;
        match code {
            ErrorCode::NoRunningInstance => Error::NoRunningInstance,
            ErrorCode::StaleLockTimeout => Error::StaleLockTimeout(message),
            ErrorCode::DeviceUnavailable => Error::DeviceUnavailable(message),
            ErrorCode::BackendUnresponsive => Error::BackendUnresponsive(message),
            ErrorCode::ChannelProtocolError => Error::ChannelProtocol(message),
            ErrorCode::ShuttingDown => Error::ShuttingDown,
            ErrorCode::Internal => Error::Internal(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_nonzero_and_distinct_for_taxonomy() {
        let codes = [
            Error::NoRunningInstance.exit_code(),
            Error::DeviceUnavailable("x".into()).exit_code(),
            Error::StaleLockTimeout("x".into()).exit_code(),
            Error::BackendUnresponsive("x".into()).exit_code(),
            Error::ChannelProtocol("x".into()).exit_code(),
            Error::InstanceUnresponsive(10).exit_code(),
        ];
        assert!(codes.iter().all(|c| *c != 0));
        let mut sorted = codes.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), codes.len());
    }

    #[test]
    fn test_descriptor_preserves_category() {
        let err = Error::DeviceUnavailable("hdmi".into());
        let rebuilt = Error::from_descriptor(err.to_descriptor());
        assert!(matches!(rebuilt, Error::DeviceUnavailable(_)));
        assert_eq!(rebuilt.exit_code(), 4);
    }

    #[test]
    fn test_common_frame_error_is_protocol_error() {
        let err: Error = tunectl_common::Error::Frame("too long".into()).into();
        assert_eq!(err.code(), ErrorCode::ChannelProtocolError);
    }
}
