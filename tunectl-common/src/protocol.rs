//! Control-channel protocol shared by the singleton, CLI clients and observers
//!
//! Every message is a single JSON document on its own line (see [`crate::framing`]).
//!
//! A connection opens with exactly one [`Request`]:
//! - `{"command": {...}}`: apply one [`ControlCommand`], answered by one [`Response`]
//!   and then closed by the server
//! - `"subscribe"`: become an observer; the server pushes a [`Response::Snapshot`]
//!   immediately and after every subsequent state change

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of equalizer bands carried in every snapshot
pub const EQ_BANDS: usize = 10;

/// Centre frequencies (Hz) of the equalizer bands, lowest first
pub const EQ_FREQUENCIES_HZ: [u32; EQ_BANDS] =
    [31, 62, 125, 250, 500, 1_000, 2_000, 4_000, 8_000, 16_000];

/// Maximum absolute band gain in dB
pub const EQ_MAX_GAIN_DB: i8 = 12;

/// Output device identifier meaning "let the backend choose"
pub const AUTO_DEVICE: &str = "auto";

/// Transport status of the playback state machine
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransportStatus {
    Stopped,
    Playing,
    Paused,
    /// Terminal state entered on `quit`
    ShuttingDown,
}

impl fmt::Display for TransportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportStatus::Stopped => write!(f, "stopped"),
            TransportStatus::Playing => write!(f, "playing"),
            TransportStatus::Paused => write!(f, "paused"),
            TransportStatus::ShuttingDown => write!(f, "shutting_down"),
        }
    }
}

/// Remote command accepted by the singleton
///
/// The set is closed: clients cannot extend it. Optional arguments fall back to
/// the daemon's configured step sizes when absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlCommand {
    Play,
    Pause,
    TogglePause,
    Next,
    Prev,
    SeekForward {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seconds: Option<f64>,
    },
    SeekBack {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seconds: Option<f64>,
    },
    VolumeUp {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        step: Option<u8>,
    },
    VolumeDown {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        step: Option<u8>,
    },
    Mute,
    SetOutputDevice {
        device: String,
    },
    Quit,
    QueryState,
}

impl ControlCommand {
    /// Wire tag of the command (`"toggle-pause"`, `"seek-forward"`, ...)
    pub fn tag(&self) -> &'static str {
        match self {
            ControlCommand::Play => "play",
            ControlCommand::Pause => "pause",
            ControlCommand::TogglePause => "toggle-pause",
            ControlCommand::Next => "next",
            ControlCommand::Prev => "prev",
            ControlCommand::SeekForward { .. } => "seek-forward",
            ControlCommand::SeekBack { .. } => "seek-back",
            ControlCommand::VolumeUp { .. } => "volume-up",
            ControlCommand::VolumeDown { .. } => "volume-down",
            ControlCommand::Mute => "mute",
            ControlCommand::SetOutputDevice { .. } => "set-output-device",
            ControlCommand::Quit => "quit",
            ControlCommand::QueryState => "query-state",
        }
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlCommand::SeekForward { seconds: Some(s) }
            | ControlCommand::SeekBack { seconds: Some(s) } => write!(f, "{} {}", self.tag(), s),
            ControlCommand::VolumeUp { step: Some(s) } | ControlCommand::VolumeDown { step: Some(s) } => {
                write!(f, "{} {}", self.tag(), s)
            }
            ControlCommand::SetOutputDevice { device } => write!(f, "{} {}", self.tag(), device),
            _ => write!(f, "{}", self.tag()),
        }
    }
}

/// First (and for command connections, only) message a client sends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Request {
    Command(ControlCommand),
    Subscribe,
}

/// Audio output device as reported by the media backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputDevice {
    /// Backend identifier passed to `set-output-device`
    pub name: String,
    /// Human-readable label
    pub description: String,
}

/// Read-only copy of the playback state
///
/// Sent as the acknowledgement of every command and pushed to observers after
/// every state change. `seq` increases by one per change so observers can
/// detect reordering or gaps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub seq: u64,
    pub status: TransportStatus,
    pub current_track: Option<String>,
    pub queue: Vec<String>,
    pub queue_index: usize,
    pub position_secs: f64,
    pub duration_secs: Option<f64>,
    pub volume: u8,
    pub muted: bool,
    pub equalizer: [i8; EQ_BANDS],
    pub output_device: String,
    #[serde(default)]
    pub devices: Vec<OutputDevice>,
    pub updated_at: DateTime<Utc>,
}

/// Machine-readable failure category carried by [`ErrorDescriptor`]
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NoRunningInstance,
    StaleLockTimeout,
    DeviceUnavailable,
    BackendUnresponsive,
    ChannelProtocolError,
    ShuttingDown,
    Internal,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCode::NoRunningInstance => "no_running_instance",
            ErrorCode::StaleLockTimeout => "stale_lock_timeout",
            ErrorCode::DeviceUnavailable => "device_unavailable",
            ErrorCode::BackendUnresponsive => "backend_unresponsive",
            ErrorCode::ChannelProtocolError => "channel_protocol_error",
            ErrorCode::ShuttingDown => "shutting_down",
            ErrorCode::Internal => "internal",
        };
        write!(f, "{}", s)
    }
}

/// Error answer to a command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorDescriptor {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Server-to-client message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Response {
    Snapshot(StateSnapshot),
    Error(ErrorDescriptor),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_wire_format_uses_kebab_tags() {
        let value = serde_json::to_value(Request::Command(ControlCommand::TogglePause)).unwrap();
        assert_eq!(value, json!({"command": {"type": "toggle-pause"}}));

        let value = serde_json::to_value(ControlCommand::SeekForward { seconds: Some(30.0) }).unwrap();
        assert_eq!(value, json!({"type": "seek-forward", "seconds": 30.0}));
    }

    #[test]
    fn test_optional_arguments_may_be_omitted() {
        let cmd: ControlCommand = serde_json::from_str(r#"{"type":"volume-up"}"#).unwrap();
        assert_eq!(cmd, ControlCommand::VolumeUp { step: None });
    }

    #[test]
    fn test_subscribe_request_is_a_bare_string() {
        let text = serde_json::to_string(&Request::Subscribe).unwrap();
        assert_eq!(text, r#""subscribe""#);
    }

    #[test]
    fn test_unknown_command_is_rejected() {
        let result = serde_json::from_str::<Request>(r#"{"command":{"type":"rewind"}}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_set_output_device_requires_device() {
        let result = serde_json::from_str::<ControlCommand>(r#"{"type":"set-output-device"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_display_includes_argument() {
        assert_eq!(ControlCommand::VolumeDown { step: Some(10) }.to_string(), "volume-down 10");
        assert_eq!(ControlCommand::Quit.to_string(), "quit");
    }

    #[test]
    fn test_error_response_wire_format() {
        let resp = Response::Error(ErrorDescriptor::new(ErrorCode::DeviceUnavailable, "no such sink"));
        let value = serde_json::to_value(resp).unwrap();
        assert_eq!(
            value,
            json!({"error": {"code": "device_unavailable", "message": "no such sink"}})
        );
    }
}
