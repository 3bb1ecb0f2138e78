//! Media backend adapter
//!
//! The control plane never decodes audio itself. It drives an external
//! playback engine through the narrow [`MediaBackend`] command interface and
//! receives [`BackendEvent`]s on a channel that feeds the playback worker.
//!
//! Every `load` returns a fresh load id. Events that refer to a track carry
//! the id of the load they belong to so the state machine can discard
//! late events from a track it already replaced.

pub mod memory;
pub mod mpv;

pub use memory::{BackendCall, MemoryBackend};
pub use mpv::MpvBackend;

use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;
use tunectl_common::config::{BackendConfig, BackendKind, ConfigPaths};
use tunectl_common::protocol::{OutputDevice, EQ_BANDS};

/// Capacity of the backend event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Notification emitted by a media backend
#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    /// Track reached its natural end (or failed to play)
    TrackEnded { load_id: u64 },
    /// Playback position update
    Position { load_id: u64, secs: f64 },
    /// Track length became known
    Duration { load_id: u64, secs: f64 },
    /// Audio output failed
    DeviceError { message: String },
    /// Backend process went away
    Exited,
}

/// Command interface of an audio playback engine
///
/// Methods take `&self`; implementations serialize access internally so a
/// single `Arc<dyn MediaBackend>` can be shared by the worker, the volume
/// mixer fallback and the daemon's shutdown path.
#[async_trait]
pub trait MediaBackend: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Load a track, replacing the current one. The backend is left paused at 0.
    async fn load(&self, url: &str) -> Result<u64>;

    async fn play(&self) -> Result<()>;

    async fn pause(&self) -> Result<()>;

    /// Unload the current track
    async fn stop(&self) -> Result<()>;

    /// Seek to an absolute position in seconds
    async fn seek(&self, position_secs: f64) -> Result<()>;

    /// Backend-internal volume, 0-100
    async fn set_volume(&self, level: u8) -> Result<()>;

    /// Switch audio output; fails with `DeviceUnavailable` for unknown devices
    async fn set_output_device(&self, device: &str) -> Result<()>;

    async fn list_devices(&self) -> Result<Vec<OutputDevice>>;

    /// Apply ten-band equalizer gains (dB)
    async fn set_equalizer(&self, gains: &[i8; EQ_BANDS]) -> Result<()>;

    /// Replace an engine that exited or stopped answering
    ///
    /// Volume, output device and equalizer set earlier carry over.
    async fn restart(&self) -> Result<()>;

    /// Stop the engine and release its resources
    async fn shutdown(&self) -> Result<()>;
}

/// Create the event channel a backend reports on
pub fn event_channel() -> (mpsc::Sender<BackendEvent>, mpsc::Receiver<BackendEvent>) {
    mpsc::channel(EVENT_CHANNEL_CAPACITY)
}

/// Resolve a queue entry into something the backend can open
///
/// URLs and filesystem paths pass through; anything else is treated as a
/// YouTube Music video id.
pub fn track_url(track: &str) -> String {
    if track.contains("://") || track.starts_with('/') || track.starts_with("./") {
        track.to_string()
    } else {
        format!("https://music.youtube.com/watch?v={}", track)
    }
}

/// Start the configured backend
pub async fn create_backend(
    config: &BackendConfig,
    paths: &ConfigPaths,
    events: mpsc::Sender<BackendEvent>,
) -> Result<Arc<dyn MediaBackend>> {
    match config.kind {
        BackendKind::Mpv => {
            let backend = MpvBackend::spawn(config, paths, events).await?;
            info!("Media backend: mpv ({})", config.mpv_path);
            Ok(Arc::new(backend))
        }
        BackendKind::Memory => {
            info!("Media backend: memory (silent)");
            Ok(Arc::new(MemoryBackend::new(events)))
        }
    }
}
