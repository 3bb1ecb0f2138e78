//! System mixer access and the volume unifier
//!
//! A [`SystemMixer`] is wherever the effective output level lives: the OS
//! mixer (`pactl`), or the media backend's own volume when no OS mixer is
//! usable. The [`unifier::VolumeUnifier`] keeps it equal to the playback
//! state in both directions.

pub mod backend;
pub mod memory;
pub mod pactl;
pub mod unifier;

pub use backend::BackendMixer;
pub use memory::MemoryMixer;
pub use pactl::PactlMixer;
pub use unifier::VolumeUnifier;

use crate::backend::MediaBackend;
use crate::error::Result;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tunectl_common::config::MixerConfig;

/// Volume plus mute flag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeLevel {
    /// 0-100
    pub level: u8,
    pub muted: bool,
}

impl VolumeLevel {
    /// Levels above 100 are clamped
    pub fn new(level: u8, muted: bool) -> Self {
        Self {
            level: level.min(100),
            muted,
        }
    }

    /// Pack into 16 bits for lock-free storage
    pub(crate) fn to_bits(self) -> u16 {
        u16::from(self.level) | (u16::from(self.muted) << 8)
    }

    pub(crate) fn from_bits(bits: u16) -> Self {
        Self::new((bits & 0xff) as u8, bits & 0x100 != 0)
    }
}

impl fmt::Display for VolumeLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.muted {
            write!(f, "{}% (muted)", self.level)
        } else {
            write!(f, "{}%", self.level)
        }
    }
}

/// Output level control
#[async_trait]
pub trait SystemMixer: Send + Sync {
    fn name(&self) -> &'static str;

    /// `true` for an OS mixer, `false` when the level is applied by the backend
    fn is_system(&self) -> bool {
        true
    }

    async fn get(&self) -> Result<VolumeLevel>;

    async fn set(&self, level: VolumeLevel) -> Result<()>;

    /// Change notifications, `None` when the mixer cannot report changes
    ///
    /// A notification carries no value; the receiver reads the level with
    /// [`SystemMixer::get`].
    async fn subscribe(&self) -> Result<Option<mpsc::Receiver<()>>>;
}

/// Pick the OS mixer when enabled and reachable, else route into the backend
pub async fn select_mixer(config: &MixerConfig, backend: Arc<dyn MediaBackend>) -> Arc<dyn SystemMixer> {
    if config.enabled {
        match PactlMixer::probe(&config.pactl_path).await {
            Ok(mixer) => {
                info!("System mixer: pactl default sink");
                return Arc::new(mixer);
            }
            Err(e) => warn!("System mixer unavailable ({}), using backend volume", e),
        }
    } else {
        info!("System mixer disabled, using backend volume");
    }
    Arc::new(BackendMixer::new(backend))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bits_round_trip_keeps_mute() {
        let level = VolumeLevel::new(73, true);
        assert_eq!(VolumeLevel::from_bits(level.to_bits()), level);
        let level = VolumeLevel::new(0, false);
        assert_eq!(VolumeLevel::from_bits(level.to_bits()), level);
    }

    #[test]
    fn test_display() {
        assert_eq!(VolumeLevel::new(40, false).to_string(), "40%");
        assert_eq!(VolumeLevel::new(40, true).to_string(), "40% (muted)");
    }
}
