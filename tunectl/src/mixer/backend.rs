//! Fallback mixer that applies the level inside the media backend

use super::{SystemMixer, VolumeLevel};
use crate::backend::MediaBackend;
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// Routes volume into the backend; mute is volume 0
///
/// Nothing else changes the backend volume, so there are no notifications.
pub struct BackendMixer {
    backend: Arc<dyn MediaBackend>,
    current: Mutex<Option<VolumeLevel>>,
}

impl BackendMixer {
    pub fn new(backend: Arc<dyn MediaBackend>) -> Self {
        Self {
            backend,
            current: Mutex::new(None),
        }
    }
}

#[async_trait]
impl SystemMixer for BackendMixer {
    fn name(&self) -> &'static str {
        "backend"
    }

    fn is_system(&self) -> bool {
        false
    }

    async fn get(&self) -> Result<VolumeLevel> {
        Ok(self
            .current
            .lock()
            .await
            .unwrap_or_else(|| VolumeLevel::new(100, false)))
    }

    async fn set(&self, level: VolumeLevel) -> Result<()> {
        let effective = if level.muted { 0 } else { level.level };
        self.backend.set_volume(effective).await?;
        *self.current.lock().await = Some(level);
        Ok(())
    }

    async fn subscribe(&self) -> Result<Option<mpsc::Receiver<()>>> {
        Ok(None)
    }
}
