//! In-process mixer for tests and headless runs

use super::{SystemMixer, VolumeLevel};
use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

const NOTIFY_CAPACITY: usize = 16;

struct Inner {
    level: VolumeLevel,
    pushes: Vec<VolumeLevel>,
    notify: Option<mpsc::Sender<()>>,
    push_delay: Duration,
}

/// Mixer that behaves like a desktop sound server
///
/// Every `set` is echoed back as a change notification, the same way
/// PulseAudio reports changes made by the client that caused them.
pub struct MemoryMixer {
    inner: Mutex<Inner>,
}

impl MemoryMixer {
    pub fn new(initial: VolumeLevel) -> Self {
        Self {
            inner: Mutex::new(Inner {
                level: initial,
                pushes: Vec::new(),
                notify: None,
                push_delay: Duration::ZERO,
            }),
        }
    }

    /// Slow down `set` to keep a push in flight
    pub async fn set_push_delay(&self, delay: Duration) {
        self.inner.lock().await.push_delay = delay;
    }

    /// Levels written through `set`, oldest first
    pub async fn pushes(&self) -> Vec<VolumeLevel> {
        self.inner.lock().await.pushes.clone()
    }

    pub async fn level(&self) -> VolumeLevel {
        self.inner.lock().await.level
    }

    /// Simulate a change made by another application
    pub async fn external_change(&self, level: VolumeLevel) {
        let mut inner = self.inner.lock().await;
        inner.level = level;
        notify(&inner);
    }
}

fn notify(inner: &Inner) {
    if let Some(tx) = &inner.notify {
        let _ = tx.try_send(());
    }
}

#[async_trait]
impl SystemMixer for MemoryMixer {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self) -> Result<VolumeLevel> {
        Ok(self.inner.lock().await.level)
    }

    async fn set(&self, level: VolumeLevel) -> Result<()> {
        let delay = self.inner.lock().await.push_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut inner = self.inner.lock().await;
        inner.level = level;
        inner.pushes.push(level);
        notify(&inner);
        Ok(())
    }

    async fn subscribe(&self) -> Result<Option<mpsc::Receiver<()>>> {
        let (tx, rx) = mpsc::channel(NOTIFY_CAPACITY);
        self.inner.lock().await.notify = Some(tx);
        Ok(Some(rx))
    }
}
