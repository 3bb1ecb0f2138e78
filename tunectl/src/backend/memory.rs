//! Silent in-process backend
//!
//! Records calls instead of producing sound. Used for headless runs
//! (`--backend memory`) and as the test double for the state machine.
//! Only the most recent [`CALL_HISTORY`] calls are kept.

use super::{BackendEvent, MediaBackend};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;
use tunectl_common::protocol::{OutputDevice, AUTO_DEVICE, EQ_BANDS};

/// Number of calls remembered
pub const CALL_HISTORY: usize = 256;

/// One recorded backend call
#[derive(Debug, Clone, PartialEq)]
pub enum BackendCall {
    Load(String),
    Play,
    Pause,
    Stop,
    Seek(f64),
    SetVolume(u8),
    SetOutputDevice(String),
    SetEqualizer([i8; EQ_BANDS]),
    Restart,
    Shutdown,
}

struct Inner {
    calls: VecDeque<BackendCall>,
    load_id: u64,
    devices: Vec<OutputDevice>,
    unresponsive: bool,
}

/// Backend that plays nothing and remembers what it was asked to do
pub struct MemoryBackend {
    events: mpsc::Sender<BackendEvent>,
    inner: Mutex<Inner>,
}

impl MemoryBackend {
    pub fn new(events: mpsc::Sender<BackendEvent>) -> Self {
        Self {
            events,
            inner: Mutex::new(Inner {
                calls: VecDeque::with_capacity(CALL_HISTORY),
                load_id: 0,
                devices: vec![
                    OutputDevice {
                        name: AUTO_DEVICE.to_string(),
                        description: "Autoselect device".to_string(),
                    },
                    OutputDevice {
                        name: "null".to_string(),
                        description: "Null output".to_string(),
                    },
                ],
                unresponsive: false,
            }),
        }
    }

    /// Replace the reported device list
    pub async fn set_devices(&self, devices: Vec<OutputDevice>) {
        self.inner.lock().await.devices = devices;
    }

    /// Make every following call fail with `BackendUnresponsive`
    pub async fn set_unresponsive(&self, unresponsive: bool) {
        self.inner.lock().await.unresponsive = unresponsive;
    }

    pub async fn calls(&self) -> Vec<BackendCall> {
        self.inner.lock().await.calls.iter().cloned().collect()
    }

    pub async fn clear_calls(&self) {
        self.inner.lock().await.calls.clear();
    }

    /// Id returned by the most recent `load`
    pub async fn current_load_id(&self) -> u64 {
        self.inner.lock().await.load_id
    }

    /// Report the end of the current track
    pub async fn finish_track(&self) {
        let load_id = self.current_load_id().await;
        self.emit(BackendEvent::TrackEnded { load_id }).await;
    }

    /// Inject an arbitrary event
    pub async fn emit(&self, event: BackendEvent) {
        if self.events.send(event).await.is_err() {
            debug!("Memory backend event dropped: no receiver");
        }
    }

    async fn record(&self, call: BackendCall) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.unresponsive {
            return Err(Error::BackendUnresponsive(format!(
                "memory backend stalled on {:?}",
                call
            )));
        }
        debug!("Memory backend: {:?}", call);
        if inner.calls.len() == CALL_HISTORY {
            inner.calls.pop_front();
        }
        inner.calls.push_back(call);
        Ok(())
    }
}

#[async_trait]
impl MediaBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn load(&self, url: &str) -> Result<u64> {
        self.record(BackendCall::Load(url.to_string())).await?;
        let mut inner = self.inner.lock().await;
        inner.load_id += 1;
        Ok(inner.load_id)
    }

    async fn play(&self) -> Result<()> {
        self.record(BackendCall::Play).await
    }

    async fn pause(&self) -> Result<()> {
        self.record(BackendCall::Pause).await
    }

    async fn stop(&self) -> Result<()> {
        self.record(BackendCall::Stop).await
    }

    async fn seek(&self, position_secs: f64) -> Result<()> {
        self.record(BackendCall::Seek(position_secs)).await
    }

    async fn set_volume(&self, level: u8) -> Result<()> {
        self.record(BackendCall::SetVolume(level)).await
    }

    async fn set_output_device(&self, device: &str) -> Result<()> {
        {
            let inner = self.inner.lock().await;
            if !inner.unresponsive && !inner.devices.iter().any(|d| d.name == device) {
                return Err(Error::DeviceUnavailable(device.to_string()));
            }
        }
        self.record(BackendCall::SetOutputDevice(device.to_string())).await
    }

    async fn list_devices(&self) -> Result<Vec<OutputDevice>> {
        let inner = self.inner.lock().await;
        if inner.unresponsive {
            return Err(Error::BackendUnresponsive("memory backend stalled".to_string()));
        }
        Ok(inner.devices.clone())
    }

    async fn set_equalizer(&self, gains: &[i8; EQ_BANDS]) -> Result<()> {
        self.record(BackendCall::SetEqualizer(*gains)).await
    }

    async fn restart(&self) -> Result<()> {
        self.record(BackendCall::Restart).await
    }

    async fn shutdown(&self) -> Result<()> {
        self.record(BackendCall::Shutdown).await
    }
}
