//! In-process singleton with silent backend and mixer

use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tunectl::backend::{event_channel, MemoryBackend};
use tunectl::channel::ControlClient;
use tunectl::mixer::{MemoryMixer, VolumeLevel};
use tunectl::{Daemon, InstanceRecord, InstanceRegistry, Result};
use tunectl_common::config::{ConfigPaths, TomlConfig};

/// Registry with timeouts short enough for tests
pub fn registry(dir: &TempDir) -> InstanceRegistry {
    InstanceRegistry::with_timeouts(
        ConfigPaths::new(dir.path()),
        Duration::from_millis(1000),
        Duration::from_millis(3000),
    )
}

pub struct TestInstance {
    pub registry: InstanceRegistry,
    pub record: InstanceRecord,
    pub backend: Arc<MemoryBackend>,
    pub mixer: Arc<MemoryMixer>,
    pub shutdown: CancellationToken,
    pub task: JoinHandle<Result<()>>,
}

impl TestInstance {
    /// Acquire the lock in `dir` and serve `tracks` until quit
    pub async fn start(dir: &TempDir, tracks: &[&str]) -> Self {
        Self::start_with_mixer(dir, tracks, VolumeLevel::new(80, false)).await
    }

    pub async fn start_with_mixer(dir: &TempDir, tracks: &[&str], initial: VolumeLevel) -> Self {
        let registry = registry(dir);
        let guard = registry.acquire().await.expect("acquire instance lock");

        let (tx, rx) = event_channel();
        let backend = Arc::new(MemoryBackend::new(tx));
        let mixer = Arc::new(MemoryMixer::new(initial));
        let shutdown = CancellationToken::new();

        let daemon = Daemon::new(ConfigPaths::new(dir.path()), TomlConfig::default())
            .with_queue(tracks.iter().map(|t| t.to_string()).collect())
            .with_backend(backend.clone(), rx)
            .with_mixer(mixer.clone());
        let task = tokio::spawn(daemon.run(guard, shutdown.clone()));

        let record = wait_for_record(&registry).await;
        Self {
            registry,
            record,
            backend,
            mixer,
            shutdown,
            task,
        }
    }

    pub fn client(&self) -> ControlClient {
        self.registry.client_for(&self.record)
    }

    /// Wait for the singleton task to finish
    pub async fn join(self) -> Result<()> {
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .expect("singleton did not stop")
            .expect("singleton task panicked")
    }
}

async fn wait_for_record(registry: &InstanceRegistry) -> InstanceRecord {
    for _ in 0..100 {
        if let Ok(Some(record)) = registry.lookup().await {
            return record;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("singleton never published its record");
}

/// Poll `check` until it passes or two seconds elapse
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
