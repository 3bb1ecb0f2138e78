//! Singleton wiring
//!
//! Builds the backend, mixer, state machine, worker, volume unifier and
//! control server around an acquired [`InstanceGuard`], runs until the
//! machine reaches `ShuttingDown`, then tears everything down in order:
//! control socket, background tasks, backend, instance lock.

use crate::backend::{create_backend, event_channel, BackendEvent, MediaBackend};
use crate::channel::{ControlServer, SnapshotBroadcaster};
use crate::error::Result;
use crate::mixer::{select_mixer, SystemMixer, VolumeLevel, VolumeUnifier};
use crate::now_playing::NowPlayingFile;
use crate::playback::{self, Input, MachineSettings, PlaybackMachine, PlaybackState, Queue, Worker, WorkerHandle};
use crate::registry::InstanceGuard;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tunectl_common::config::{ConfigPaths, TomlConfig};
use tunectl_common::ControlCommand;

type BackendParts = (Arc<dyn MediaBackend>, mpsc::Receiver<BackendEvent>);

pub struct Daemon {
    paths: ConfigPaths,
    config: TomlConfig,
    queue: Vec<String>,
    backend: Option<BackendParts>,
    mixer: Option<Arc<dyn SystemMixer>>,
}

impl Daemon {
    pub fn new(paths: ConfigPaths, config: TomlConfig) -> Self {
        Self {
            paths,
            config,
            queue: Vec::new(),
            backend: None,
            mixer: None,
        }
    }

    /// Tracks to start playing once the channel is up
    pub fn with_queue(mut self, tracks: Vec<String>) -> Self {
        self.queue = tracks;
        self
    }

    /// Use an existing backend instead of the configured one
    pub fn with_backend(
        mut self,
        backend: Arc<dyn MediaBackend>,
        events: mpsc::Receiver<BackendEvent>,
    ) -> Self {
        self.backend = Some((backend, events));
        self
    }

    /// Use an existing mixer instead of probing the system
    pub fn with_mixer(mut self, mixer: Arc<dyn SystemMixer>) -> Self {
        self.mixer = Some(mixer);
        self
    }

    /// Serve as the singleton until `quit` or until `shutdown` is cancelled
    pub async fn run(mut self, mut guard: InstanceGuard, shutdown: CancellationToken) -> Result<()> {
        let (backend, events) = match self.backend.take() {
            Some(parts) => parts,
            None => {
                let (tx, rx) = event_channel();
                (create_backend(&self.config.backend, &self.paths, tx).await?, rx)
            }
        };

        let result = self.serve(&mut guard, backend.clone(), events, shutdown).await;

        if let Err(e) = backend.shutdown().await {
            warn!("Media backend shutdown failed: {}", e);
        }
        guard.release()?;
        info!("Singleton stopped");
        result
    }

    async fn serve(
        self,
        guard: &mut InstanceGuard,
        backend: Arc<dyn MediaBackend>,
        events: mpsc::Receiver<BackendEvent>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let Daemon {
            paths,
            config,
            queue,
            mixer,
            ..
        } = self;

        let equalizer = config.equalizer.active_gains();
        if let Err(e) = backend.set_equalizer(&equalizer).await {
            warn!("Failed to apply equalizer preset '{}': {}", config.equalizer.preset, e);
        }

        let mixer = match mixer {
            Some(mixer) => mixer,
            None => select_mixer(&config.mixer, backend.clone()).await,
        };
        let initial = initial_volume(mixer.as_ref(), backend.as_ref(), config.playback.default_volume).await;
        info!("Volume via '{}' mixer, starting at {}", mixer.name(), initial);

        let mut state = PlaybackState::new(Queue::new(queue), initial.level, equalizer);
        state.muted = initial.muted;
        let autoplay = !state.queue.is_empty();
        let mut machine = PlaybackMachine::new(state, backend.clone(), MachineSettings::from(&config.playback));
        if let Err(e) = machine.refresh_devices().await {
            warn!("Could not list output devices: {}", e);
        }
        let initial_snapshot = machine.state().snapshot();

        let stop = CancellationToken::new();
        let (handle, inbox) = playback::worker::channel(playback::worker::QUEUE_CAPACITY);
        let server = ControlServer::bind(
            &paths.socket_path(guard.instance_id()),
            handle.clone(),
            config.channel.connection_timeout(),
            stop.clone(),
        )?;

        let broadcaster = SnapshotBroadcaster::default();
        let unifier = VolumeUnifier::new(mixer, initial);
        let mut tasks = unifier.spawn(handle.clone(), stop.clone()).await;
        tasks.push(forward_backend_events(events, handle.clone(), stop.clone()));
        tasks.push(forward_shutdown(shutdown, handle.clone(), stop.clone()));
        if config.playback.now_playing_file {
            let file = NowPlayingFile::new(paths.now_playing_file());
            tasks.push(file.spawn(initial_snapshot, &broadcaster, stop.clone()));
        }

        let worker = Worker::new(machine, inbox, broadcaster, stop.clone()).with_unifier(unifier);
        let worker_task = tokio::spawn(worker.run());

        if let Err(e) = guard.publish(server.address()) {
            stop.cancel();
            return Err(e);
        }

        if autoplay {
            if let Err(e) = handle.send(ControlCommand::Play).await {
                warn!("Autoplay failed: {}", e);
            }
        }
        drop(handle);

        server.run().await;

        for task in tasks {
            if let Err(e) = task.await {
                warn!("Background task failed: {}", e);
            }
        }
        if let Err(e) = worker_task.await {
            warn!("Playback worker failed: {}", e);
        }
        Ok(())
    }
}

/// Level the mixer starts at
///
/// An OS mixer is left where the user put it and the backend is pinned at
/// full volume; the backend fallback starts at the configured default.
async fn initial_volume(mixer: &dyn SystemMixer, backend: &dyn MediaBackend, default_volume: u8) -> VolumeLevel {
    let fallback = VolumeLevel::new(default_volume, false);
    if !mixer.is_system() {
        if let Err(e) = mixer.set(fallback).await {
            warn!("Failed to set initial volume: {}", e);
        }
        return fallback;
    }
    if let Err(e) = backend.set_volume(100).await {
        warn!("Failed to pin backend volume: {}", e);
    }
    match mixer.get().await {
        Ok(level) => level,
        Err(e) => {
            warn!("Failed to read system volume: {}", e);
            fallback
        }
    }
}

fn forward_backend_events(
    mut events: mpsc::Receiver<BackendEvent>,
    worker: WorkerHandle,
    stop: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => {
                        if worker.inject(Input::Backend(event)).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        debug!("Backend event channel closed");
                        break;
                    }
                },
            }
        }
    })
}

/// Turn an external shutdown request (signal) into a regular `quit`
fn forward_shutdown(shutdown: CancellationToken, worker: WorkerHandle, stop: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = stop.cancelled() => {}
            _ = shutdown.cancelled() => {
                info!("Shutdown requested");
                if let Err(e) = worker.send(ControlCommand::Quit).await {
                    warn!("Quit on shutdown failed: {}", e);
                    stop.cancel();
                }
            }
        }
    })
}
