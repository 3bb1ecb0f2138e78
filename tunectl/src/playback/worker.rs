//! Single-writer playback worker
//!
//! The worker task is the only owner of [`PlaybackMachine`]. Everything else
//! talks to it through a cloneable [`WorkerHandle`]. After each input it
//! stamps and broadcasts a snapshot if the change is observable, writes
//! volume changes through to the [`VolumeUnifier`], and answers the caller.

use super::{Change, Input, PlaybackMachine};
use crate::channel::broadcaster::SnapshotBroadcaster;
use crate::error::{Error, Result};
use crate::mixer::VolumeUnifier;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tunectl_common::{ControlCommand, StateSnapshot, TransportStatus};

/// Jobs queued ahead of the worker before senders wait
pub const QUEUE_CAPACITY: usize = 128;

/// Current state plus every later change, obtained atomically
pub struct Subscription {
    pub snapshot: StateSnapshot,
    pub updates: broadcast::Receiver<StateSnapshot>,
}

enum Job {
    Apply {
        input: Input,
        reply: Option<oneshot::Sender<Result<StateSnapshot>>>,
    },
    Subscribe {
        reply: oneshot::Sender<Subscription>,
    },
}

/// Receiving end of the worker queue
pub struct WorkerInbox(mpsc::Receiver<Job>);

#[derive(Clone)]
pub struct WorkerHandle {
    tx: mpsc::Sender<Job>,
}

/// Create the worker queue
pub fn channel(capacity: usize) -> (WorkerHandle, WorkerInbox) {
    let (tx, rx) = mpsc::channel(capacity);
    (WorkerHandle { tx }, WorkerInbox(rx))
}

impl WorkerHandle {
    /// Apply a command and wait for the resulting snapshot
    pub async fn send(&self, command: ControlCommand) -> Result<StateSnapshot> {
        self.apply(Input::Command(command)).await
    }

    pub async fn apply(&self, input: Input) -> Result<StateSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Job::Apply {
                input,
                reply: Some(reply),
            })
            .await
            .map_err(|_| Error::ShuttingDown)?;
        rx.await.map_err(|_| Error::ShuttingDown)?
    }

    /// Queue an input without waiting for it to be applied
    pub async fn inject(&self, input: Input) -> Result<()> {
        self.tx
            .send(Job::Apply { input, reply: None })
            .await
            .map_err(|_| Error::ShuttingDown)
    }

    pub async fn subscribe(&self) -> Result<Subscription> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Job::Subscribe { reply })
            .await
            .map_err(|_| Error::ShuttingDown)?;
        rx.await.map_err(|_| Error::ShuttingDown)
    }
}

pub struct Worker {
    machine: PlaybackMachine,
    inbox: WorkerInbox,
    broadcaster: SnapshotBroadcaster,
    unifier: Option<VolumeUnifier>,
    shutdown: CancellationToken,
    published_second: Option<u64>,
}

impl Worker {
    /// `shutdown` is cancelled once the machine reaches `ShuttingDown`
    pub fn new(
        machine: PlaybackMachine,
        inbox: WorkerInbox,
        broadcaster: SnapshotBroadcaster,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            machine,
            inbox,
            broadcaster,
            unifier: None,
            shutdown,
            published_second: None,
        }
    }

    pub fn with_unifier(mut self, unifier: VolumeUnifier) -> Self {
        self.unifier = Some(unifier);
        self
    }

    /// Process jobs until every handle is dropped
    pub async fn run(mut self) {
        info!("Playback worker started");
        while let Some(job) = self.inbox.0.recv().await {
            match job {
                Job::Apply { input, reply } => {
                    let result = self.handle(input).await;
                    if let Some(reply) = reply {
                        let _ = reply.send(result);
                    }
                }
                Job::Subscribe { reply } => {
                    let updates = self.broadcaster.subscribe();
                    let snapshot = self.machine.state().snapshot();
                    debug!("Observer subscribed at #{}", snapshot.seq);
                    let _ = reply.send(Subscription { snapshot, updates });
                }
            }
        }
        info!("Playback worker stopped");
    }

    async fn handle(&mut self, input: Input) -> Result<StateSnapshot> {
        let from_mixer = match &input {
            Input::Mixer { seq, .. } => {
                if let Some(unifier) = &self.unifier {
                    if !unifier.is_current(*seq) {
                        debug!("Discarding mixer reading #{} (local #{})", seq, unifier.issued());
                        return Ok(self.machine.state().snapshot());
                    }
                }
                true
            }
            _ => false,
        };

        let before = self.machine.volume_level();
        let result = self.machine.apply(input).await;
        let after = self.machine.volume_level();

        if after != before {
            if let Some(unifier) = &self.unifier {
                if from_mixer {
                    unifier.note_external(after);
                } else {
                    unifier.commit_local(after);
                }
            }
        }

        let change = self.machine.take_change();
        let snapshot = self.publish(change);

        if snapshot.status == TransportStatus::ShuttingDown && !self.shutdown.is_cancelled() {
            info!("Playback worker entering shutdown");
            self.shutdown.cancel();
        }

        result.map(|()| snapshot)
    }

    /// Stamp and broadcast observable changes; position-only changes count
    /// only when the whole second moves
    fn publish(&mut self, change: Change) -> StateSnapshot {
        let second = self.machine.state().position_secs.floor() as u64;
        let visible = match change {
            Change::None => false,
            Change::Position => self.published_second != Some(second),
            Change::State => true,
        };
        if !visible {
            return self.machine.state().snapshot();
        }

        self.published_second = Some(second);
        self.machine.stamp();
        let snapshot = self.machine.state().snapshot();
        self.broadcaster.publish(snapshot.clone());
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{event_channel, BackendEvent, MemoryBackend};
    use crate::playback::{MachineSettings, PlaybackState, Queue};
    use std::sync::Arc;

    async fn start(tracks: &[&str]) -> (WorkerHandle, Arc<MemoryBackend>, CancellationToken) {
        let (tx, _rx) = event_channel();
        let backend = Arc::new(MemoryBackend::new(tx));
        let queue = Queue::new(tracks.iter().map(|t| t.to_string()).collect());
        let mut machine = PlaybackMachine::new(
            PlaybackState::new(queue, 50, [0; 10]),
            backend.clone(),
            MachineSettings::default(),
        );
        machine.refresh_devices().await.unwrap();
        let (handle, inbox) = channel(QUEUE_CAPACITY);
        let shutdown = CancellationToken::new();
        let worker = Worker::new(machine, inbox, SnapshotBroadcaster::default(), shutdown.clone());
        tokio::spawn(worker.run());
        (handle, backend, shutdown)
    }

    #[tokio::test]
    async fn test_seq_increments_per_change_only() {
        let (handle, _backend, _shutdown) = start(&["a"]).await;
        let first = handle.send(ControlCommand::Play).await.unwrap();
        let second = handle.send(ControlCommand::QueryState).await.unwrap();
        let third = handle.send(ControlCommand::Mute).await.unwrap();
        assert_eq!(first.seq, 1);
        assert_eq!(second.seq, 1);
        assert_eq!(third.seq, 2);
    }

    #[tokio::test]
    async fn test_position_updates_coalesce_to_whole_seconds() {
        let (handle, backend, _shutdown) = start(&["a"]).await;
        handle.send(ControlCommand::Play).await.unwrap();
        let load_id = backend.current_load_id().await;
        let sub = handle.subscribe().await.unwrap();
        let mut updates = sub.updates;

        for secs in [0.2, 0.5, 0.9, 1.1, 1.6] {
            handle
                .apply(Input::Backend(BackendEvent::Position { load_id, secs }))
                .await
                .unwrap();
        }
        handle.send(ControlCommand::Mute).await.unwrap();

        // 0.x is the same second as the Play snapshot, 1.1 is new, 1.6 is not
        assert_eq!(updates.recv().await.unwrap().position_secs, 1.1);
        assert!(updates.recv().await.unwrap().muted);
    }

    #[tokio::test]
    async fn test_quit_cancels_shutdown_token() {
        let (handle, _backend, shutdown) = start(&[]).await;
        let snapshot = handle.send(ControlCommand::Quit).await.unwrap();
        assert_eq!(snapshot.status, TransportStatus::ShuttingDown);
        assert!(shutdown.is_cancelled());
        assert!(matches!(
            handle.send(ControlCommand::Play).await,
            Err(Error::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_subscription_starts_at_current_state() {
        let (handle, _backend, _shutdown) = start(&["a"]).await;
        handle.send(ControlCommand::VolumeUp { step: None }).await.unwrap();
        let sub = handle.subscribe().await.unwrap();
        assert_eq!(sub.snapshot.volume, 55);
        assert_eq!(sub.snapshot.seq, 1);
    }
}
