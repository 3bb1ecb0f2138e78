//! Two-way volume synchronisation between playback state and the mixer
//!
//! Local changes (committed by the worker) are pushed to the mixer through a
//! latest-value channel, so a burst of `volume-up` presses results in at most
//! one push in flight plus the newest pending level.
//!
//! External changes arrive as mixer notifications. They are read and
//! injected into the worker queue as [`Input::Mixer`], never applied
//! directly, and are discarded when:
//! - a local push is in flight (the read may predate it),
//! - a local change was committed after the read (checked again by the
//!   worker against the sequence stamped on the input),
//! - the level equals the last pushed one (our own echo).

use super::{SystemMixer, VolumeLevel};
use crate::playback::{Input, WorkerHandle};
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

struct Shared {
    mixer: Arc<dyn SystemMixer>,
    /// Local changes committed
    issued: AtomicU64,
    /// Local changes whose push has finished
    done: AtomicU64,
    last_pushed: AtomicU16,
    target: watch::Sender<(VolumeLevel, u64)>,
}

impl Shared {
    fn last_pushed(&self) -> VolumeLevel {
        VolumeLevel::from_bits(self.last_pushed.load(Ordering::SeqCst))
    }

    fn set_last_pushed(&self, level: VolumeLevel) {
        self.last_pushed.store(level.to_bits(), Ordering::SeqCst);
    }

    fn push_in_flight(&self) -> bool {
        self.done.load(Ordering::SeqCst) != self.issued.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
pub struct VolumeUnifier {
    shared: Arc<Shared>,
}

impl VolumeUnifier {
    /// `initial` is the level the mixer is known to be at
    pub fn new(mixer: Arc<dyn SystemMixer>, initial: VolumeLevel) -> Self {
        let (target, _) = watch::channel((initial, 0));
        Self {
            shared: Arc::new(Shared {
                mixer,
                issued: AtomicU64::new(0),
                done: AtomicU64::new(0),
                last_pushed: AtomicU16::new(initial.to_bits()),
                target,
            }),
        }
    }

    /// Record a local volume/mute change and schedule its push
    pub fn commit_local(&self, level: VolumeLevel) {
        let seq = self.shared.issued.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("Volume change #{} -> {}", seq, level);
        self.shared.target.send_replace((level, seq));
    }

    /// Record an accepted external change so it is not pushed back
    pub fn note_external(&self, level: VolumeLevel) {
        self.shared.set_last_pushed(level);
    }

    /// Number of local changes committed so far
    pub fn issued(&self) -> u64 {
        self.shared.issued.load(Ordering::SeqCst)
    }

    /// Whether a reading stamped with `seq` is still newer than every local change
    pub fn is_current(&self, seq: u64) -> bool {
        seq == self.issued()
    }

    /// Start the push task and, if the mixer can notify, the watch task
    pub async fn spawn(&self, worker: WorkerHandle, stop: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut tasks = vec![tokio::spawn(push_loop(self.shared.clone(), stop.clone()))];

        match self.shared.mixer.subscribe().await {
            Ok(Some(notifications)) => {
                tasks.push(tokio::spawn(watch_loop(
                    self.shared.clone(),
                    notifications,
                    worker,
                    stop,
                )));
            }
            Ok(None) => debug!("Mixer '{}' has no change notifications", self.shared.mixer.name()),
            Err(e) => warn!("Cannot watch mixer '{}': {}", self.shared.mixer.name(), e),
        }
        tasks
    }
}

async fn push_loop(shared: Arc<Shared>, stop: CancellationToken) {
    let mut targets = shared.target.subscribe();
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            changed = targets.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
        let (level, seq) = *targets.borrow_and_update();
        if level != shared.last_pushed() {
            match shared.mixer.set(level).await {
                Ok(()) => {
                    shared.set_last_pushed(level);
                    debug!("Pushed {} to mixer '{}'", level, shared.mixer.name());
                }
                Err(e) => warn!("Failed to push volume {}: {}", level, e),
            }
        }
        shared.done.store(seq, Ordering::SeqCst);
    }
}

async fn watch_loop(
    shared: Arc<Shared>,
    mut notifications: tokio::sync::mpsc::Receiver<()>,
    worker: WorkerHandle,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            notification = notifications.recv() => {
                if notification.is_none() {
                    info!("Mixer change notifications ended");
                    break;
                }
            }
        }

        let seq = shared.issued.load(Ordering::SeqCst);
        if shared.push_in_flight() {
            trace!("Mixer notification during push, dropped");
            continue;
        }
        let level = match shared.mixer.get().await {
            Ok(level) => level,
            Err(e) => {
                warn!("Failed to read mixer: {}", e);
                continue;
            }
        };
        if shared.issued.load(Ordering::SeqCst) != seq || shared.push_in_flight() {
            trace!("Local volume change during mixer read, dropped");
            continue;
        }
        if level == shared.last_pushed() {
            trace!("Mixer echo {} dropped", level);
            continue;
        }

        if worker.inject(Input::Mixer { level, seq }).await.is_err() {
            break;
        }
    }
}
