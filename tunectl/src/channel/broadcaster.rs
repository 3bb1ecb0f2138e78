//! Snapshot fan-out to observers

use futures::stream::{Stream, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, trace, warn};
use tunectl_common::StateSnapshot;

/// Snapshots buffered per observer before it starts skipping
pub const OBSERVER_BACKLOG: usize = 64;

/// Distributes state snapshots to every connected observer
///
/// Each observer reads from its own position in a bounded ring. A slow
/// observer that falls more than the ring size behind skips ahead to the
/// oldest retained snapshot; the publisher never waits.
#[derive(Clone)]
pub struct SnapshotBroadcaster {
    tx: broadcast::Sender<StateSnapshot>,
}

impl SnapshotBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        info!("Snapshot broadcaster initialized with capacity {}", capacity);
        Self { tx }
    }

    /// Publish a snapshot, ignoring the case of no observers
    pub fn publish(&self, snapshot: StateSnapshot) {
        let seq = snapshot.seq;
        match self.tx.send(snapshot) {
            Ok(count) => debug!("Broadcast snapshot #{} to {} observers", seq, count),
            Err(_) => trace!("No observers for snapshot #{}", seq),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateSnapshot> {
        self.tx.subscribe()
    }
}

impl Default for SnapshotBroadcaster {
    fn default() -> Self {
        Self::new(OBSERVER_BACKLOG)
    }
}

/// Turn a receiver into a stream that skips over lag instead of failing
pub fn snapshot_stream(rx: broadcast::Receiver<StateSnapshot>) -> impl Stream<Item = StateSnapshot> {
    BroadcastStream::new(rx).filter_map(|result| async move {
        match result {
            Ok(snapshot) => Some(snapshot),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!("Observer lagged, skipped {} snapshots", skipped);
                None
            }
        }
    })
}
