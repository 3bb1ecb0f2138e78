//! One-line status file for status bars and the tray popup
//!
//! `▶ <track>  1:23/4:56`, rewritten after every broadcast snapshot and
//! removed when the singleton exits.

use crate::channel::broadcaster::{snapshot_stream, SnapshotBroadcaster};
use crate::error::Result;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use tunectl_common::time::format_clock;
use tunectl_common::{StateSnapshot, TransportStatus};

fn status_icon(status: TransportStatus) -> &'static str {
    match status {
        TransportStatus::Playing => "▶",
        TransportStatus::Paused => "⏸",
        TransportStatus::Stopped | TransportStatus::ShuttingDown => "⏹",
    }
}

/// Render a snapshot as the status line
pub fn status_line(snapshot: &StateSnapshot) -> String {
    let track = snapshot.current_track.as_deref().unwrap_or("-");
    format!(
        "{} {}  {}/{}",
        status_icon(snapshot.status),
        track,
        format_clock(snapshot.position_secs),
        format_clock(snapshot.duration_secs.unwrap_or(0.0))
    )
}

pub struct NowPlayingFile {
    path: PathBuf,
}

impl NowPlayingFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the file contents atomically
    pub fn write(&self, snapshot: &StateSnapshot) -> Result<()> {
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, format!("{}\n", status_line(snapshot)))?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn remove(&self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove {}: {}", self.path.display(), e);
            }
        }
    }

    /// Write `initial`, then follow the broadcaster until `stop`
    pub fn spawn(
        self,
        initial: StateSnapshot,
        broadcaster: &SnapshotBroadcaster,
        stop: CancellationToken,
    ) -> JoinHandle<()> {
        let updates = snapshot_stream(broadcaster.subscribe());
        tokio::spawn(async move {
            tokio::pin!(updates);
            if let Err(e) = self.write(&initial) {
                warn!("Failed to write {}: {}", self.path.display(), e);
            }
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    next = updates.next() => match next {
                        Some(snapshot) => {
                            if let Err(e) = self.write(&snapshot) {
                                warn!("Failed to write {}: {}", self.path.display(), e);
                            }
                        }
                        None => break,
                    },
                }
            }
            self.remove();
            debug!("Now-playing file removed");
        })
    }
}
