//! Playback state machine and its single-writer worker
//!
//! All state changes funnel through one [`worker::Worker`] task. Client
//! commands, backend events and mixer notifications are all [`Input`]s on the
//! same queue, so they are applied strictly in arrival order.

pub mod machine;
pub mod queue;
pub mod state;
pub mod worker;

pub use machine::{Change, MachineSettings, PlaybackMachine};
pub use queue::Queue;
pub use state::PlaybackState;
pub use worker::{Subscription, Worker, WorkerHandle};

use crate::backend::BackendEvent;
use crate::mixer::VolumeLevel;
use tunectl_common::ControlCommand;

/// One unit of work for the playback worker
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    /// Remote command from the control channel (or a signal handler)
    Command(ControlCommand),
    /// Notification from the media backend
    Backend(BackendEvent),
    /// External system mixer change, stamped with the local change count
    /// observed when it was read
    Mixer { level: VolumeLevel, seq: u64 },
}
