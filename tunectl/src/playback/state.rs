//! Playback state owned by the worker

use super::queue::Queue;
use tunectl_common::protocol::{OutputDevice, StateSnapshot, TransportStatus, AUTO_DEVICE, EQ_BANDS};
use tunectl_common::time;

/// Complete playback state
///
/// Only the state machine mutates this; everyone else sees
/// [`StateSnapshot`] copies.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackState {
    pub status: TransportStatus,
    pub queue: Queue,
    pub position_secs: f64,
    pub duration_secs: Option<f64>,
    /// Backend load id of the current track, `None` when nothing is loaded
    pub load_id: Option<u64>,
    pub volume: u8,
    pub muted: bool,
    pub equalizer: [i8; EQ_BANDS],
    pub output_device: String,
    pub devices: Vec<OutputDevice>,
    /// Stamped by the worker on every published change
    pub seq: u64,
}

impl PlaybackState {
    pub fn new(queue: Queue, volume: u8, equalizer: [i8; EQ_BANDS]) -> Self {
        Self {
            status: TransportStatus::Stopped,
            queue,
            position_secs: 0.0,
            duration_secs: None,
            load_id: None,
            volume: volume.min(100),
            muted: false,
            equalizer,
            output_device: AUTO_DEVICE.to_string(),
            devices: Vec::new(),
            seq: 0,
        }
    }

    /// Forget the loaded track and return to `Stopped`
    pub fn reset_track(&mut self) {
        self.status = TransportStatus::Stopped;
        self.position_secs = 0.0;
        self.duration_secs = None;
        self.load_id = None;
    }

    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            seq: self.seq,
            status: self.status,
            current_track: self.queue.current().map(str::to_string),
            queue: self.queue.tracks().to_vec(),
            queue_index: self.queue.index(),
            position_secs: self.position_secs,
            duration_secs: self.duration_secs,
            volume: self.volume,
            muted: self.muted,
            equalizer: self.equalizer,
            output_device: self.output_device.clone(),
            devices: self.devices.clone(),
            updated_at: time::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_state_is_stopped_on_auto_device() {
        let state = PlaybackState::new(Queue::new(vec!["A".into()]), 150, [0; EQ_BANDS]);
        assert_eq!(state.status, TransportStatus::Stopped);
        assert_eq!(state.volume, 100);
        assert_eq!(state.output_device, AUTO_DEVICE);
        assert_eq!(state.snapshot().current_track.as_deref(), Some("A"));
    }
}
