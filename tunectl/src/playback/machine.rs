//! Playback state machine
//!
//! ```text
//! Stopped -> Playing <-> Paused -> Stopped
//!    any  -> ShuttingDown (quit)
//! ```
//!
//! `apply` performs the backend calls a transition needs and then commits the
//! new state. Whether anything observable changed is reported separately via
//! [`PlaybackMachine::take_change`] so the worker can decide what to publish,
//! including after a failed command that still changed state.

use super::{Input, PlaybackState};
use crate::backend::{track_url, BackendEvent, MediaBackend};
use crate::error::{Error, Result};
use crate::mixer::VolumeLevel;
use std::sync::Arc;
use tracing::{debug, info, warn};
use tunectl_common::config::PlaybackConfig;
use tunectl_common::protocol::AUTO_DEVICE;
use tunectl_common::{ControlCommand, TransportStatus};

/// Kind of change produced by the last inputs
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Change {
    None,
    /// Only the playback position moved
    Position,
    State,
}

/// Step sizes for commands sent without an argument
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MachineSettings {
    pub seek_step_secs: f64,
    pub volume_step: u8,
}

impl Default for MachineSettings {
    fn default() -> Self {
        Self {
            seek_step_secs: 10.0,
            volume_step: 5,
        }
    }
}

impl From<&PlaybackConfig> for MachineSettings {
    fn from(config: &PlaybackConfig) -> Self {
        Self {
            seek_step_secs: config.seek_step_secs,
            volume_step: config.volume_step,
        }
    }
}

pub struct PlaybackMachine {
    state: PlaybackState,
    backend: Arc<dyn MediaBackend>,
    settings: MachineSettings,
    change: Change,
    /// Backend exited or stopped answering; restart before the next load
    backend_lost: bool,
}

impl PlaybackMachine {
    pub fn new(state: PlaybackState, backend: Arc<dyn MediaBackend>, settings: MachineSettings) -> Self {
        Self {
            state,
            backend,
            settings,
            change: Change::None,
            backend_lost: false,
        }
    }

    pub fn state(&self) -> &PlaybackState {
        &self.state
    }

    pub fn volume_level(&self) -> VolumeLevel {
        VolumeLevel::new(self.state.volume, self.state.muted)
    }

    /// Report and reset the change accumulated since the last call
    pub fn take_change(&mut self) -> Change {
        std::mem::replace(&mut self.change, Change::None)
    }

    /// Increment and return the snapshot sequence number
    pub fn stamp(&mut self) -> u64 {
        self.state.seq += 1;
        self.state.seq
    }

    fn mark(&mut self, change: Change) {
        self.change = self.change.max(change);
    }

    /// Re-read the backend's output device list
    pub async fn refresh_devices(&mut self) -> Result<()> {
        let devices = self.backend.list_devices().await?;
        if devices != self.state.devices {
            self.state.devices = devices;
            self.mark(Change::State);
        }
        Ok(())
    }

    /// Refresh the device list, logging instead of failing
    async fn sync_devices(&mut self) {
        if let Err(e) = self.refresh_devices().await {
            debug!("Could not refresh output devices: {}", e);
        }
    }

    pub async fn apply(&mut self, input: Input) -> Result<()> {
        match input {
            Input::Command(command) => self.apply_command(command).await,
            Input::Backend(event) => self.apply_backend_event(event).await,
            Input::Mixer { level, .. } => {
                self.apply_mixer(level);
                Ok(())
            }
        }
    }

    async fn apply_command(&mut self, command: ControlCommand) -> Result<()> {
        if self.state.status == TransportStatus::ShuttingDown {
            return match command {
                ControlCommand::QueryState | ControlCommand::Quit => Ok(()),
                _ => Err(Error::ShuttingDown),
            };
        }

        match command {
            ControlCommand::Play => self.play().await,
            ControlCommand::Pause => self.pause().await,
            ControlCommand::TogglePause => match self.state.status {
                TransportStatus::Playing => self.pause().await,
                _ => self.play().await,
            },
            ControlCommand::Next => self.next().await,
            ControlCommand::Prev => self.prev().await,
            ControlCommand::SeekForward { seconds } => {
                let offset = self.seek_offset(seconds)?;
                self.seek_by(offset).await
            }
            ControlCommand::SeekBack { seconds } => {
                let offset = self.seek_offset(seconds)?;
                self.seek_by(-offset).await
            }
            ControlCommand::VolumeUp { step } => {
                let step = step.unwrap_or(self.settings.volume_step);
                self.adjust_volume(i16::from(step));
                Ok(())
            }
            ControlCommand::VolumeDown { step } => {
                let step = step.unwrap_or(self.settings.volume_step);
                self.adjust_volume(-i16::from(step));
                Ok(())
            }
            ControlCommand::Mute => {
                self.state.muted = !self.state.muted;
                self.mark(Change::State);
                Ok(())
            }
            ControlCommand::SetOutputDevice { device } => self.set_output_device(&device).await,
            ControlCommand::Quit => {
                self.quit().await;
                Ok(())
            }
            ControlCommand::QueryState => {
                self.sync_devices().await;
                Ok(())
            }
        }
    }

    fn seek_offset(&self, seconds: Option<f64>) -> Result<f64> {
        let offset = seconds.unwrap_or(self.settings.seek_step_secs);
        if !offset.is_finite() || offset < 0.0 {
            return Err(Error::ChannelProtocol(format!("invalid seek offset {}", offset)));
        }
        Ok(offset)
    }

    async fn play(&mut self) -> Result<()> {
        match self.state.status {
            TransportStatus::Stopped => self.load_current(TransportStatus::Playing).await,
            TransportStatus::Paused => {
                let result = self.backend.play().await;
                self.guard(result)?;
                self.state.status = TransportStatus::Playing;
                self.mark(Change::State);
                Ok(())
            }
            TransportStatus::Playing | TransportStatus::ShuttingDown => Ok(()),
        }
    }

    async fn pause(&mut self) -> Result<()> {
        if self.state.status != TransportStatus::Playing {
            return Ok(());
        }
        let result = self.backend.pause().await;
        self.guard(result)?;
        self.state.status = TransportStatus::Paused;
        self.mark(Change::State);
        Ok(())
    }

    /// Load the current queue entry and leave the transport in `status`
    async fn load_current(&mut self, status: TransportStatus) -> Result<()> {
        let Some(url) = self.state.queue.current().map(track_url) else {
            return Ok(());
        };
        if self.backend_lost {
            self.restart_backend().await?;
        }

        let load_id = match self.backend.load(&url).await {
            Ok(load_id) => load_id,
            Err(e) => {
                warn!("Failed to load {}: {}", url, e);
                if matches!(e, Error::BackendUnresponsive(_)) {
                    self.backend_lost = true;
                }
                self.state.reset_track();
                self.mark(Change::State);
                return Err(e);
            }
        };
        info!("Loaded {} (load {})", url, load_id);

        self.state.load_id = Some(load_id);
        self.state.position_secs = 0.0;
        self.state.duration_secs = None;
        self.state.status = TransportStatus::Paused;
        self.mark(Change::State);

        if status == TransportStatus::Playing {
            let result = self.backend.play().await;
            self.guard(result)?;
            self.state.status = TransportStatus::Playing;
        }
        Ok(())
    }

    async fn next(&mut self) -> Result<()> {
        if self.state.queue.is_empty() {
            return Ok(());
        }
        if self.state.status == TransportStatus::Stopped {
            if self.state.queue.advance() {
                self.mark(Change::State);
            }
            return Ok(());
        }
        if !self.state.queue.advance() {
            info!("End of queue reached");
            let result = self.backend.stop().await;
            self.state.reset_track();
            self.mark(Change::State);
            return result;
        }
        let status = self.state.status;
        self.load_current(status).await
    }

    async fn prev(&mut self) -> Result<()> {
        if !self.state.queue.retreat() {
            return Ok(());
        }
        self.mark(Change::State);
        if self.state.status == TransportStatus::Stopped {
            return Ok(());
        }
        let status = self.state.status;
        self.load_current(status).await
    }

    async fn seek_by(&mut self, offset: f64) -> Result<()> {
        if !matches!(self.state.status, TransportStatus::Playing | TransportStatus::Paused) {
            return Ok(());
        }
        let target = (self.state.position_secs + offset).max(0.0);
        if let Some(duration) = self.state.duration_secs {
            if target >= duration {
                debug!("Seek to {:.1}s passes end of track ({:.1}s)", target, duration);
                return self.next().await;
            }
        }
        let result = self.backend.seek(target).await;
        self.guard(result)?;
        self.state.position_secs = target;
        self.mark(Change::State);
        Ok(())
    }

    fn adjust_volume(&mut self, delta: i16) {
        let volume = (i16::from(self.state.volume) + delta).clamp(0, 100) as u8;
        if volume != self.state.volume {
            self.state.volume = volume;
            self.mark(Change::State);
        }
    }

    async fn set_output_device(&mut self, device: &str) -> Result<()> {
        let result = self.switch_output_device(device).await;
        if !self.backend_lost {
            self.sync_devices().await;
        }
        result
    }

    async fn switch_output_device(&mut self, device: &str) -> Result<()> {
        match self.backend.set_output_device(device).await {
            Ok(()) => {
                if self.state.output_device != device {
                    info!("Output device: {}", device);
                    self.state.output_device = device.to_string();
                    self.mark(Change::State);
                }
                Ok(())
            }
            Err(Error::BackendUnresponsive(msg)) => self.guard(Err(Error::BackendUnresponsive(msg))),
            Err(Error::DeviceUnavailable(msg)) => Err(Error::DeviceUnavailable(msg)),
            Err(other) => Err(Error::DeviceUnavailable(format!("{}: {}", device, other))),
        }
    }

    async fn quit(&mut self) {
        info!("Quit requested");
        if self.state.load_id.is_some() {
            if let Err(e) = self.backend.stop().await {
                debug!("Backend stop during quit: {}", e);
            }
        }
        self.state.status = TransportStatus::ShuttingDown;
        self.mark(Change::State);
    }

    async fn apply_backend_event(&mut self, event: BackendEvent) -> Result<()> {
        if self.state.status == TransportStatus::ShuttingDown {
            return Ok(());
        }
        match event {
            BackendEvent::TrackEnded { load_id } => {
                if !self.is_current(load_id) {
                    debug!("Ignoring end of stale load {}", load_id);
                    return Ok(());
                }
                self.next().await
            }
            BackendEvent::Position { load_id, secs } => {
                if self.is_current(load_id)
                    && self.state.status == TransportStatus::Playing
                    && secs.is_finite()
                    && secs >= self.state.position_secs
                {
                    self.state.position_secs = secs;
                    self.mark(Change::Position);
                }
                Ok(())
            }
            BackendEvent::Duration { load_id, secs } => {
                if self.is_current(load_id)
                    && secs.is_finite()
                    && secs > 0.0
                    && self.state.duration_secs != Some(secs)
                {
                    self.state.duration_secs = Some(secs);
                    self.mark(Change::State);
                }
                Ok(())
            }
            BackendEvent::DeviceError { message } => {
                warn!("Output device error: {}", message);
                if let Err(e) = self.backend.set_output_device(AUTO_DEVICE).await {
                    warn!("Failed to fall back to {} device: {}", AUTO_DEVICE, e);
                }
                self.state.output_device = AUTO_DEVICE.to_string();
                self.mark(Change::State);
                self.sync_devices().await;
                self.pause().await
            }
            BackendEvent::Exited => {
                warn!("Media backend exited");
                self.state.reset_track();
                self.mark(Change::State);
                self.backend_lost = true;
                if let Err(e) = self.restart_backend().await {
                    warn!("Media backend restart failed, retrying on next play: {}", e);
                }
                Ok(())
            }
        }
    }

    fn apply_mixer(&mut self, level: VolumeLevel) {
        if self.state.status == TransportStatus::ShuttingDown {
            return;
        }
        if level != self.volume_level() {
            debug!("System mixer changed to {}", level);
            self.state.volume = level.level;
            self.state.muted = level.muted;
            self.mark(Change::State);
        }
    }

    async fn restart_backend(&mut self) -> Result<()> {
        info!("Restarting media backend");
        self.backend.restart().await?;
        self.backend_lost = false;
        self.sync_devices().await;
        Ok(())
    }

    fn is_current(&self, load_id: u64) -> bool {
        self.state.load_id == Some(load_id)
    }

    /// Force `Stopped` when the backend stopped answering
    fn guard<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(Error::BackendUnresponsive(msg)) = &result {
            warn!("Media backend unresponsive ({}), stopping", msg);
            self.state.reset_track();
            self.mark(Change::State);
            self.backend_lost = true;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{event_channel, BackendCall, MemoryBackend};
    use crate::playback::Queue;
    use tunectl_common::protocol::{OutputDevice, EQ_BANDS};

    fn machine(tracks: &[&str]) -> (PlaybackMachine, Arc<MemoryBackend>) {
        let (tx, _rx) = event_channel();
        let backend = Arc::new(MemoryBackend::new(tx));
        let queue = Queue::new(tracks.iter().map(|t| t.to_string()).collect());
        let state = PlaybackState::new(queue, 50, [0; EQ_BANDS]);
        (
            PlaybackMachine::new(state, backend.clone(), MachineSettings::default()),
            backend,
        )
    }

    #[tokio::test]
    async fn test_play_on_empty_queue_is_noop() {
        let (mut m, backend) = machine(&[]);
        m.apply(Input::Command(ControlCommand::Play)).await.unwrap();
        assert_eq!(m.state().status, TransportStatus::Stopped);
        assert_eq!(m.take_change(), Change::None);
        assert!(backend.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_play_loads_then_starts() {
        let (mut m, backend) = machine(&["/music/a.flac"]);
        m.apply(Input::Command(ControlCommand::Play)).await.unwrap();
        assert_eq!(m.state().status, TransportStatus::Playing);
        assert_eq!(
            backend.calls().await,
            vec![BackendCall::Load("/music/a.flac".into()), BackendCall::Play]
        );
    }

    #[tokio::test]
    async fn test_position_requires_playing_and_is_monotonic() {
        let (mut m, backend) = machine(&["a"]);
        m.apply(Input::Command(ControlCommand::Play)).await.unwrap();
        let load_id = backend.current_load_id().await;
        m.take_change();

        m.apply(Input::Backend(BackendEvent::Position { load_id, secs: 3.0 })).await.unwrap();
        assert_eq!(m.take_change(), Change::Position);
        m.apply(Input::Backend(BackendEvent::Position { load_id, secs: 2.0 })).await.unwrap();
        assert_eq!(m.state().position_secs, 3.0);

        m.apply(Input::Command(ControlCommand::Pause)).await.unwrap();
        m.apply(Input::Backend(BackendEvent::Position { load_id, secs: 9.0 })).await.unwrap();
        assert_eq!(m.state().position_secs, 3.0);
    }

    #[tokio::test]
    async fn test_stale_track_end_is_ignored() {
        let (mut m, backend) = machine(&["a", "b"]);
        m.apply(Input::Command(ControlCommand::Play)).await.unwrap();
        let stale = backend.current_load_id().await;
        m.apply(Input::Command(ControlCommand::Next)).await.unwrap();

        m.apply(Input::Backend(BackendEvent::TrackEnded { load_id: stale })).await.unwrap();
        assert_eq!(m.state().queue.index(), 1);
        assert_eq!(m.state().status, TransportStatus::Playing);
    }

    #[tokio::test]
    async fn test_unresponsive_backend_forces_stopped() {
        let (mut m, backend) = machine(&["a"]);
        m.apply(Input::Command(ControlCommand::Play)).await.unwrap();
        backend.set_unresponsive(true).await;

        let result = m.apply(Input::Command(ControlCommand::Pause)).await;
        assert!(matches!(result, Err(Error::BackendUnresponsive(_))));
        assert_eq!(m.state().status, TransportStatus::Stopped);
        assert!(m.state().load_id.is_none());
    }

    #[tokio::test]
    async fn test_device_error_falls_back_and_pauses() {
        let (mut m, _backend) = machine(&["a"]);
        m.apply(Input::Command(ControlCommand::SetOutputDevice { device: "null".into() }))
            .await
            .unwrap();
        m.apply(Input::Command(ControlCommand::Play)).await.unwrap();

        m.apply(Input::Backend(BackendEvent::DeviceError { message: "gone".into() }))
            .await
            .unwrap();
        assert_eq!(m.state().output_device, AUTO_DEVICE);
        assert_eq!(m.state().status, TransportStatus::Paused);
    }

    #[tokio::test]
    async fn test_commands_after_quit_are_rejected() {
        let (mut m, _backend) = machine(&["a"]);
        m.apply(Input::Command(ControlCommand::Quit)).await.unwrap();
        assert_eq!(m.state().status, TransportStatus::ShuttingDown);

        let result = m.apply(Input::Command(ControlCommand::Next)).await;
        assert!(matches!(result, Err(Error::ShuttingDown)));
        assert!(m.apply(Input::Command(ControlCommand::QueryState)).await.is_ok());
        assert!(m.apply(Input::Command(ControlCommand::Quit)).await.is_ok());
    }

    #[tokio::test]
    async fn test_infinite_seek_offset_is_rejected() {
        let (mut m, _backend) = machine(&["a"]);
        let result = m
            .apply(Input::Command(ControlCommand::SeekForward { seconds: Some(f64::INFINITY) }))
            .await;
        assert!(matches!(result, Err(Error::ChannelProtocol(_))));
    }

    #[tokio::test]
    async fn test_negative_seek_offset_is_rejected() {
        let (mut m, backend) = machine(&["a"]);
        m.apply(Input::Command(ControlCommand::Play)).await.unwrap();
        backend.clear_calls().await;

        let result = m
            .apply(Input::Command(ControlCommand::SeekForward { seconds: Some(-5.0) }))
            .await;
        assert!(matches!(result, Err(Error::ChannelProtocol(_))));
        let result = m
            .apply(Input::Command(ControlCommand::SeekBack { seconds: Some(-5.0) }))
            .await;
        assert!(matches!(result, Err(Error::ChannelProtocol(_))));
        assert_eq!(m.state().position_secs, 0.0);
        assert!(backend.calls().await.is_empty());
    }

    fn device(name: &str) -> OutputDevice {
        OutputDevice {
            name: name.to_string(),
            description: name.to_string(),
        }
    }

    fn device_names(m: &PlaybackMachine) -> Vec<String> {
        m.state().devices.iter().map(|d| d.name.clone()).collect()
    }

    #[tokio::test]
    async fn test_device_list_follows_backend() {
        let (mut m, backend) = machine(&["a"]);
        m.refresh_devices().await.unwrap();
        assert_eq!(device_names(&m), vec!["auto", "null"]);

        // A device that appears later shows up once switched to
        backend.set_devices(vec![device("auto"), device("null"), device("hdmi")]).await;
        m.apply(Input::Command(ControlCommand::SetOutputDevice { device: "hdmi".into() }))
            .await
            .unwrap();
        assert_eq!(m.state().output_device, "hdmi");
        assert_eq!(device_names(&m), vec!["auto", "null", "hdmi"]);

        // An unplugged device disappears after the output error
        m.apply(Input::Command(ControlCommand::Play)).await.unwrap();
        backend.set_devices(vec![device("auto"), device("null")]).await;
        m.apply(Input::Backend(BackendEvent::DeviceError { message: "unplugged".into() }))
            .await
            .unwrap();
        assert_eq!(m.state().output_device, AUTO_DEVICE);
        assert_eq!(device_names(&m), vec!["auto", "null"]);
    }

    #[tokio::test]
    async fn test_failed_switch_and_query_refresh_devices() {
        let (mut m, backend) = machine(&["a"]);
        backend.set_devices(vec![device("auto"), device("usb")]).await;

        let result = m
            .apply(Input::Command(ControlCommand::SetOutputDevice { device: "hdmi".into() }))
            .await;
        assert!(matches!(result, Err(Error::DeviceUnavailable(_))));
        assert_eq!(device_names(&m), vec!["auto", "usb"]);

        backend.set_devices(vec![device("auto")]).await;
        m.take_change();
        m.apply(Input::Command(ControlCommand::QueryState)).await.unwrap();
        assert_eq!(device_names(&m), vec!["auto"]);
        assert_eq!(m.take_change(), Change::State);
    }

    #[tokio::test]
    async fn test_backend_exit_restarts_backend() {
        let (mut m, backend) = machine(&["/music/a.flac", "/music/b.flac"]);
        m.apply(Input::Command(ControlCommand::Play)).await.unwrap();
        backend.clear_calls().await;

        m.apply(Input::Backend(BackendEvent::Exited)).await.unwrap();
        assert_eq!(m.state().status, TransportStatus::Stopped);
        assert_eq!(backend.calls().await, vec![BackendCall::Restart]);

        m.apply(Input::Command(ControlCommand::Play)).await.unwrap();
        assert_eq!(m.state().status, TransportStatus::Playing);
        assert_eq!(
            backend.calls().await,
            vec![
                BackendCall::Restart,
                BackendCall::Load("/music/a.flac".into()),
                BackendCall::Play
            ]
        );
    }

    #[tokio::test]
    async fn test_unresponsive_backend_is_restarted_before_next_load() {
        let (mut m, backend) = machine(&["a"]);
        m.apply(Input::Command(ControlCommand::Play)).await.unwrap();
        backend.set_unresponsive(true).await;
        assert!(m.apply(Input::Command(ControlCommand::Pause)).await.is_err());
        assert_eq!(m.state().status, TransportStatus::Stopped);

        backend.set_unresponsive(false).await;
        backend.clear_calls().await;
        m.apply(Input::Command(ControlCommand::Play)).await.unwrap();
        assert_eq!(m.state().status, TransportStatus::Playing);
        assert_eq!(backend.calls().await.first(), Some(&BackendCall::Restart));

        // Restarted once, not on every load
        backend.clear_calls().await;
        m.apply(Input::Command(ControlCommand::Pause)).await.unwrap();
        m.apply(Input::Command(ControlCommand::Play)).await.unwrap();
        assert!(!backend.calls().await.contains(&BackendCall::Restart));
    }

    #[tokio::test]
    async fn test_mixer_reading_updates_volume() {
        let (mut m, _backend) = machine(&[]);
        m.apply(Input::Mixer { level: VolumeLevel::new(30, true), seq: 0 })
            .await
            .unwrap();
        assert_eq!(m.state().volume, 30);
        assert!(m.state().muted);
        assert_eq!(m.take_change(), Change::State);
    }
}
