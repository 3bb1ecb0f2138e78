//! State machine scenarios against the in-memory backend
//!
//! Tests cover:
//! - Transport transitions (play, pause, toggle-pause)
//! - Queue navigation at both ends
//! - Seek clamping and seek-past-end
//! - Volume clamping and mute
//! - Output device switching

use std::sync::Arc;

use tunectl::backend::{event_channel, BackendCall, BackendEvent, MemoryBackend};
use tunectl::playback::{Input, MachineSettings, PlaybackMachine, PlaybackState, Queue};
use tunectl::Error;
use tunectl_common::protocol::AUTO_DEVICE;
use tunectl_common::{ControlCommand, TransportStatus};

/// Machine over a memory backend with the given queue
fn machine(tracks: &[&str], volume: u8) -> (PlaybackMachine, Arc<MemoryBackend>) {
    let (tx, _rx) = event_channel();
    let backend = Arc::new(MemoryBackend::new(tx));
    let queue = Queue::new(tracks.iter().map(|t| t.to_string()).collect());
    let state = PlaybackState::new(queue, volume, [0; 10]);
    let machine = PlaybackMachine::new(state, backend.clone(), MachineSettings::default());
    (machine, backend)
}

async fn cmd(machine: &mut PlaybackMachine, command: ControlCommand) {
    machine.apply(Input::Command(command)).await.unwrap();
}

/// Report a duration for the currently loaded track
async fn set_duration(machine: &mut PlaybackMachine, backend: &MemoryBackend, secs: f64) {
    let load_id = backend.current_load_id().await;
    machine
        .apply(Input::Backend(BackendEvent::Duration { load_id, secs }))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_toggle_pause_twice_from_stopped() {
    // Given: a stopped machine with one track
    let (mut m, _backend) = machine(&["A"], 50);

    // When: toggle-pause is sent twice
    cmd(&mut m, ControlCommand::TogglePause).await;
    assert_eq!(m.state().status, TransportStatus::Playing);
    cmd(&mut m, ControlCommand::TogglePause).await;

    // Then: Playing, then Paused
    assert_eq!(m.state().status, TransportStatus::Paused);
}

#[tokio::test]
async fn test_next_then_seek_past_end_advances() {
    // Given: queue [A, B, C] playing A at 0
    let (mut m, backend) = machine(&["A", "B", "C"], 50);
    cmd(&mut m, ControlCommand::Play).await;
    assert_eq!(m.state().queue.current(), Some("A"));

    // When: next
    cmd(&mut m, ControlCommand::Next).await;

    // Then: playing B at 0
    assert_eq!(m.state().status, TransportStatus::Playing);
    assert_eq!(m.state().queue.current(), Some("B"));
    assert_eq!(m.state().position_secs, 0.0);

    // When: B is 5 s long and we seek forward 10 s
    set_duration(&mut m, &backend, 5.0).await;
    cmd(&mut m, ControlCommand::SeekForward { seconds: Some(10.0) }).await;

    // Then: playing C at 0
    assert_eq!(m.state().status, TransportStatus::Playing);
    assert_eq!(m.state().queue.current(), Some("C"));
    assert_eq!(m.state().position_secs, 0.0);
    assert_eq!(m.state().duration_secs, None);
}

#[tokio::test]
async fn test_next_at_last_index_stops() {
    let (mut m, backend) = machine(&["A", "B"], 50);
    cmd(&mut m, ControlCommand::Play).await;
    cmd(&mut m, ControlCommand::Next).await;

    cmd(&mut m, ControlCommand::Next).await;

    assert_eq!(m.state().status, TransportStatus::Stopped);
    assert_eq!(m.state().queue.index(), 1);
    assert!(m.state().load_id.is_none());
    assert_eq!(backend.calls().await.last(), Some(&BackendCall::Stop));
}

#[tokio::test]
async fn test_prev_at_first_index_is_noop() {
    let (mut m, backend) = machine(&["A", "B"], 50);
    cmd(&mut m, ControlCommand::Play).await;
    m.take_change();
    let before = m.state().clone();
    backend.clear_calls().await;

    cmd(&mut m, ControlCommand::Prev).await;

    assert_eq!(m.state(), &before);
    assert_eq!(m.take_change(), tunectl::playback::Change::None);
    assert!(backend.calls().await.is_empty());
}

#[tokio::test]
async fn test_next_preserves_paused_status() {
    let (mut m, backend) = machine(&["A", "B"], 50);
    cmd(&mut m, ControlCommand::Play).await;
    cmd(&mut m, ControlCommand::Pause).await;
    backend.clear_calls().await;

    cmd(&mut m, ControlCommand::Next).await;

    assert_eq!(m.state().status, TransportStatus::Paused);
    assert_eq!(m.state().queue.current(), Some("B"));
    // Loaded but not started
    assert_eq!(
        backend.calls().await,
        vec![BackendCall::Load("https://music.youtube.com/watch?v=B".into())]
    );
}

#[tokio::test]
async fn test_navigation_while_stopped_only_moves_index() {
    let (mut m, backend) = machine(&["A", "B", "C"], 50);

    cmd(&mut m, ControlCommand::Next).await;
    cmd(&mut m, ControlCommand::Next).await;
    cmd(&mut m, ControlCommand::Prev).await;

    assert_eq!(m.state().status, TransportStatus::Stopped);
    assert_eq!(m.state().queue.current(), Some("B"));
    assert!(backend.calls().await.is_empty());

    // Play starts from the selected entry
    cmd(&mut m, ControlCommand::Play).await;
    assert_eq!(m.state().queue.current(), Some("B"));
    assert_eq!(m.state().status, TransportStatus::Playing);
}

#[tokio::test]
async fn test_seek_back_clamps_at_zero() {
    let (mut m, backend) = machine(&["A"], 50);
    cmd(&mut m, ControlCommand::Play).await;
    set_duration(&mut m, &backend, 200.0).await;
    cmd(&mut m, ControlCommand::SeekForward { seconds: None }).await;
    assert_eq!(m.state().position_secs, 10.0);

    cmd(&mut m, ControlCommand::SeekBack { seconds: Some(25.0) }).await;

    assert_eq!(m.state().position_secs, 0.0);
    assert_eq!(backend.calls().await.last(), Some(&BackendCall::Seek(0.0)));
}

#[tokio::test]
async fn test_seek_while_stopped_is_noop() {
    let (mut m, backend) = machine(&["A"], 50);
    cmd(&mut m, ControlCommand::SeekForward { seconds: None }).await;
    assert_eq!(m.state().position_secs, 0.0);
    assert!(backend.calls().await.is_empty());
}

#[tokio::test]
async fn test_track_end_advances_like_next() {
    let (mut m, backend) = machine(&["A", "B"], 50);
    cmd(&mut m, ControlCommand::Play).await;
    let load_id = backend.current_load_id().await;

    m.apply(Input::Backend(BackendEvent::TrackEnded { load_id }))
        .await
        .unwrap();

    assert_eq!(m.state().queue.current(), Some("B"));
    assert_eq!(m.state().status, TransportStatus::Playing);
}

#[tokio::test]
async fn test_volume_is_clamped() {
    let (mut m, _backend) = machine(&[], 98);
    cmd(&mut m, ControlCommand::VolumeUp { step: None }).await;
    assert_eq!(m.state().volume, 100);

    cmd(&mut m, ControlCommand::VolumeDown { step: Some(100) }).await;
    cmd(&mut m, ControlCommand::VolumeDown { step: None }).await;
    assert_eq!(m.state().volume, 0);
}

#[tokio::test]
async fn test_mute_twice_restores_volume() {
    let (mut m, _backend) = machine(&[], 37);

    cmd(&mut m, ControlCommand::Mute).await;
    assert!(m.state().muted);
    assert_eq!(m.state().volume, 37);

    cmd(&mut m, ControlCommand::Mute).await;
    assert!(!m.state().muted);
    assert_eq!(m.state().volume, 37);
}

#[tokio::test]
async fn test_unavailable_device_leaves_state_unchanged() {
    let (mut m, _backend) = machine(&["A"], 50);
    m.refresh_devices().await.unwrap();
    cmd(&mut m, ControlCommand::Play).await;
    m.take_change();
    let before = m.state().clone();

    let result = m
        .apply(Input::Command(ControlCommand::SetOutputDevice {
            device: "hdmi-7".into(),
        }))
        .await;

    assert!(matches!(result, Err(Error::DeviceUnavailable(_))));
    assert_eq!(m.state(), &before);
    assert_eq!(m.state().output_device, AUTO_DEVICE);
}

#[tokio::test]
async fn test_device_switch_keeps_transport_status() {
    let (mut m, backend) = machine(&["A"], 50);
    cmd(&mut m, ControlCommand::Play).await;

    cmd(&mut m, ControlCommand::SetOutputDevice { device: "null".into() }).await;

    assert_eq!(m.state().output_device, "null");
    assert_eq!(m.state().status, TransportStatus::Playing);
    assert_eq!(
        backend.calls().await.last(),
        Some(&BackendCall::SetOutputDevice("null".into()))
    );
}

#[tokio::test]
async fn test_backend_exit_forces_stopped() {
    let (mut m, _backend) = machine(&["A"], 50);
    cmd(&mut m, ControlCommand::Play).await;

    m.apply(Input::Backend(BackendEvent::Exited)).await.unwrap();

    assert_eq!(m.state().status, TransportStatus::Stopped);
    assert_eq!(m.state().queue.current(), Some("A"));
}
