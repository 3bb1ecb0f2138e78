//! # tunectl
//!
//! Playback control plane for a personal music player: one background
//! singleton per user drives an external media backend, while short-lived
//! CLI invocations (media keys, scripts, a tray popup) send it commands over
//! a local socket and observers follow its state.
//!
//! - [`registry`]: singleton election and replacement
//! - [`channel`]: control socket server, client and observer fan-out
//! - [`playback`]: state machine and its single-writer worker
//! - [`mixer`]: system mixer access and two-way volume sync
//! - [`backend`]: media backend adapters (mpv, in-memory)
//! - [`daemon`]: wiring of the above into a running singleton

pub mod backend;
pub mod channel;
pub mod daemon;
pub mod error;
pub mod logging;
pub mod mixer;
pub mod now_playing;
pub mod playback;
pub mod registry;

pub use daemon::Daemon;
pub use error::{Error, Result};
pub use registry::{InstanceGuard, InstanceRecord, InstanceRegistry, Intent, Role};
