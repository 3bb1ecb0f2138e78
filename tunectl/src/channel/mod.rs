//! Local control channel
//!
//! A Unix domain socket inside the config directory. Short-lived CLI
//! invocations connect, send one command and read one snapshot back;
//! observers connect once and receive a snapshot after every change.

pub mod broadcaster;
pub mod client;
pub mod server;

pub use broadcaster::{snapshot_stream, SnapshotBroadcaster, OBSERVER_BACKLOG};
pub use client::{ControlClient, Observer};
pub use server::ControlServer;
