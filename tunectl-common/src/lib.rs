//! # tunectl Common Library
//!
//! Shared code for the tunectl singleton, its control clients and observers:
//! - Control-channel protocol types (commands, snapshots, error codes)
//! - Newline-delimited JSON framing
//! - Configuration loading and config-directory resolution
//! - Time helpers

pub mod config;
pub mod error;
pub mod framing;
pub mod protocol;
pub mod time;

pub use error::{Error, Result};
pub use protocol::{ControlCommand, Request, Response, StateSnapshot, TransportStatus};
