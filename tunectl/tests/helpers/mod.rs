//! Test helper modules for tunectl integration tests
//!
//! - TestInstance: run a singleton in-process on a temporary config dir

#![allow(dead_code)]

pub mod test_instance;

pub use test_instance::{eventually, registry, TestInstance};
