//! Library interface for the signal dispatch & execution engine. Exposed as
//! a crate, not just a binary, so integration tests can construct adapters
//! and application services directly.

pub mod adapters;
pub mod application;
pub mod bootstrap;
pub mod config;
pub mod domain;
pub mod error;
pub mod log_buffer;
pub mod logging;
pub mod ports;
