//! Shotlog daemon library
//!
//! Re-exports the daemon's modules for integration testing.

pub mod config;
pub mod engine;
pub mod state;
pub mod writer;
