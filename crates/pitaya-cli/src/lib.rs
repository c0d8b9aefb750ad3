//! Pitaya CLI library.
//!
//! Exposes the command implementations and demo services so integration
//! tests can drive them without spawning the binary.

pub mod commands;
pub mod services;
