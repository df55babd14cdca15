//! Telemetry queue command-line core.
//!
//! This library backs the `tq` binary:
//! - Exit codes for CLI operations
//! - Structured logging setup
//! - Command implementations over a user's persisted event queue
//! - Output rendering
//!
//! The binary entry point is in `main.rs`.

pub mod commands;
pub mod exit_codes;
pub mod logging;
pub mod output;
