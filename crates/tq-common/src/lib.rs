//! Telemetry queue common types, IDs, errors, and configuration.
//!
//! This crate provides foundational types shared across the tq crates:
//! - User identity for per-user queues
//! - Common error types with stable codes
//! - Pipeline configuration loading and validation

pub mod config;
pub mod error;
pub mod id;

pub use config::{EventNaming, PipelineConfig, QueueConfig, TenantLimits, UploadConfig};
pub use error::{Error, ErrorCategory, Result};
pub use id::UserId;
