//! Error types for the telemetry queue.
//!
//! This module provides structured error handling with:
//! - Stable error codes for machine parsing
//! - Category classification for error grouping
//! - Recoverability hints for automation
//! - Remediation suggestions for humans
//!
//! Only synchronous, pre-validation failures (bad configuration, a backend
//! that was only partially configured) reach the caller through this type.
//! Asynchronous storage and upload failures travel through completion
//! callbacks and are contained by the pipeline.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for telemetry queue operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories for grouping related errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Configuration values and backend wiring.
    Config,
    /// Durable blob store operations.
    Storage,
    /// Ticket/auth provider failures.
    Auth,
    /// Event and payload construction.
    Payload,
    /// File I/O and serialization errors.
    Io,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Config => write!(f, "config"),
            ErrorCategory::Storage => write!(f, "storage"),
            ErrorCategory::Auth => write!(f, "auth"),
            ErrorCategory::Payload => write!(f, "payload"),
            ErrorCategory::Io => write!(f, "io"),
        }
    }
}

/// Unified error type for the telemetry queue.
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors (10-19)
    #[error("configuration error: {0}")]
    Config(String),

    #[error("max file size must be at least {minimum} bytes, got {requested}")]
    InvalidMaxFileSize { requested: u64, minimum: u64 },

    #[error("storage allotment ({requested} bytes) must not be smaller than the max file size ({max_file_size} bytes)")]
    InvalidStorageAllotment { requested: u64, max_file_size: u64 },

    #[error("invalid tenant limits: {0}")]
    InvalidTenantLimits(String),

    // Storage errors (20-29)
    #[error("storage {op} failed for '{key}': {reason}")]
    Storage {
        op: String,
        key: String,
        reason: String,
    },

    #[error("corrupt directory file: {0}")]
    CorruptDirectory(String),

    // Auth errors (30-39)
    #[error("ticket request failed: {0}")]
    Ticket(String),

    // Payload errors (40-49)
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    // I/O errors (60-69)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Returns the error code for this error type.
    ///
    /// Error codes are stable and grouped by category:
    /// - 10-19: Configuration errors
    /// - 20-29: Storage errors
    /// - 30-39: Auth errors
    /// - 40-49: Payload errors
    /// - 60-69: I/O errors
    pub fn code(&self) -> u32 {
        match self {
            Error::Config(_) => 10,
            Error::InvalidMaxFileSize { .. } => 11,
            Error::InvalidStorageAllotment { .. } => 12,
            Error::InvalidTenantLimits(_) => 13,
            Error::Storage { .. } => 20,
            Error::CorruptDirectory(_) => 21,
            Error::Ticket(_) => 30,
            Error::InvalidEvent(_) => 40,
            Error::Io(_) => 60,
            Error::Json(_) => 61,
            Error::Toml(_) => 62,
        }
    }

    /// Returns the error category for grouping and filtering.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Config(_)
            | Error::InvalidMaxFileSize { .. }
            | Error::InvalidStorageAllotment { .. }
            | Error::InvalidTenantLimits(_) => ErrorCategory::Config,

            Error::Storage { .. } | Error::CorruptDirectory(_) => ErrorCategory::Storage,

            Error::Ticket(_) => ErrorCategory::Auth,

            Error::InvalidEvent(_) => ErrorCategory::Payload,

            Error::Io(_) | Error::Json(_) | Error::Toml(_) => ErrorCategory::Io,
        }
    }

    /// Returns whether this error is potentially recoverable.
    pub fn is_recoverable(&self) -> bool {
        match self {
            // Config errors: the value was rejected, nothing was applied
            Error::Config(_) => true,
            Error::InvalidMaxFileSize { .. } => true,
            Error::InvalidStorageAllotment { .. } => true,
            Error::InvalidTenantLimits(_) => true,

            // Storage: transient, retried on the next populate/flush
            Error::Storage { .. } => true,
            Error::CorruptDirectory(_) => false,

            // Auth: payload stays intact, scheduler retries
            Error::Ticket(_) => true,

            Error::InvalidEvent(_) => false,

            Error::Io(_) => true,
            Error::Json(_) => false,
            Error::Toml(_) => true,
        }
    }

    /// Returns a human-readable remediation hint.
    pub fn remediation(&self) -> &'static str {
        match self {
            Error::Config(_) => "Check the [queue], [tenant] and [upload] sections of the config file.",
            Error::InvalidMaxFileSize { .. } => "Use a max file size of at least 1024 bytes.",
            Error::InvalidStorageAllotment { .. } => {
                "Raise the storage allotment or lower the max file size first."
            }
            Error::InvalidTenantLimits(_) => {
                "Tenant limits must allow at least one event per payload and a non-zero event size."
            }
            Error::Storage { .. } => {
                "Check that the storage directory exists and is writable. The operation is retried automatically."
            }
            Error::CorruptDirectory(_) => {
                "The events directory file is unreadable. Remove it to start from an empty queue."
            }
            Error::Ticket(_) => "The payload was kept and will be retried on the next upload tick.",
            Error::InvalidEvent(_) => {
                "Event names must match [A-Za-z][A-Za-z0-9_]* and fields must be valid JSON."
            }
            Error::Io(_) => "Check disk space and permissions, then retry the operation.",
            Error::Json(_) => "Invalid JSON. Check the input with a JSON validator.",
            Error::Toml(_) => "Invalid TOML in the config file. Fix the reported line and retry.",
        }
    }
}
