//! Error types for the segmented reduction runtime.
//!
//! Device and runtime failures (buffer creation, program build, kernel
//! launch) are unrecoverable for a run: they propagate to the caller and the
//! binary exits non-zero. Configuration mismatches are not errors at all;
//! they are clamped in [`crate::config::SegsumConfig::clamp_to`].

use crate::memory::MemorySpace;
use thiserror::Error;

/// Errors produced by the segmented sum runtime.
#[derive(Debug, Error)]
pub enum SegsumError {
    /// A device call failed (buffer creation, copy, read-back, queue finish).
    #[error("device call `{call}` failed: {status}")]
    Device { call: &'static str, status: String },

    /// The kernel program failed to compile.
    #[error("kernel program build failed:\n{log}")]
    Build { log: String },

    /// A kernel could not be configured or enqueued.
    #[error("launch of kernel `{kernel}` failed: {status}")]
    Launch { kernel: &'static str, status: String },

    /// Allocation of a memory block failed.
    #[error("allocation of {bytes} bytes in space '{space}' failed: {status}")]
    Allocation {
        space: MemorySpace,
        bytes: usize,
        status: String,
    },

    /// A released (null) block was used where a live buffer is required.
    #[error("use of a released block in space '{space}'")]
    NullBlock { space: MemorySpace },

    /// A forced execution plan cannot cover the requested shape.
    #[error("plan `{plan}` cannot reduce this shape: {reason}")]
    IneligiblePlan { plan: &'static str, reason: String },

    /// Host data did not have the expected shape.
    #[error("shape mismatch: expected {expected}, got {actual}")]
    Shape { expected: String, actual: String },

    /// The text reader rejected its input.
    #[error("parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    /// The binary reader rejected its input.
    #[error("binary input error at byte {offset}: {message}")]
    Binary { offset: usize, message: String },

    /// No compute backend matched the request.
    #[error("no compute device available: {0}")]
    NoDevice(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SegsumError {
    pub(crate) fn device(call: &'static str, status: impl ToString) -> Self {
        SegsumError::Device {
            call,
            status: status.to_string(),
        }
    }

    pub(crate) fn launch(kernel: &'static str, status: impl ToString) -> Self {
        SegsumError::Launch {
            kernel,
            status: status.to_string(),
        }
    }
}

/// Result alias used throughout the library.
pub type Result<T> = std::result::Result<T, SegsumError>;
