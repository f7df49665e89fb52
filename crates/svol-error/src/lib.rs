#![forbid(unsafe_code)]
//! Error types for slicevol.
//!
//! Defines `VolError` and a `Result<T>` alias used throughout the workspace.

use thiserror::Error;

/// Unified error type for all slicevol operations.
#[derive(Debug, Error)]
pub enum VolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid argument: {0}")]
    InvalidArgs(&'static str),

    #[error("out of range: {0}")]
    OutOfRange(&'static str),

    #[error("no space left on device")]
    NoSpace,

    #[error("allocation failed")]
    NoMemory,

    #[error("not found: {0}")]
    NotFound(&'static str),

    #[error("bad state: {0}")]
    BadState(&'static str),

    #[error("not supported")]
    NotSupported,

    #[error("buffer too small")]
    BufferTooSmall,
}

/// Result alias using `VolError`.
pub type Result<T> = std::result::Result<T, VolError>;
