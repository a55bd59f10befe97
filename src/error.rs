//! Error types for the streaming pipeline
//!
//! Defines module-specific error types using thiserror for clear error
//! propagation. Only session-start failures ever reach the caller; everything
//! after a successful start is handled inside the streaming loop.

use thiserror::Error;

/// Main error type for the output streaming pipeline
#[derive(Error, Debug)]
pub enum Error {
    /// Audio device/session could not be opened (no device, driver refusal)
    #[error("Device open error: {0}")]
    DeviceOpen(String),

    /// Session configuration rejected before the device was touched
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation not valid in the current scheduler state
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Convenience Result type using the pipeline Error
pub type Result<T> = std::result::Result<T, Error>;
