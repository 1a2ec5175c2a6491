//! Runtime error types.

use std::io;

use thiserror::Error;

use crate::core::{ConfigError, FailReason, StreamError};

/// Errors returned by [`UdpStream`](super::UdpStream) operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Socket setup or I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The configuration was rejected.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// The operation was refused without affecting the connection.
    #[error("stream error: {0}")]
    Stream(#[from] StreamError),

    /// The connection failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(FailReason),

    /// The connection is closed, or its driver task is gone.
    #[error("connection closed")]
    Closed,
}

impl TransportError {
    /// Check if the connection is unusable after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::Io(_) | TransportError::ConnectionFailed(_) | TransportError::Closed
        )
    }
}

/// Result type for runtime operations.
pub type TransportResult<T> = Result<T, TransportError>;
