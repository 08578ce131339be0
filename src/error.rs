//! Error types for the doorbell control plane.

use std::fmt;

/// Error type for control-plane operations.
#[derive(Debug)]
pub enum Error {
    /// IO error from a hardware register access.
    Io(std::io::Error),
    /// The device handle is no longer tracked (torn down or mid-removal).
    InvalidDevice,
    /// Invalid configuration.
    InvalidConfig(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::InvalidDevice => write!(f, "device is no longer valid"),
            Error::InvalidConfig(msg) => write!(f, "invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

/// Result type for control-plane operations.
pub type Result<T> = std::result::Result<T, Error>;
