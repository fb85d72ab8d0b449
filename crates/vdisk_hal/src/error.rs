//! Error handling for the vdisk HAL
//!
//! This module provides structured error types for all HAL operations,
//! so that the provisioning engine can tell a missing binary apart from a
//! hung one or from a failed ownership lookup.

use std::fmt;
use std::io;
use std::result;
use std::time::Duration;

/// Result type for HAL operations
pub type HalResult<T> = result::Result<T, HalError>;

/// Error types for HAL operations
#[derive(Debug, Clone)]
pub enum HalError {
    /// I/O operation failed
    Io(IoError),
    /// A process could not be spawned or waited on
    Process(ProcessError),
    /// A process exceeded its time budget and was killed
    Timeout(TimeoutError),
    /// Operation not supported on this platform
    Unsupported(String),
}

#[derive(Debug, Clone)]
pub struct IoError {
    pub operation: String,
    pub path: Option<String>,
    pub kind: io::ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct ProcessError {
    pub operation: String,
    pub program: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct TimeoutError {
    pub program: String,
    pub limit: Duration,
}

impl fmt::Display for HalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HalError::Io(err) => match &err.path {
                Some(path) => write!(f, "I/O error in {} ({}): {}", err.operation, path, err.message),
                None => write!(f, "I/O error in {}: {}", err.operation, err.message),
            },
            HalError::Process(err) => write!(
                f,
                "Process error in {} for '{}': {}",
                err.operation, err.program, err.message
            ),
            HalError::Timeout(err) => write!(
                f,
                "'{}' did not finish within {:?}",
                err.program, err.limit
            ),
            HalError::Unsupported(msg) => write!(f, "Unsupported operation: {msg}"),
        }
    }
}

impl std::error::Error for HalError {}

impl From<io::Error> for HalError {
    fn from(err: io::Error) -> Self {
        HalError::Io(IoError {
            operation: "unknown".to_string(),
            path: None,
            kind: err.kind(),
            message: err.to_string(),
        })
    }
}

// Helper functions for creating specific error types
impl HalError {
    pub fn io_error(operation: &str, path: Option<&str>, err: io::Error) -> Self {
        HalError::Io(IoError {
            operation: operation.to_string(),
            path: path.map(|s| s.to_string()),
            kind: err.kind(),
            message: err.to_string(),
        })
    }

    pub fn process_error(operation: &str, program: &str, message: &str) -> Self {
        HalError::Process(ProcessError {
            operation: operation.to_string(),
            program: program.to_string(),
            message: message.to_string(),
        })
    }

    pub fn timeout(program: &str, limit: Duration) -> Self {
        HalError::Timeout(TimeoutError {
            program: program.to_string(),
            limit,
        })
    }

    pub fn unsupported(message: &str) -> Self {
        HalError::Unsupported(message.to_string())
    }

    /// The `io::ErrorKind` behind this error, if it came from an I/O call.
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            HalError::Io(err) => Some(err.kind),
            _ => None,
        }
    }
}
