//! Error types for pipeline invocations

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// The distinguishing kind carried by every failed invocation.
///
/// Callers use it to tell "your request was invalid" (`ResolutionError`)
/// from "the system broke" (`ExecutionError`, `ColdStartError`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    ColdStartError,
    ResolutionError,
    ExecutionError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ColdStartError => "ColdStartError",
            ErrorKind::ResolutionError => "ResolutionError",
            ErrorKind::ExecutionError => "ExecutionError",
        }
    }

    /// Parse the name written into envelopes and failure replies
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "ColdStartError" => Some(ErrorKind::ColdStartError),
            "ResolutionError" => Some(ErrorKind::ResolutionError),
            "ExecutionError" => Some(ErrorKind::ExecutionError),
            _ => None,
        }
    }

    /// Convert the kind to an HTTP status code
    pub fn status_code(&self) -> u16 {
        match self {
            ErrorKind::ResolutionError => 400,
            ErrorKind::ExecutionError => 500,
            ErrorKind::ColdStartError => 503,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed invocation: a kind plus a message safe to show the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct InvocationError {
    pub kind: ErrorKind,
    pub message: String,
}

impl InvocationError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn cold_start(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ColdStartError, message)
    }

    pub fn resolution(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ResolutionError, message)
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ExecutionError, message)
    }

    /// Convert to a response envelope
    pub fn to_response(&self) -> crate::Response {
        crate::Response::error(self)
    }
}

/// Errors from the length-prefixed JSON framing
#[derive(Error, Debug)]
pub enum IpcError {
    #[error("IPC I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Frame of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("Stream closed in the middle of a frame")]
    Truncated,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trips_through_its_name() {
        for kind in [
            ErrorKind::ColdStartError,
            ErrorKind::ResolutionError,
            ErrorKind::ExecutionError,
        ] {
            assert_eq!(ErrorKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ErrorKind::parse("IOError"), None);
    }

    #[test]
    fn test_status_codes_separate_caller_and_system_faults() {
        assert_eq!(ErrorKind::ResolutionError.status_code(), 400);
        assert_eq!(ErrorKind::ExecutionError.status_code(), 500);
    }

    #[test]
    fn test_display_includes_kind() {
        let err = InvocationError::resolution("unknown pipeline 'ndvi'");
        assert_eq!(err.to_string(), "ResolutionError: unknown pipeline 'ndvi'");
    }
}
