// SPDX-License-Identifier: MIT
//
// PDF Sign Service: Multi-Tenant PDF Signing and Verification
// Copyright (c) 2025 PDF Sign Service Contributors
//
// https://github.com/pdfsign/pdfsign-service

//! Error types for the signing service
//!
//! Provides a unified error taxonomy using `thiserror` for ergonomic error handling.

pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for scheduling, storage and signing operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration validation failed
    #[error("Configuration error: {0}")]
    Config(String),

    /// Client supplied invalid input
    #[error("Validation error: {0}")]
    Validation(String),

    /// Referenced unit is not registered
    #[error("unit is not in map: {0}")]
    UnknownUnit(String),

    /// Referenced job does not exist
    #[error("job is not in map: {0}")]
    UnknownJob(String),

    /// Referenced task does not exist in its job
    #[error("task is not in map: {0}")]
    UnknownTask(String),

    /// Task has not been processed yet
    #[error("task {0} is still pending")]
    TaskPending(String),

    /// Task was processed and failed
    #[error("task {task} failed: {message}")]
    TaskFailed { task: String, message: String },

    /// Signing or verification primitive failed
    #[error("Signing error: {0}")]
    Signing(String),

    /// Cryptographic operation failed
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// License is expired, exhausted or bound to another host
    #[error("License error: {0}")]
    License(String),

    /// Persistence layer failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Worker or queue was shut down
    #[error("Shutting down")]
    Shutdown,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if the error leaves the process unable to make further progress
    pub fn is_terminal(&self) -> bool {
        matches!(self, Error::License(_))
    }

    /// Check if the error may clear on its own and the operation can be retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Storage(_) | Error::Io(_))
    }

    /// Check if the error was caused by the caller and maps to a 4xx response
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::Validation(_)
                | Error::UnknownUnit(_)
                | Error::UnknownJob(_)
                | Error::UnknownTask(_)
                | Error::TaskPending(_)
                | Error::TaskFailed { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(Error::License("expired".into()).is_terminal());
        assert!(!Error::Storage("disk full".into()).is_terminal());
        assert!(Error::Storage("database is locked".into()).is_retryable());
        assert!(!Error::Validation("bad".into()).is_retryable());

        assert!(Error::UnknownUnit("nope".into()).is_client_error());
        assert!(Error::TaskPending("t".into()).is_client_error());
        assert!(!Error::Internal("boom".into()).is_client_error());
    }

    #[test]
    fn test_unknown_unit_message() {
        let err = Error::UnknownUnit("nonexistent".into());
        assert!(err.to_string().contains("unit is not in map"));
    }
}
