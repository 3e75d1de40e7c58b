//! Error types and exit codes for fastcollect

use std::process::ExitCode;
use thiserror::Error;

/// Main error type for fastcollect operations
#[derive(Error, Debug)]
pub enum FastCollectError {
    #[error("File not found: {path}")]
    FileNotFound { path: String },

    #[error("Failed to parse file: {message}")]
    ParseFailure { message: String },

    #[error("Invalid filter expression: {0}")]
    Filter(#[from] crate::filter::FilterError),

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Daemon error: {message}")]
    Daemon { message: String },

    #[error(transparent)]
    Client(#[from] crate::client::ClientError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FastCollectError {
    /// Convert error to an exit code:
    /// - 0: Success
    /// - 1: File not found / IO error
    /// - 2: Invalid filter or configuration
    /// - 3: Parse failure
    /// - 4: Daemon or client failure
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Self::FileNotFound { .. } => ExitCode::from(1),
            Self::Io(_) => ExitCode::from(1),
            Self::Filter(_) => ExitCode::from(2),
            Self::Config { .. } => ExitCode::from(2),
            Self::ParseFailure { .. } => ExitCode::from(3),
            Self::Daemon { .. } => ExitCode::from(4),
            Self::Client(_) => ExitCode::from(4),
        }
    }
}

/// Result type alias for fastcollect operations
pub type Result<T> = std::result::Result<T, FastCollectError>;
