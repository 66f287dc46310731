//! Error taxonomy for sync sessions.
//!
//! Every backend maps its native failures into [`SyncError`] at the adapter
//! boundary, so retry decisions are made in one place.

use std::io;
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Connection error ({target}): {message}")]
    Connection { target: String, message: String },

    #[error("Authentication failed for {target}: {message}")]
    Authentication { target: String, message: String },

    #[error("Transfer failed for {path}: {message}")]
    Transfer { path: String, message: String },

    #[error("Source path not found: {}", path.display())]
    PathNotFound { path: PathBuf },

    #[error("Invalid ignore pattern '{pattern}': {reason}")]
    IgnoreRule { pattern: String, reason: String },

    #[error("Invalid destination path '{path}': {reason}")]
    InvalidDestination { path: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error while {operation}: {source}")]
    Io {
        operation: String,
        #[source]
        source: io::Error,
    },
}

impl SyncError {
    pub fn connection(target: impl Into<String>, message: impl ToString) -> Self {
        Self::Connection {
            target: target.into(),
            message: message.to_string(),
        }
    }

    pub fn transfer(path: impl Into<String>, message: impl ToString) -> Self {
        Self::Transfer {
            path: path.into(),
            message: message.to_string(),
        }
    }

    pub fn io(operation: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    /// Whether a failed attempt may succeed when repeated.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection { .. } | Self::Transfer { .. } => true,
            Self::Io { source, .. } => !matches!(
                source.kind(),
                io::ErrorKind::NotFound
                    | io::ErrorKind::PermissionDenied
                    | io::ErrorKind::InvalidInput
            ),
            Self::Authentication { .. }
            | Self::PathNotFound { .. }
            | Self::IgnoreRule { .. }
            | Self::InvalidDestination { .. }
            | Self::Config(_) => false,
        }
    }

    /// Errors that end the whole session rather than a single task.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Authentication { .. })
    }
}
