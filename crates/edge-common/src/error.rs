//! Error types for Edge Runner.

use std::path::PathBuf;

use thiserror::Error;

use crate::stage::Stage;

/// Result type alias for Edge Runner operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for Edge Runner.
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors (10-19)
    #[error("configuration error: {0}")]
    Config(String),

    #[error("restricted variable '{key}' in {}: only platform-reserved names may be set", path.display())]
    RestrictedVariable { key: String, path: PathBuf },

    #[error("invalid configuration file {}: {message}", path.display())]
    InvalidConfig { path: PathBuf, message: String },

    // Module errors (20-29)
    #[error("failed to load module {}: {message}", path.display())]
    ModuleLoad { path: PathBuf, message: String },

    #[error(
        "stage {stage} is already bound to {}; refusing to also bind {}",
        first.display(),
        second.display()
    )]
    DuplicateStageBinding {
        stage: Stage,
        first: PathBuf,
        second: PathBuf,
    },

    #[error("plugin path not found: {}", path.display())]
    PluginPathNotFound { path: PathBuf },

    // Sandbox errors (30-39)
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("handler failure in {stage}: {message}")]
    HandlerFailure { stage: Stage, message: String },

    #[error("sandbox error: {0}")]
    Sandbox(String),

    // Watch errors (40-49)
    #[error("file watch error: {0}")]
    Watch(String),

    // I/O errors (60-69)
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Wrap an I/O error with the path it happened on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    /// Returns the error code for this error type.
    /// Used for detailed error reporting in JSON output.
    pub fn code(&self) -> u32 {
        match self {
            Error::Config(_) => 10,
            Error::RestrictedVariable { .. } => 11,
            Error::InvalidConfig { .. } => 12,
            Error::ModuleLoad { .. } => 20,
            Error::DuplicateStageBinding { .. } => 21,
            Error::PluginPathNotFound { .. } => 22,
            Error::PermissionDenied(_) => 30,
            Error::HandlerFailure { .. } => 31,
            Error::Sandbox(_) => 32,
            Error::Watch(_) => 40,
            Error::Io { .. } => 60,
            Error::Json(_) => 61,
        }
    }

    /// Whether this error must stop the runner from serving requests.
    ///
    /// Module-level and handler-level failures degrade to "stage absent";
    /// everything that leaves the edge configuration undefined is fatal.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Error::ModuleLoad { .. }
                | Error::PermissionDenied(_)
                | Error::HandlerFailure { .. }
                | Error::Watch(_)
        )
    }
}
