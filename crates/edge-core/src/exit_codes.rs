//! Exit codes for the `edge-runner` CLI.
//!
//! Exit codes communicate the outcome without requiring output parsing.
//! They are stable across releases.

use edge_common::Error;

/// Exit codes for edge-runner operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    /// Success
    Clean = 0,

    /// A request stage answered with a generated response
    ShortCircuited = 1,

    /// Configuration error
    ConfigError = 10,

    /// Env file set a name outside the allow-list
    RestrictedVariable = 11,

    /// Two modules bound the same stage
    DuplicateStage = 12,

    /// I/O error
    IoError = 13,

    /// Internal/unknown error
    InternalError = 99,
}

impl ExitCode {
    /// Convert to i32 for process exit.
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Check if this exit code indicates success.
    pub fn is_success(self) -> bool {
        matches!(self, ExitCode::Clean | ExitCode::ShortCircuited)
    }

    /// Check if this exit code indicates an error requiring attention.
    pub fn is_error(self) -> bool {
        (self as i32) >= 10
    }

    /// Exit code for an error that stopped the command.
    pub fn for_error(err: &Error) -> Self {
        match err {
            Error::Config(_) | Error::InvalidConfig { .. } | Error::PluginPathNotFound { .. } => {
                ExitCode::ConfigError
            }
            Error::RestrictedVariable { .. } => ExitCode::RestrictedVariable,
            Error::DuplicateStageBinding { .. } => ExitCode::DuplicateStage,
            Error::Io { .. } => ExitCode::IoError,
            _ => ExitCode::InternalError,
        }
    }
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as i32
    }
}
