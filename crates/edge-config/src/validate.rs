//! Semantic validation of a [`RunnerConfig`].

use crate::runner::RunnerConfig;
use serde::Serialize;
use std::fmt;

/// A single semantic problem with the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Outcome of validating a configuration.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationResult {
    pub errors: Vec<ValidationError>,
}

impl ValidationResult {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    fn push(&mut self, field: &'static str, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field,
            message: message.into(),
        });
    }
}

/// Minimum stack a plugin runtime gets; below this even trivial handlers fail.
const MIN_STACK_KB: u32 = 64;

impl RunnerConfig {
    /// Check semantic constraints that the TOML schema cannot express.
    pub fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        match &self.plugins {
            None => result.push("plugins", "no plugin file or directory configured"),
            Some(path) if !path.exists() => {
                result.push("plugins", format!("{} does not exist", path.display()))
            }
            Some(_) => {}
        }

        for (field, path) in [("bake_file", &self.bake_file), ("env_file", &self.env_file)] {
            if let Some(path) = path {
                if !path.is_file() {
                    result.push(field, format!("{} is not a readable file", path.display()));
                }
            }
        }

        if let (Some(out), Some(plugins)) = (&self.bake_output, &self.plugins) {
            if out == plugins {
                result.push("bake_output", "must not overwrite the plugin source");
            } else if plugins.is_dir() && out.starts_with(plugins) {
                result.push("bake_output", "must not be inside the plugin directory");
            }
        }

        if self.function.version.trim().is_empty() {
            result.push("function.version", "must not be empty");
        }
        if self.function.memory_limit_mb == 0 {
            result.push("function.memory_limit_mb", "must be positive");
        }
        if self.sandbox.memory_limit_mb == 0 {
            result.push("sandbox.memory_limit_mb", "must be positive");
        }
        if self.sandbox.max_stack_kb < MIN_STACK_KB {
            result.push(
                "sandbox.max_stack_kb",
                format!("must be at least {MIN_STACK_KB}"),
            );
        }
        if self.watch.enabled && self.watch.debounce_ms == 0 {
            result.push("watch.debounce_ms", "must be positive when watching");
        }

        result
    }
}
