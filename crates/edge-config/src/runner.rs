//! Runner configuration file (`config.toml`).
//!
//! ```toml
//! plugins = "edge/"
//! bake_file = "bake.env"
//! env_file = "runtime.env"
//! bake_output = "dist/edge"
//!
//! [function]
//! name = "site-edge"
//! version = "3"
//!
//! [watch]
//! enabled = true
//! debounce_ms = 150
//! ```
//!
//! Relative paths are resolved against the directory holding the file.
//!
//! `[watch]` is read by long-lived embedders through `EdgeRunner::start`; the
//! `edge-runner` commands are one-shot and always run with watching off.

use edge_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Default value reported by `context.getRemainingTimeInMillis()`.
pub const DEFAULT_REMAINING_TIME_MS: u64 = 5_000;

/// Default memory size in MB, reported to handlers and enforced on the sandbox.
pub const DEFAULT_MEMORY_LIMIT_MB: u32 = 128;

/// Default debounce window for filesystem change bursts.
pub const DEFAULT_DEBOUNCE_MS: u64 = 150;

/// Complete runner configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunnerConfig {
    /// Plugin file or directory of plugin files.
    pub plugins: Option<PathBuf>,

    /// `KEY=value` file of build-time substitutions.
    pub bake_file: Option<PathBuf>,

    /// `KEY=value` file of allow-listed runtime environment names.
    pub env_file: Option<PathBuf>,

    /// Where baked plugin source is written (file, or directory for a plugin directory).
    pub bake_output: Option<PathBuf>,

    pub function: FunctionSettings,
    pub distribution: DistributionSettings,
    pub sandbox: SandboxSettings,
    pub watch: WatchSettings,
}

/// Values surfaced to handlers through the context object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FunctionSettings {
    /// Function name; falls back to env `FUNCTION_NAME`, then the module file stem.
    pub name: Option<String>,
    pub version: String,
    pub memory_limit_mb: u32,
    pub remaining_time_ms: u64,
}

impl Default for FunctionSettings {
    fn default() -> Self {
        Self {
            name: None,
            version: "$LATEST".to_string(),
            memory_limit_mb: DEFAULT_MEMORY_LIMIT_MB,
            remaining_time_ms: DEFAULT_REMAINING_TIME_MS,
        }
    }
}

/// Values surfaced through `event.Records[0].cf.config`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DistributionSettings {
    pub domain_name: String,
    pub id: String,
}

impl Default for DistributionSettings {
    fn default() -> Self {
        Self {
            domain_name: "d111111abcdef8.cloudfront.net".to_string(),
            id: "EDFDVBD6EXAMPLE".to_string(),
        }
    }
}

/// Hard limits applied to every plugin runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SandboxSettings {
    pub memory_limit_mb: u32,
    pub max_stack_kb: u32,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            memory_limit_mb: DEFAULT_MEMORY_LIMIT_MB,
            max_stack_kb: 1024,
        }
    }
}

/// Hot reload settings. Library-only: the CLI turns `enabled` off.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WatchSettings {
    pub enabled: bool,
    pub debounce_ms: u64,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            debounce_ms: DEFAULT_DEBOUNCE_MS,
        }
    }
}

impl RunnerConfig {
    /// Parse TOML text, resolving relative paths against `base_dir`.
    pub fn from_toml_str(text: &str, base_dir: &Path, origin: &Path) -> Result<Self> {
        let mut config: RunnerConfig = toml::from_str(text).map_err(|e| Error::InvalidConfig {
            path: origin.to_path_buf(),
            message: e.to_string(),
        })?;
        config.rebase(base_dir);
        Ok(config)
    }

    /// Load a config file from disk.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_toml_str(&text, base_dir, path)
    }

    /// Make every relative path absolute with respect to `base_dir`.
    pub fn rebase(&mut self, base_dir: &Path) {
        for slot in [
            &mut self.plugins,
            &mut self.bake_file,
            &mut self.env_file,
            &mut self.bake_output,
        ] {
            if let Some(path) = slot.as_mut() {
                if path.is_relative() {
                    *path = base_dir.join(&*path);
                }
            }
        }
    }
}
