//! Config file resolution: CLI → env → XDG → defaults.

use crate::runner::RunnerConfig;
use edge_common::{Error, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "EDGE_RUNNER_CONFIG";

/// Directory name under the XDG config home.
pub const CONFIG_DIR_NAME: &str = "edge-runner";

/// Config file name inside the config directory.
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Where the effective configuration came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "source", content = "path", rename_all = "snake_case")]
pub enum ConfigSource {
    Cli(PathBuf),
    Env(PathBuf),
    Xdg(PathBuf),
    Defaults,
}

/// Candidate locations, in priority order.
#[derive(Debug, Clone, Default)]
pub struct ConfigPaths {
    /// `--config` from the command line.
    pub cli: Option<PathBuf>,
    /// Value of [`CONFIG_ENV_VAR`].
    pub env: Option<PathBuf>,
    /// `$XDG_CONFIG_HOME/edge-runner/config.toml`.
    pub xdg: Option<PathBuf>,
}

impl ConfigPaths {
    /// Fill the env and XDG candidates from the process environment.
    pub fn discover(cli: Option<PathBuf>) -> Self {
        Self {
            cli,
            env: std::env::var_os(CONFIG_ENV_VAR)
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            xdg: default_config_path(),
        }
    }
}

/// Resolved configuration plus its provenance.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub config: RunnerConfig,
    pub source: ConfigSource,
}

/// Resolve the effective configuration.
///
/// Explicit locations (CLI, env) must exist; the XDG location is optional and
/// falls back to defaults when absent.
pub fn resolve_config(paths: &ConfigPaths) -> Result<ResolvedConfig> {
    if let Some(path) = &paths.cli {
        return load_required(path).map(|config| ResolvedConfig {
            config,
            source: ConfigSource::Cli(path.clone()),
        });
    }

    if let Some(path) = &paths.env {
        return load_required(path).map(|config| ResolvedConfig {
            config,
            source: ConfigSource::Env(path.clone()),
        });
    }

    if let Some(path) = &paths.xdg {
        if path.is_file() {
            debug!(path = %path.display(), "using XDG config");
            return RunnerConfig::from_file(path).map(|config| ResolvedConfig {
                config,
                source: ConfigSource::Xdg(path.clone()),
            });
        }
    }

    Ok(ResolvedConfig {
        config: RunnerConfig::default(),
        source: ConfigSource::Defaults,
    })
}

fn load_required(path: &Path) -> Result<RunnerConfig> {
    if !path.is_file() {
        return Err(Error::Config(format!(
            "config file not found: {}",
            path.display()
        )));
    }
    RunnerConfig::from_file(path)
}

/// Default config file location.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
}
