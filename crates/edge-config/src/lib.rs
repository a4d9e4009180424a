//! Edge Runner configuration loading and validation.
//!
//! This crate provides:
//! - The variable store (bake substitutions and allow-listed environment)
//! - Typed runner configuration read from TOML
//! - Config resolution (CLI → env → XDG → defaults)
//! - Semantic validation

pub mod resolve;
pub mod runner;
pub mod validate;
pub mod vars;

pub use resolve::{resolve_config, ConfigPaths, ConfigSource, ResolvedConfig};
pub use runner::{
    DistributionSettings, FunctionSettings, RunnerConfig, SandboxSettings, WatchSettings,
};
pub use validate::{ValidationError, ValidationResult};
pub use vars::{is_allowed_env_key, VariableStore, ENV_ALLOW_LIST};
