//! Build-time ("bake") and runtime environment variables.
//!
//! Two files feed the store, both in `KEY=value` line syntax:
//!
//! - the **bake file**: arbitrary keys, substituted literally into plugin
//!   source wherever a `__KEY__` token appears;
//! - the **env file**: restricted to the platform-reserved names in
//!   [`ENV_ALLOW_LIST`]. Any other key aborts construction with
//!   [`Error::RestrictedVariable`], mirroring a platform that refuses to let
//!   edge functions read arbitrary process environment.

use edge_common::{Error, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Environment names an edge function may inherit.
pub const ENV_ALLOW_LIST: [&str; 11] = [
    "REGION",
    "DEFAULT_REGION",
    "FUNCTION_NAME",
    "FUNCTION_VERSION",
    "MEMORY_SIZE",
    "LOG_GROUP_NAME",
    "LOG_STREAM_NAME",
    "NODE_OPTIONS",
    "TZ",
    "LANG",
    "PATH",
];

/// Whether `key` may appear in the env file.
pub fn is_allowed_env_key(key: &str) -> bool {
    ENV_ALLOW_LIST.contains(&key)
}

/// Flat bake and env maps plus the files they came from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VariableStore {
    bake_vars: BTreeMap<String, String>,
    env_vars: BTreeMap<String, String>,
    bake_path: Option<PathBuf>,
    env_path: Option<PathBuf>,
}

impl VariableStore {
    /// An empty store: no bake values, no environment.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load both files. Either may be omitted.
    ///
    /// A configured file that cannot be read is an error; so is any env key
    /// outside the allow-list.
    pub fn load(bake_path: Option<&Path>, env_path: Option<&Path>) -> Result<Self> {
        let bake_vars = match bake_path {
            Some(path) => read_assignments(path)?.into_iter().collect(),
            None => BTreeMap::new(),
        };

        let env_vars = match env_path {
            Some(path) => {
                let assignments = read_assignments(path)?;
                check_env_keys(assignments.iter().map(|(k, _)| k.as_str()), path)?;
                assignments.into_iter().collect()
            }
            None => BTreeMap::new(),
        };

        debug!(
            bake = bake_vars.len(),
            env = env_vars.len(),
            "variable store loaded"
        );

        Ok(Self {
            bake_vars,
            env_vars,
            bake_path: bake_path.map(Path::to_path_buf),
            env_path: env_path.map(Path::to_path_buf),
        })
    }

    /// Build from in-memory maps, applying the same env allow-list.
    pub fn from_maps(
        bake_vars: BTreeMap<String, String>,
        env_vars: BTreeMap<String, String>,
    ) -> Result<Self> {
        check_env_keys(env_vars.keys().map(String::as_str), Path::new("<inline>"))?;
        Ok(Self {
            bake_vars,
            env_vars,
            bake_path: None,
            env_path: None,
        })
    }

    pub fn bake_vars(&self) -> &BTreeMap<String, String> {
        &self.bake_vars
    }

    pub fn env_vars(&self) -> &BTreeMap<String, String> {
        &self.env_vars
    }

    pub fn bake(&self, key: &str) -> Option<&str> {
        self.bake_vars.get(key).map(String::as_str)
    }

    pub fn env(&self, key: &str) -> Option<&str> {
        self.env_vars.get(key).map(String::as_str)
    }

    pub fn bake_path(&self) -> Option<&Path> {
        self.bake_path.as_deref()
    }

    pub fn env_path(&self) -> Option<&Path> {
        self.env_path.as_deref()
    }
}

fn check_env_keys<'a>(keys: impl IntoIterator<Item = &'a str>, path: &Path) -> Result<()> {
    for key in keys {
        if !is_allowed_env_key(key) {
            return Err(Error::RestrictedVariable {
                key: key.to_string(),
                path: path.to_path_buf(),
            });
        }
    }
    Ok(())
}

fn read_assignments(path: &Path) -> Result<Vec<(String, String)>> {
    let text = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    Ok(parse_assignments(&text, path))
}

/// Parse `KEY=value` lines.
///
/// Blank lines and `#` comments are ignored, a leading `export ` is
/// accepted, the value is everything after the first `=` (trimmed, one layer
/// of matching quotes removed). Lines without `=` are skipped with a warning.
/// Later assignments of the same key win when collected into a map.
pub fn parse_assignments(text: &str, origin: &Path) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            warn!(
                path = %origin.display(),
                line = idx + 1,
                "ignoring line without '='"
            );
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            warn!(path = %origin.display(), line = idx + 1, "ignoring assignment with empty key");
            continue;
        }
        out.push((key.to_string(), unquote(value.trim()).to_string()));
    }
    out
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}
