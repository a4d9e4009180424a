//! Resolution of relative `require` specifiers.
//!
//! Local modules are looked up the CommonJS way (exact file, then `.js`,
//! `.cjs`, `.json`, then `index.js` inside a directory) and must stay inside
//! the plugin root after symlinks are resolved. Sources are baked before they
//! reach the sandbox.

use super::bake;
use serde_json::json;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const EXTENSIONS: [&str; 3] = ["js", "cjs", "json"];

/// Resolver for one plugin context.
#[derive(Debug, Clone)]
pub struct ModuleResolver {
    root: PathBuf,
    bake_vars: Arc<BTreeMap<String, String>>,
}

/// A resolved local module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedModule {
    pub path: PathBuf,
    pub dir: PathBuf,
    pub source: String,
    pub is_json: bool,
}

/// Why a specifier could not be loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// The target exists but lies outside the plugin root.
    Denied(String),
    Missing(String),
}

impl ModuleResolver {
    /// `root` is canonicalized when possible so confinement checks compare
    /// like with like.
    pub fn new(root: &Path, bake_vars: Arc<BTreeMap<String, String>>) -> Self {
        let root = fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
        Self { root, bake_vars }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolve(
        &self,
        from_dir: &Path,
        specifier: &str,
    ) -> std::result::Result<ResolvedModule, ResolveError> {
        let base = if Path::new(specifier).is_absolute() {
            PathBuf::from(specifier)
        } else {
            from_dir.join(specifier)
        };

        let Some(found) = candidates(&base).into_iter().find(|p| p.is_file()) else {
            return Err(ResolveError::Missing(format!(
                "Cannot find module '{specifier}'"
            )));
        };

        let canonical = fs::canonicalize(&found)
            .map_err(|e| ResolveError::Missing(format!("{}: {e}", found.display())))?;
        if !canonical.starts_with(&self.root) {
            return Err(ResolveError::Denied(format!(
                "module '{specifier}' resolves outside the plugin root"
            )));
        }

        let raw = fs::read_to_string(&canonical)
            .map_err(|e| ResolveError::Missing(format!("{}: {e}", canonical.display())))?;
        let source = bake::substitute(&raw, &self.bake_vars).into_owned();
        let dir = canonical
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        let is_json = canonical.extension().is_some_and(|ext| ext == "json");

        Ok(ResolvedModule {
            path: canonical,
            dir,
            source,
            is_json,
        })
    }

    /// Resolve and encode the answer for the JS loader.
    pub fn resolve_json(&self, from_dir: &str, specifier: &str) -> String {
        let answer = match self.resolve(Path::new(from_dir), specifier) {
            Ok(module) => json!({
                "kind": if module.is_json { "json" } else { "module" },
                "path": module.path.to_string_lossy(),
                "dir": module.dir.to_string_lossy(),
                "source": module.source,
            }),
            Err(ResolveError::Denied(message)) => json!({ "kind": "denied", "message": message }),
            Err(ResolveError::Missing(message)) => json!({ "kind": "missing", "message": message }),
        };
        answer.to_string()
    }
}

fn candidates(base: &Path) -> Vec<PathBuf> {
    let mut out = vec![base.to_path_buf()];
    let file_name = base
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    for ext in EXTENSIONS {
        out.push(base.with_file_name(format!("{file_name}.{ext}")));
    }
    out.push(base.join("index.js"));
    out
}
