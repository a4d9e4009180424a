//! Build-time token substitution.
//!
//! Every `__NAME__` token whose `NAME` is a key of the bake map is replaced by
//! the literal value. Values are inserted verbatim: `$`, `\` and anything else
//! that a pattern engine would treat specially is never interpreted. Tokens
//! with no bake value are left as they are.

use edge_common::{Error, Result};
use regex::{Captures, Regex};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::debug;

static TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"__([A-Z0-9_.\-]+?)__").expect("regex"));

/// Substitute bake tokens in `source`.
pub fn substitute<'a>(source: &'a str, vars: &BTreeMap<String, String>) -> Cow<'a, str> {
    if vars.is_empty() {
        return Cow::Borrowed(source);
    }
    TOKEN_RE.replace_all(source, |caps: &Captures<'_>| match vars.get(&caps[1]) {
        Some(value) => value.clone(),
        None => caps[0].to_string(),
    })
}

/// Token names referenced by `source` that have no bake value.
pub fn unresolved_tokens(source: &str, vars: &BTreeMap<String, String>) -> Vec<String> {
    let mut names: Vec<String> = TOKEN_RE
        .captures_iter(source)
        .map(|caps| caps[1].to_string())
        .filter(|name| !vars.contains_key(name))
        .collect();
    names.sort();
    names.dedup();
    names
}

/// Where the baked copy of `module` goes.
///
/// For a single-file plugin path the output is a file; for a plugin
/// directory the output is a directory mirroring the module's file name.
pub fn artifact_path(output: &Path, plugin_root: &Path, module: &Path) -> PathBuf {
    if plugin_root.is_dir() {
        let relative = module
            .strip_prefix(plugin_root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| module.file_name().map(PathBuf::from).unwrap_or_default());
        output.join(relative)
    } else {
        output.to_path_buf()
    }
}

/// Write baked source, creating parent directories as needed.
pub fn write_artifact(path: &Path, baked: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    }
    fs::write(path, baked).map_err(|e| Error::io(path, e))?;
    debug!(path = %path.display(), bytes = baked.len(), "wrote baked artifact");
    Ok(())
}
