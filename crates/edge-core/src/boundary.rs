//! What the file-serving layer receives from the runner.

use crate::pipeline::{RequestResolution, RequestRun, ResponseRun};
use edge_common::{BodyEncoding, HeaderMap, Stage};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

/// Answers "does this request path exist" for the fallback rule.
pub trait PathProbe {
    fn exists(&self, path: &str) -> bool;
}

/// [`PathProbe`] over a document root on disk.
///
/// The query string is ignored and `..` segments can never climb above the
/// root.
#[derive(Debug, Clone)]
pub struct DirectoryProbe {
    root: PathBuf,
}

impl DirectoryProbe {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Map a request path onto the document root.
    pub fn resolve(&self, path: &str) -> PathBuf {
        let path = path.split(['?', '#']).next().unwrap_or_default();
        let mut out = self.root.clone();
        let mut depth = 0usize;
        for component in Path::new(path.trim_start_matches('/')).components() {
            match component {
                Component::Normal(part) => {
                    out.push(part);
                    depth += 1;
                }
                Component::ParentDir if depth > 0 => {
                    out.pop();
                    depth -= 1;
                }
                _ => {}
            }
        }
        out
    }
}

impl PathProbe for DirectoryProbe {
    fn exists(&self, path: &str) -> bool {
        self.resolve(path).exists()
    }
}

/// Result of the request side, as the file layer consumes it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RequestOutcome {
    /// Write this response verbatim; serve nothing from disk.
    ShortCircuit {
        status: u16,
        status_description: String,
        headers: HeaderMap,
        body: Option<String>,
        body_encoding: Option<BodyEncoding>,
    },
    /// Serve `path` (uri plus `?querystring` when non-empty).
    Forward {
        path: String,
        headers: HeaderMap,
        stage: Option<Stage>,
    },
}

impl RequestOutcome {
    /// The path to serve: the rewritten one if it exists, else `original`.
    ///
    /// Short-circuited requests serve nothing and return `None`.
    pub fn serve_path(&self, original: &str, probe: &dyn PathProbe) -> Option<String> {
        match self {
            RequestOutcome::ShortCircuit { .. } => None,
            RequestOutcome::Forward { path, .. } => {
                if path == original || probe.exists(path) {
                    Some(path.clone())
                } else {
                    Some(original.to_string())
                }
            }
        }
    }
}

impl From<RequestRun> for RequestOutcome {
    fn from(run: RequestRun) -> Self {
        match run.resolution {
            RequestResolution::ShortCircuit { response, .. } => RequestOutcome::ShortCircuit {
                status: response.status,
                status_description: response.status_description,
                headers: response.headers,
                body: response.body,
                body_encoding: response.body_encoding,
            },
            RequestResolution::Forward { request, stage } => RequestOutcome::Forward {
                path: request.addressable_path(),
                headers: request.headers,
                stage,
            },
        }
    }
}

/// Final response metadata, applied before any body byte is written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResponseOutcome {
    pub status: u16,
    pub status_description: String,
    /// Display name → value; repeated headers joined with `", "`.
    pub headers: BTreeMap<String, String>,
}

impl From<ResponseRun> for ResponseOutcome {
    fn from(run: ResponseRun) -> Self {
        Self {
            status: run.response.status,
            status_description: run.response.status_description,
            headers: run.response.headers.flatten(),
        }
    }
}
