//! Restricted-header policy.
//!
//! CloudFront rejects edge functions that add, remove or rewrite certain
//! headers. The runner only warns: it snapshots the header map before a stage
//! runs, diffs it afterwards, and reports every restricted header whose
//! presence or value list changed.

use edge_common::{HeaderMap, Stage};
use serde::Serialize;
use tracing::warn;

/// Headers no stage may touch.
pub const RESTRICTED_HEADERS: [&str; 14] = [
    "host",
    "via",
    "connection",
    "expect",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "trailer",
    "upgrade",
    "transfer-encoding",
    "x-real-ip",
    "x-forwarded-proto",
    "x-cache",
];

/// Header families reserved by the platform.
pub const RESTRICTED_PREFIXES: [&str; 4] = ["x-amz-cf-", "x-amzn-", "x-edge-", "x-accel-"];

pub fn is_restricted(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    RESTRICTED_HEADERS.contains(&name.as_str())
        || RESTRICTED_PREFIXES.iter().any(|p| name.starts_with(p))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    Added,
    Removed,
    Modified,
}

/// A restricted header a stage changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeaderViolation {
    pub stage: Stage,
    pub header: String,
    pub kind: ViolationKind,
}

/// Headers captured before a stage runs.
#[derive(Debug, Clone)]
pub struct HeaderSnapshot {
    stage: Stage,
    headers: HeaderMap,
}

impl HeaderSnapshot {
    pub fn capture(stage: Stage, headers: &HeaderMap) -> Self {
        Self {
            stage,
            headers: headers.clone(),
        }
    }

    /// Compare against the headers the stage produced, logging each violation.
    pub fn diff(&self, after: &HeaderMap) -> Vec<HeaderViolation> {
        let mut names: Vec<&str> = self
            .headers
            .names()
            .chain(after.names())
            .filter(|name| is_restricted(name))
            .collect();
        names.sort_unstable();
        names.dedup();

        let mut violations = Vec::new();
        for name in names {
            let before = self.headers.values(name);
            let now = after.values(name);
            let kind = match (&before, &now) {
                (None, Some(_)) => ViolationKind::Added,
                (Some(_), None) => ViolationKind::Removed,
                (Some(a), Some(b)) if a != b => ViolationKind::Modified,
                _ => continue,
            };
            warn!(
                stage = %self.stage,
                header = name,
                change = ?kind,
                "stage changed a restricted header; CloudFront would reject this function"
            );
            violations.push(HeaderViolation {
                stage: self.stage,
                header: name.to_string(),
                kind,
            });
        }
        violations
    }
}
