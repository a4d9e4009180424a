//! Lifecycle stages at which a plugin may intercept traffic.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One of the four fixed lifecycle points.
///
/// The string forms match the CloudFront `eventType` values that plugins
/// export as their `stage`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    /// Before the cache lookup, on every viewer request.
    ViewerRequest,
    /// On a cache miss, before the request is forwarded to the origin.
    OriginRequest,
    /// After the origin answered, before the response is cached.
    OriginResponse,
    /// Before the response is returned to the viewer.
    ViewerResponse,
}

/// Request-side stages in execution order.
pub const REQUEST_STAGES: [Stage; 2] = [Stage::ViewerRequest, Stage::OriginRequest];

/// Response-side stages in execution order.
pub const RESPONSE_STAGES: [Stage; 2] = [Stage::OriginResponse, Stage::ViewerResponse];

impl Stage {
    /// All stages, request side first.
    pub const ALL: [Stage; 4] = [
        Stage::ViewerRequest,
        Stage::OriginRequest,
        Stage::OriginResponse,
        Stage::ViewerResponse,
    ];

    /// The kebab-case name used in plugin exports and event envelopes.
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::ViewerRequest => "viewer-request",
            Stage::OriginRequest => "origin-request",
            Stage::OriginResponse => "origin-response",
            Stage::ViewerResponse => "viewer-response",
        }
    }

    /// Whether the stage sees only the request (no response record).
    pub fn is_request_side(self) -> bool {
        matches!(self, Stage::ViewerRequest | Stage::OriginRequest)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a stage name is not one of the four known values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStage(pub String);

impl fmt::Display for UnknownStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown lifecycle stage '{}'", self.0)
    }
}

impl std::error::Error for UnknownStage {}

impl FromStr for Stage {
    type Err = UnknownStage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| UnknownStage(s.to_string()))
    }
}
