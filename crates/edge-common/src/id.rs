//! Request identity types.
//!
//! Every stage invocation receives a fabricated request id in
//! `event.Records[0].cf.config.requestId` and `context.awsRequestId`.

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::fmt;

/// CloudFront-style request id.
///
/// Format: URL-safe base64 of 30 random bytes plus a 2-byte time suffix,
/// which gives the same 44-character shape as ids seen on the platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub String);

impl RequestId {
    /// Generate a new request id.
    pub fn new() -> Self {
        let mut bytes = Vec::with_capacity(32);
        bytes.extend_from_slice(uuid::Uuid::new_v4().as_bytes());
        bytes.extend_from_slice(&uuid::Uuid::new_v4().as_bytes()[..14]);
        let millis = chrono::Utc::now().timestamp_subsec_millis() as u16;
        bytes.extend_from_slice(&millis.to_be_bytes());
        RequestId(URL_SAFE.encode(bytes))
    }

    /// Parse an existing request id string.
    pub fn parse(s: &str) -> Option<Self> {
        if !s.is_empty()
            && s
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '='))
        {
            Some(RequestId(s.to_string()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
