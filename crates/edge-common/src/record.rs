//! CloudFront-shaped lifecycle records.
//!
//! These are the `request` and `response` sub-records carried in
//! `event.Records[0].cf`. Serialization follows the CloudFront JSON shape so
//! plugins written against the real platform see the fields they expect.

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single header value with the casing it should be re-emitted with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeaderEntry {
    /// Original header casing, e.g. `Content-Type`.
    #[serde(rename = "key")]
    pub display_name: String,
    pub value: String,
}

impl HeaderEntry {
    pub fn new(display_name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            value: value.into(),
        }
    }
}

/// Header multimap keyed by lowercase name.
///
/// Each name maps to an ordered list of `{key, value}` entries. Lookups are
/// case-insensitive; the display name of each entry is preserved for
/// re-emission. Equality compares names and value lists, which is what the
/// header policy diff relies on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap(BTreeMap<String, Vec<HeaderEntry>>);

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `(name, value)` pairs, keeping repeated names as multiple entries.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut map = Self::new();
        for (name, value) in pairs {
            map.append(name, value);
        }
        map
    }

    /// Append a value, keeping any existing entries for the name.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.0
            .entry(name.to_ascii_lowercase())
            .or_default()
            .push(HeaderEntry::new(name, value));
    }

    /// Replace every entry for the name with a single value.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.0.insert(
            name.to_ascii_lowercase(),
            vec![HeaderEntry::new(name, value)],
        );
    }

    pub fn remove(&mut self, name: &str) -> Option<Vec<HeaderEntry>> {
        self.0.remove(&name.to_ascii_lowercase())
    }

    /// First value for the name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.get_all(name)
            .and_then(|entries| entries.first())
            .map(|entry| entry.value.as_str())
    }

    pub fn get_all(&self, name: &str) -> Option<&[HeaderEntry]> {
        self.0
            .get(&name.to_ascii_lowercase())
            .map(|entries| entries.as_slice())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(&name.to_ascii_lowercase())
    }

    /// Values only, in order, for diffing and display.
    pub fn values(&self, name: &str) -> Option<Vec<&str>> {
        self.get_all(name)
            .map(|entries| entries.iter().map(|e| e.value.as_str()).collect())
    }

    /// Iterate `(lowercase name, entries)` pairs in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[HeaderEntry])> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Collapse into a flat `display name -> value` map.
    ///
    /// The display name comes from the first entry; multiple values are
    /// joined with `", "`. Names whose entry list is empty are dropped.
    pub fn flatten(&self) -> BTreeMap<String, String> {
        self.0
            .iter()
            .filter_map(|(name, entries)| {
                let first = entries.first()?;
                let display = if first.display_name.is_empty() {
                    name.clone()
                } else {
                    first.display_name.clone()
                };
                let joined = entries
                    .iter()
                    .map(|e| e.value.as_str())
                    .collect::<Vec<_>>()
                    .join(", ");
                Some((display, joined))
            })
            .collect()
    }
}

impl Serialize for HeaderMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

#[derive(Deserialize)]
struct RawHeaderEntry {
    #[serde(default)]
    key: Option<String>,
    value: serde_json::Value,
}

impl<'de> Deserialize<'de> for HeaderMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw: BTreeMap<String, Vec<RawHeaderEntry>> = BTreeMap::deserialize(deserializer)?;
        let mut map: BTreeMap<String, Vec<HeaderEntry>> = BTreeMap::new();
        for (name, entries) in raw {
            let slot = map.entry(name.to_ascii_lowercase()).or_default();
            for entry in entries {
                let value = match entry.value {
                    serde_json::Value::String(s) => s,
                    serde_json::Value::Number(n) => n.to_string(),
                    serde_json::Value::Bool(b) => b.to_string(),
                    other => {
                        return Err(de::Error::custom(format!(
                            "header '{}' has a non-scalar value: {}",
                            name, other
                        )))
                    }
                };
                let display_name = entry.key.unwrap_or_else(|| name.clone());
                slot.push(HeaderEntry {
                    display_name,
                    value,
                });
            }
        }
        Ok(HeaderMap(map))
    }
}

/// The `request` sub-record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRecord {
    #[serde(default)]
    pub client_ip: String,
    #[serde(default = "default_method")]
    pub method: String,
    /// Path only, always starting with `/`.
    pub uri: String,
    /// Query string without the leading `?`.
    #[serde(default)]
    pub querystring: String,
    #[serde(default)]
    pub headers: HeaderMap,
    /// Fields plugins set that the runner passes through untouched (e.g. `origin`).
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_method() -> String {
    "GET".to_string()
}

impl RequestRecord {
    /// Build a record from a request target such as `/page?a=1`.
    pub fn from_target(method: impl Into<String>, target: &str) -> Self {
        let (uri, querystring) = match target.split_once('?') {
            Some((path, query)) => (path, query),
            None => (target, ""),
        };
        let uri = if uri.is_empty() { "/" } else { uri };
        Self {
            client_ip: String::new(),
            method: method.into(),
            uri: uri.to_string(),
            querystring: querystring.to_string(),
            headers: HeaderMap::new(),
            extra: serde_json::Map::new(),
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_client_ip(mut self, ip: impl Into<String>) -> Self {
        self.client_ip = ip.into();
        self
    }

    /// Path and query re-joined into a single addressable string.
    pub fn addressable_path(&self) -> String {
        if self.querystring.is_empty() {
            self.uri.clone()
        } else {
            format!("{}?{}", self.uri, self.querystring)
        }
    }
}

/// Encoding of a generated response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyEncoding {
    Text,
    Base64,
}

/// The `response` sub-record, also used for generated (short-circuit) responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseRecord {
    #[serde(with = "status_code")]
    pub status: u16,
    #[serde(default)]
    pub status_description: String,
    #[serde(default)]
    pub headers: HeaderMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_encoding: Option<BodyEncoding>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ResponseRecord {
    pub fn new(status: u16, headers: HeaderMap) -> Self {
        Self {
            status,
            status_description: reason_phrase(status).to_string(),
            headers,
            body: None,
            body_encoding: None,
            extra: serde_json::Map::new(),
        }
    }

    /// Fill an empty `statusDescription` with the standard reason phrase.
    pub fn with_reason_phrase(mut self) -> Self {
        if self.status_description.trim().is_empty() {
            self.status_description = reason_phrase(self.status).to_string();
        }
        self
    }
}

/// CloudFront sends status as a string (`"200"`); plugins return either form.
mod status_code {
    use super::*;

    pub fn serialize<S: Serializer>(status: &u16, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&status.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u16, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        let code = match &value {
            serde_json::Value::String(s) => s.trim().parse::<u16>().ok(),
            serde_json::Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
            _ => None,
        };
        match code {
            Some(code) if (100..=599).contains(&code) => Ok(code),
            _ => Err(de::Error::custom(format!("invalid status code: {}", value))),
        }
    }
}

/// Canonical reason phrase for common status codes.
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "",
    }
}
