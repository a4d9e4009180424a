//! Schema versioning for JSON outputs.

/// Current schema version of machine-readable output (load reports).
///
/// Follows semver: a MAJOR bump removes or retypes fields, a MINOR bump only
/// adds optional ones.
pub const SCHEMA_VERSION: &str = "1.0.0";
