//! Edge Runner common types, IDs, and errors.
//!
//! This crate provides foundational types shared across edge-core modules:
//! - Lifecycle stages and their fixed execution order
//! - CloudFront-shaped request/response records with a case-preserving header map
//! - Request identity types
//! - The unified error taxonomy

pub mod error;
pub mod id;
pub mod record;
pub mod schema;
pub mod stage;

pub use error::{Error, Result};
pub use id::RequestId;
pub use record::{BodyEncoding, HeaderEntry, HeaderMap, RequestRecord, ResponseRecord};
pub use schema::SCHEMA_VERSION;
pub use stage::{Stage, REQUEST_STAGES, RESPONSE_STAGES};
