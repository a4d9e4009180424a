//! Edge Runner core.
//!
//! Runs CloudFront-style edge function plugins locally:
//! - [`sandbox`]: one isolated QuickJS context per plugin module, with baking
//!   and a gated `require`
//! - [`registry`] and [`watch`]: module discovery, stage binding, hot reload
//! - [`invoke`]: callback / return / promise handlers normalized to one result
//! - [`pipeline`]: ordered request and response stages with short-circuiting
//! - [`policy`]: restricted-header diffing
//! - [`runner`]: the facade a serving layer holds, plus the [`boundary`] types
//!   it exchanges with that layer

pub mod boundary;
pub mod exit_codes;
pub mod invoke;
pub mod logging;
pub mod pipeline;
pub mod policy;
pub mod registry;
pub mod runner;
pub mod sandbox;
pub mod watch;

pub use boundary::{DirectoryProbe, PathProbe, RequestOutcome, ResponseOutcome};
pub use invoke::{InvocationResult, InvokeSettings, Invoker};
pub use pipeline::{Pipeline, RequestResolution, RequestRun, ResponseRun};
pub use policy::{HeaderViolation, ViolationKind};
pub use registry::{LoadReport, ModuleRegistry, PluginModule, RegistrySettings, StageMap};
pub use runner::EdgeRunner;
