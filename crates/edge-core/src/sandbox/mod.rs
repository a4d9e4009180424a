//! Isolated JavaScript contexts for plugin modules.
//!
//! Each module gets its own QuickJS runtime and context: a fresh global
//! scope, its own heap limit, and nothing but the prelude's globals
//! (`console`, timers, `Buffer`, `URL`, `process.env`, a gated `require`).
//! Nothing a module writes to its globals is visible to any other module.
//!
//! The Rust side talks to the context only through the frozen
//! `__edgeRuntime` object the prelude leaves behind, and every value that
//! crosses the boundary is JSON text. A handler therefore always sees a deep
//! copy of the event, and its result is a snapshot taken at settlement.

pub mod bake;
mod host;
pub mod resolve;

use edge_common::{Error, Result};
use resolve::ModuleResolver;
use rquickjs::function::IntoArgs;
use rquickjs::{CatchResultExt, Context, Ctx, FromJs, Function, Object, Runtime};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{trace, warn};

pub use host::PLUGIN_LOG_TARGET;

const PRELUDE: &str = include_str!("prelude.js");
const RUNTIME_GLOBAL: &str = "__edgeRuntime";

/// Per-runtime resource limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SandboxLimits {
    pub memory_limit_bytes: usize,
    pub max_stack_bytes: usize,
}

impl SandboxLimits {
    pub fn from_settings(settings: &edge_config::SandboxSettings) -> Self {
        Self {
            memory_limit_bytes: settings.memory_limit_mb as usize * 1024 * 1024,
            max_stack_bytes: settings.max_stack_kb as usize * 1024,
        }
    }
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self::from_settings(&edge_config::SandboxSettings::default())
    }
}

/// What a module exported after evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportDescriptor {
    pub stage: Option<String>,
    pub has_handler: bool,
}

/// An error value a handler raised or rejected with.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ThrownError {
    pub name: String,
    pub message: String,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub stack: Option<String>,
}

impl ThrownError {
    pub fn is_permission_denied(&self) -> bool {
        self.name == "PermissionDenied"
    }
}

/// How one invocation ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Settlement {
    /// First signal was a value (`null` when the handler produced nothing).
    Value(serde_json::Value),
    /// First signal was an error.
    Error(ThrownError),
    /// No signal arrived and nothing was left that could produce one.
    Abandoned,
}

#[derive(Deserialize)]
#[serde(rename_all = "lowercase")]
enum RawOutcome<T> {
    Ok(T),
    Error(ThrownError),
}

/// One module's isolated runtime.
pub struct Sandbox {
    name: String,
    runtime: Runtime,
    context: Context,
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox").field("name", &self.name).finish()
    }
}

impl Sandbox {
    /// Create a context, install the prelude and evaluate `source` as a
    /// CommonJS module.
    ///
    /// `source` must already be baked. Anything the module throws while
    /// evaluating, including a denied `require` at top level, comes back as
    /// [`Error::ModuleLoad`]; engine failures are [`Error::Sandbox`].
    pub fn evaluate(
        path: &Path,
        source: &str,
        env_vars: &BTreeMap<String, String>,
        resolver: Arc<ModuleResolver>,
        limits: SandboxLimits,
    ) -> Result<(Self, ExportDescriptor)> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        let runtime = Runtime::new().map_err(engine_error)?;
        runtime.set_memory_limit(limits.memory_limit_bytes);
        runtime.set_max_stack_size(limits.max_stack_bytes);
        let context = Context::full(&runtime).map_err(engine_error)?;

        let env_json = serde_json::to_string(env_vars)?;
        let filename = path.to_string_lossy().into_owned();
        let dirname = path
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        let body = strip_shebang(source).to_string();

        let load_json = context
            .with(|ctx| {
                let installed = host::install(&ctx, &name, env_json, resolver)
                    .and_then(|()| ctx.eval::<(), _>(PRELUDE));
                installed
                    .and_then(|()| call_runtime::<_, String>(&ctx, "load", (body, filename, dirname)))
                    .catch(&ctx)
                    .map_err(|e| e.to_string())
            })
            .map_err(Error::Sandbox)?;

        let sandbox = Self {
            name,
            runtime,
            context,
        };
        sandbox.drain_jobs();
        match serde_json::from_str::<RawOutcome<ExportDescriptor>>(&load_json)? {
            RawOutcome::Ok(descriptor) => Ok((sandbox, descriptor)),
            RawOutcome::Error(thrown) => Err(Error::ModuleLoad {
                path: path.to_path_buf(),
                message: format!("{}: {}", thrown.name, thrown.message),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run the module's handler against a JSON event and drive it until the
    /// first settlement signal, or until nothing is left to run.
    ///
    /// Timers are honoured on real time: the loop sleeps until the next one is
    /// due. Timers still queued after settlement stay with this context and
    /// run on a later invocation.
    pub fn invoke(&self, event_json: &str, context_json: &str) -> Result<Settlement> {
        let id: u32 = self.call("invoke", (event_json, context_json))?;

        let outcome = loop {
            self.drain_jobs();
            if let Some(outcome) = self.call::<_, Option<String>>("poll", (id,))? {
                break Some(outcome);
            }
            match self.call::<_, Option<f64>>("nextTimerDelay", ())? {
                Some(delay) => {
                    if delay > 0.0 {
                        thread::sleep(Duration::from_millis(delay.ceil() as u64));
                    }
                    let fired: u32 = self.call("runDueTimers", ())?;
                    trace!(module = %self.name, fired, "ran timers");
                }
                None => break None,
            }
        };

        self.call::<_, ()>("release", (id,))?;

        match outcome {
            None => Ok(Settlement::Abandoned),
            Some(text) => Ok(match serde_json::from_str::<RawOutcome<serde_json::Value>>(&text)? {
                RawOutcome::Ok(value) => Settlement::Value(value),
                RawOutcome::Error(thrown) => Settlement::Error(thrown),
            }),
        }
    }

    fn call<A, R>(&self, method: &str, args: A) -> Result<R>
    where
        A: for<'js> IntoArgs<'js>,
        R: for<'js> FromJs<'js>,
    {
        self.context
            .with(|ctx| {
                call_runtime::<A, R>(&ctx, method, args)
                    .catch(&ctx)
                    .map_err(|e| e.to_string())
            })
            .map_err(|message| Error::Sandbox(format!("{}: {message}", self.name)))
    }

    fn drain_jobs(&self) {
        loop {
            match self.runtime.execute_pending_job() {
                Ok(true) => {}
                Ok(false) => break,
                Err(_) => warn!(module = %self.name, "pending job raised an uncaught exception"),
            }
        }
    }
}

fn call_runtime<'js, A, R>(ctx: &Ctx<'js>, method: &str, args: A) -> rquickjs::Result<R>
where
    A: IntoArgs<'js>,
    R: FromJs<'js>,
{
    let runtime: Object<'js> = ctx.globals().get(RUNTIME_GLOBAL)?;
    let function: Function<'js> = runtime.get(method)?;
    function.call(args)
}

fn engine_error(err: rquickjs::Error) -> Error {
    Error::Sandbox(err.to_string())
}

fn strip_shebang(source: &str) -> &str {
    if source.starts_with("#!") {
        source.find('\n').map_or("", |idx| &source[idx..])
    } else {
        source
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::{tempdir, TempDir};

    fn evaluate(source: &str) -> (TempDir, Result<(Sandbox, ExportDescriptor)>) {
        evaluate_with_env(source, BTreeMap::new())
    }

    fn evaluate_with_env(
        source: &str,
        env: BTreeMap<String, String>,
    ) -> (TempDir, Result<(Sandbox, ExportDescriptor)>) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plugin.js");
        std::fs::write(&path, source).unwrap();
        let resolver = Arc::new(ModuleResolver::new(dir.path(), Arc::new(BTreeMap::new())));
        let result = Sandbox::evaluate(&path, source, &env, resolver, SandboxLimits::default());
        (dir, result)
    }

    fn event() -> String {
        json!({"Records": [{"cf": {"request": {"uri": "/a"}}}]}).to_string()
    }

    fn context() -> String {
        json!({"functionName": "t", "remainingTimeMs": 1234}).to_string()
    }

    #[test]
    fn test_descriptor_reports_stage_and_handler() {
        let (_dir, result) = evaluate(
            "exports.stage = 'viewer-request'; exports.handler = async (e) => e.Records[0].cf.request;",
        );
        let (_sandbox, descriptor) = result.unwrap();
        assert_eq!(descriptor.stage.as_deref(), Some("viewer-request"));
        assert!(descriptor.has_handler);
    }

    #[test]
    fn test_module_exports_object_form() {
        let (_dir, result) = evaluate("module.exports = { stage: 'origin-response' };");
        let (_sandbox, descriptor) = result.unwrap();
        assert_eq!(descriptor.stage.as_deref(), Some("origin-response"));
        assert!(!descriptor.has_handler);
    }

    #[test]
    fn test_syntax_error_is_module_load_error() {
        let (_dir, result) = evaluate("exports.handler = (;");
        match result {
            Err(Error::ModuleLoad { message, .. }) => assert!(message.starts_with("SyntaxError")),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_top_level_forbidden_require_fails_load() {
        let (_dir, result) = evaluate("const fs = require('fs');");
        let err = result.unwrap_err().to_string();
        assert!(err.contains("PermissionDenied"), "{err}");
    }

    #[test]
    fn test_async_handler_value() {
        let (_dir, result) = evaluate(
            "exports.handler = async (event, context) => ({ uri: event.records[0].cf.request.uri, left: context.getRemainingTimeInMillis() });",
        );
        let (sandbox, _) = result.unwrap();
        let settled = sandbox.invoke(&event(), &context()).unwrap();
        assert_eq!(settled, Settlement::Value(json!({"uri": "/a", "left": 1234})));
    }

    #[test]
    fn test_callback_after_timer() {
        let (_dir, result) = evaluate(
            "exports.handler = (e, c, cb) => { setTimeout(() => cb(null, 'late'), 5); };",
        );
        let (sandbox, _) = result.unwrap();
        assert_eq!(
            sandbox.invoke(&event(), &context()).unwrap(),
            Settlement::Value(json!("late"))
        );
    }

    #[test]
    fn test_sync_object_return_settles() {
        let (_dir, result) = evaluate("exports.handler = (e) => ({ uri: e.Records[0].cf.request.uri });");
        let (sandbox, _) = result.unwrap();
        assert_eq!(
            sandbox.invoke(&event(), &context()).unwrap(),
            Settlement::Value(json!({"uri": "/a"}))
        );
    }

    #[test]
    fn test_primitive_return_leaves_callback_in_charge() {
        // A concise arrow hands back the timer id; the callback still decides.
        let (_dir, result) =
            evaluate("exports.handler = (e, c, cb) => setTimeout(() => cb(null, { n: 1 }), 5);");
        let (sandbox, _) = result.unwrap();
        assert_eq!(
            sandbox.invoke(&event(), &context()).unwrap(),
            Settlement::Value(json!({"n": 1}))
        );

        let (_dir, result) = evaluate("exports.handler = () => 42;");
        let (sandbox, _) = result.unwrap();
        assert_eq!(
            sandbox.invoke(&event(), &context()).unwrap(),
            Settlement::Abandoned
        );
    }

    #[test]
    fn test_first_signal_wins_and_value_is_snapshotted() {
        let (_dir, result) = evaluate(
            r#"exports.handler = (e, c, cb) => {
                const out = { n: 1 };
                cb(null, out);
                out.n = 2;
                cb(new Error('ignored'));
                return Promise.resolve({ n: 3 });
            };"#,
        );
        let (sandbox, _) = result.unwrap();
        assert_eq!(
            sandbox.invoke(&event(), &context()).unwrap(),
            Settlement::Value(json!({"n": 1}))
        );
    }

    #[test]
    fn test_thrown_error_is_reported() {
        let (_dir, result) = evaluate("exports.handler = () => { throw new RangeError('boom'); };");
        let (sandbox, _) = result.unwrap();
        match sandbox.invoke(&event(), &context()).unwrap() {
            Settlement::Error(thrown) => {
                assert_eq!(thrown.name, "RangeError");
                assert_eq!(thrown.message, "boom");
            }
            other => panic!("unexpected settlement: {other:?}"),
        }
    }

    #[test]
    fn test_require_fs_inside_handler_is_permission_denied() {
        let (_dir, result) = evaluate("exports.handler = async () => require('node:fs');");
        let (sandbox, _) = result.unwrap();
        match sandbox.invoke(&event(), &context()).unwrap() {
            Settlement::Error(thrown) => assert!(thrown.is_permission_denied()),
            other => panic!("unexpected settlement: {other:?}"),
        }
    }

    #[test]
    fn test_never_settling_handler_is_abandoned() {
        let (_dir, result) = evaluate("exports.handler = (e, c, cb) => {};");
        let (sandbox, _) = result.unwrap();
        assert_eq!(
            sandbox.invoke(&event(), &context()).unwrap(),
            Settlement::Abandoned
        );
    }

    #[test]
    fn test_process_env_is_frozen_allow_list() {
        let env = BTreeMap::from([("REGION".to_string(), "eu-west-1".to_string())]);
        let (_dir, result) = evaluate_with_env(
            "exports.handler = async () => { process.env.EXTRA = 'x'; return [process.env.REGION, process.env.EXTRA === undefined]; };",
            env,
        );
        let (sandbox, _) = result.unwrap();
        assert_eq!(
            sandbox.invoke(&event(), &context()).unwrap(),
            Settlement::Value(json!(["eu-west-1", true]))
        );
    }

    #[test]
    fn test_host_object_is_not_reachable() {
        let (_dir, result) = evaluate(
            "exports.handler = async () => [typeof __edge_host, typeof require, typeof Buffer, typeof URLSearchParams];",
        );
        let (sandbox, _) = result.unwrap();
        assert_eq!(
            sandbox.invoke(&event(), &context()).unwrap(),
            Settlement::Value(json!(["undefined", "function", "function", "function"]))
        );
    }

    #[test]
    fn test_builtin_shims() {
        let (_dir, result) = evaluate(
            r#"const qs = require('querystring');
               const { createHash } = require('crypto');
               exports.handler = async () => [
                   qs.stringify({ b: '2', a: ['x', 'y z'] }),
                   new URLSearchParams('z=1&a=2').get('a'),
                   Buffer.from('hello').toString('base64'),
                   createHash('sha256').update('').digest('hex').slice(0, 8),
               ];"#,
        );
        let (sandbox, _) = result.unwrap();
        assert_eq!(
            sandbox.invoke(&event(), &context()).unwrap(),
            Settlement::Value(json!(["b=2&a=x&a=y%20z", "2", "aGVsbG8=", "e3b0c442"]))
        );
    }

    #[test]
    fn test_strip_shebang() {
        assert_eq!(strip_shebang("#!/usr/bin/env node\nx"), "\nx");
        assert_eq!(strip_shebang("x"), "x");
    }
}
