//! End-to-end pipeline tests: real plugin files, real sandboxes.
//!
//! Validates:
//! - Query string rewriting across viewer-request and origin-request
//! - Short-circuit responses stop the request side
//! - Duplicate stage bindings and restricted env names stop startup
//! - Global scope isolation between modules
//! - Settled results are frozen against later mutation
//! - Return, callback and thenable signals, and their failure forms
//! - Denied `require` fails open
//! - Bake substitution is literal
//! - Response-side threading and the header policy

use edge_common::{Error, HeaderMap, RequestRecord, ResponseRecord, Stage};
use edge_core::invoke::InvokeSettings;
use edge_core::policy::ViolationKind;
use edge_core::{EdgeRunner, RegistrySettings, RequestOutcome, RequestResolution};
use std::fs;
use std::path::PathBuf;
use tempfile::{tempdir, TempDir};

// ============================================================================
// Helpers
// ============================================================================

const STRIP_UTM: &str = r#"
const querystring = require('querystring');

exports.stage = 'viewer-request';
exports.handler = (event, context, callback) => {
    const request = event.Records[0].cf.request;
    const params = querystring.parse(request.querystring);
    for (const key of Object.keys(params)) {
        if (key.startsWith('utm_')) delete params[key];
    }
    request.querystring = querystring.stringify(params);
    callback(null, request);
};
"#;

const NORMALIZE_QUERY: &str = r#"
exports.stage = 'origin-request';
exports.handler = async (event) => {
    const request = event.Records[0].cf.request;
    const params = new URLSearchParams(request.querystring.toLowerCase());
    params.sort();
    request.querystring = params.toString();
    return request;
};
"#;

struct Fixture {
    dir: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("plugins")).unwrap();
        Self { dir }
    }

    fn plugins(&self) -> PathBuf {
        self.dir.path().join("plugins")
    }

    fn plugin(&self, name: &str, source: &str) -> &Self {
        fs::write(self.plugins().join(name), source).unwrap();
        self
    }

    fn file(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    fn settings(&self) -> RegistrySettings {
        RegistrySettings::new(self.plugins())
    }

    fn runner(&self) -> EdgeRunner {
        EdgeRunner::with_settings(self.settings(), InvokeSettings::default()).unwrap()
    }
}

fn get(target: &str) -> RequestRecord {
    RequestRecord::from_target("GET", target)
        .with_headers(HeaderMap::from_pairs([("Host", "example.com")]))
}

fn forwarded_path(runner: &EdgeRunner, target: &str) -> String {
    runner
        .handle_request(get(target))
        .forwarded_path()
        .expect("request was short-circuited")
}

fn header<'a>(request: &'a RequestRecord, name: &str) -> Option<&'a str> {
    request.headers.get(name)
}

fn forwarded_request(runner: &EdgeRunner, target: &str) -> RequestRecord {
    match runner.handle_request(get(target)).resolution {
        RequestResolution::Forward { request, .. } => request,
        other => panic!("expected forward, got {other:?}"),
    }
}

// ============================================================================
// Request side
// ============================================================================

#[test]
fn test_utm_parameters_are_stripped() {
    let fixture = Fixture::new();
    fixture.plugin("strip-utm.js", STRIP_UTM);
    let runner = fixture.runner();

    assert_eq!(
        forwarded_path(&runner, "/page?utm_source=twitter&other=keep"),
        "/page?other=keep"
    );
    assert_eq!(forwarded_path(&runner, "/page?utm_medium=x"), "/page");
}

#[test]
fn test_query_is_normalized_after_viewer_stage() {
    let fixture = Fixture::new();
    fixture
        .plugin("strip-utm.js", STRIP_UTM)
        .plugin("normalize.js", NORMALIZE_QUERY);
    let runner = fixture.runner();

    let run = runner.handle_request(get("/index.html?Z=Last&A=First&m=Middle"));
    assert_eq!(run.stages_run, vec![Stage::ViewerRequest, Stage::OriginRequest]);
    assert_eq!(
        run.forwarded_path().as_deref(),
        Some("/index.html?a=first&m=middle&z=last")
    );
}

#[test]
fn test_short_circuit_skips_origin_request() {
    let fixture = Fixture::new();
    fixture
        .plugin(
            "deny.js",
            r#"
            exports.stage = 'viewer-request';
            exports.handler = async () => ({
                status: '403',
                statusDescription: 'Forbidden',
                headers: { 'content-type': [{ key: 'Content-Type', value: 'text/plain' }] },
                body: 'denied',
            });
            "#,
        )
        .plugin("normalize.js", NORMALIZE_QUERY);
    let runner = fixture.runner();

    let run = runner.handle_request(get("/secret?B=1"));
    assert_eq!(run.stages_run, vec![Stage::ViewerRequest]);
    assert!(run.is_short_circuit());

    match RequestOutcome::from(run) {
        RequestOutcome::ShortCircuit {
            status,
            status_description,
            headers,
            body,
            ..
        } => {
            assert_eq!(status, 403);
            assert_eq!(status_description, "Forbidden");
            assert_eq!(headers.get("content-type"), Some("text/plain"));
            assert_eq!(body.as_deref(), Some("denied"));
        }
        other => panic!("expected short-circuit, got {other:?}"),
    }
}

#[test]
fn test_no_plugins_forwards_unchanged() {
    let fixture = Fixture::new();
    let runner = fixture.runner();
    let run = runner.handle_request(get("/a?b=c"));
    assert!(run.stages_run.is_empty());
    assert_eq!(run.forwarded_path().as_deref(), Some("/a?b=c"));
}

// ============================================================================
// Startup failures
// ============================================================================

#[test]
fn test_duplicate_stage_prevents_start() {
    let fixture = Fixture::new();
    fixture
        .plugin("a.js", NORMALIZE_QUERY)
        .plugin("b.js", NORMALIZE_QUERY);
    let err = EdgeRunner::with_settings(fixture.settings(), InvokeSettings::default()).unwrap_err();
    match err {
        Error::DuplicateStageBinding { stage, .. } => assert_eq!(stage, Stage::OriginRequest),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_restricted_env_name_prevents_start() {
    let fixture = Fixture::new();
    fixture.plugin("strip-utm.js", STRIP_UTM);
    let env = fixture.file("runtime.env", "REGION=eu-west-1\nDATABASE_URL=postgres://db\n");
    let mut settings = fixture.settings();
    settings.env_file = Some(env);

    let err = EdgeRunner::with_settings(settings, InvokeSettings::default()).unwrap_err();
    assert!(matches!(err, Error::RestrictedVariable { ref key, .. } if key == "DATABASE_URL"));
    assert!(err.is_fatal());
}

// ============================================================================
// Isolation and settlement
// ============================================================================

#[test]
fn test_globals_do_not_leak_between_modules() {
    let fixture = Fixture::new();
    fixture
        .plugin(
            "a-writer.js",
            r#"
            globalThis.shared = 'from-a';
            leaked = 42;
            exports.stage = 'viewer-request';
            exports.handler = async (event) => event.Records[0].cf.request;
            "#,
        )
        .plugin(
            "b-reader.js",
            r#"
            exports.stage = 'origin-request';
            exports.handler = async (event) => {
                const request = event.Records[0].cf.request;
                request.headers['x-seen'] = [{ key: 'X-Seen', value: typeof shared + '/' + typeof leaked }];
                return request;
            };
            "#,
        );
    let runner = fixture.runner();
    let request = forwarded_request(&runner, "/");
    assert_eq!(header(&request, "x-seen"), Some("undefined/undefined"));
}

#[test]
fn test_mutation_after_settlement_is_invisible() {
    let fixture = Fixture::new();
    fixture.plugin(
        "late.js",
        r#"
        exports.stage = 'viewer-request';
        exports.handler = (event, context, callback) => {
            const request = event.Records[0].cf.request;
            request.uri = '/settled';
            callback(null, request);
            setTimeout(() => { request.uri = '/mutated'; }, 5);
            request.querystring = 'after=1';
        };
        "#,
    );
    let runner = fixture.runner();
    assert_eq!(forwarded_path(&runner, "/start"), "/settled");
    // The queued timer from the first call must not bleed into the next one either.
    assert_eq!(forwarded_path(&runner, "/start"), "/settled");
}

#[test]
fn test_promise_resolved_before_timer_wins() {
    let fixture = Fixture::new();
    fixture.plugin(
        "promise.js",
        r#"
        exports.stage = 'viewer-request';
        exports.handler = (event) => new Promise((resolve) => {
            const request = event.Records[0].cf.request;
            setTimeout(() => {
                request.uri = '/from-timer';
                resolve(request);
                setTimeout(() => { request.uri = '/too-late'; }, 20);
            }, 10);
        });
        "#,
    );
    let runner = fixture.runner();
    assert_eq!(forwarded_path(&runner, "/"), "/from-timer");
}

#[test]
fn test_require_fs_fails_open() {
    let fixture = Fixture::new();
    fixture
        .plugin(
            "greedy.js",
            r#"
            exports.stage = 'viewer-request';
            exports.handler = async (event) => {
                const fs = require('fs');
                const request = event.Records[0].cf.request;
                request.uri = '/' + fs.readFileSync('/etc/passwd', 'utf8');
                return request;
            };
            "#,
        )
        .plugin("normalize.js", NORMALIZE_QUERY);
    let runner = fixture.runner();

    let run = runner.handle_request(get("/page?B=2&A=1"));
    assert_eq!(run.stages_run, vec![Stage::ViewerRequest, Stage::OriginRequest]);
    assert_eq!(run.forwarded_path().as_deref(), Some("/page?a=1&b=2"));

    // Still serving afterwards.
    assert_eq!(forwarded_path(&runner, "/x"), "/x");
}

#[test]
fn test_throwing_handler_fails_open() {
    let fixture = Fixture::new();
    fixture.plugin(
        "throws.js",
        "exports.stage = 'viewer-request'; exports.handler = () => { throw new Error('nope'); };",
    );
    let runner = fixture.runner();
    assert_eq!(forwarded_path(&runner, "/keep?x=1"), "/keep?x=1");
}

#[test]
fn test_sync_return_ignores_timer_mutation() {
    let fixture = Fixture::new();
    fixture.plugin(
        "sync.js",
        r#"
        exports.stage = 'viewer-request';
        exports.handler = (event) => {
            const request = event.Records[0].cf.request;
            setTimeout(() => { request.method = 'X'; }, 5);
            request.uri = '/sync';
            return request;
        };
        "#,
    );
    let runner = fixture.runner();
    let request = forwarded_request(&runner, "/start");
    assert_eq!(request.method, "GET");
    assert_eq!(request.uri, "/sync");
    // The leftover timer runs later but never reaches the next result either.
    assert_eq!(forwarded_request(&runner, "/start").method, "GET");
}

#[test]
fn test_concise_arrow_callback_handler_is_not_cut_short() {
    let fixture = Fixture::new();
    fixture.plugin(
        "arrow.js",
        r#"
        exports.stage = 'viewer-request';
        exports.handler = (event, context, cb) => setTimeout(() => {
            const request = event.Records[0].cf.request;
            request.uri = '/rewritten';
            cb(null, request);
        }, 5);
        "#,
    );
    let runner = fixture.runner();
    assert_eq!(forwarded_path(&runner, "/a"), "/rewritten");
}

#[test]
fn test_rejections_and_callback_errors_fail_open() {
    let handlers = [
        "async () => { throw new Error('async nope'); }",
        "() => Promise.reject(new Error('rejected'))",
        "(e, c, cb) => { cb(new Error('callback nope')); }",
        "(e, c, cb) => { setTimeout(() => cb(new Error('late nope')), 5); }",
        "() => { throw 'a bare string'; }",
    ];
    for handler in handlers {
        let fixture = Fixture::new();
        fixture
            .plugin(
                "fails.js",
                &format!("exports.stage = 'viewer-request'; exports.handler = {handler};"),
            )
            .plugin("normalize.js", NORMALIZE_QUERY);
        let runner = fixture.runner();

        let run = runner.handle_request(get("/keep?X=1"));
        assert_eq!(
            run.stages_run,
            vec![Stage::ViewerRequest, Stage::OriginRequest],
            "handler: {handler}"
        );
        assert_eq!(run.forwarded_path().as_deref(), Some("/keep?x=1"), "handler: {handler}");
    }
}

// ============================================================================
// Variables
// ============================================================================

#[test]
fn test_bake_values_are_literal() {
    let fixture = Fixture::new();
    fixture.plugin(
        "keys.js",
        r#"
        exports.stage = 'viewer-request';
        exports.handler = async (event) => {
            const request = event.Records[0].cf.request;
            request.headers['x-api-key'] = [{ key: 'X-Api-Key', value: '__API_KEY__' }];
            request.headers['x-pattern'] = [{ key: 'X-Pattern', value: '__PATTERN__' }];
            request.headers['x-missing'] = [{ key: 'X-Missing', value: '__NOT_BAKED__' }];
            return request;
        };
        "#,
    );
    let bake = fixture.file("bake.env", "API_KEY=secret-999\nPATTERN=$1$&$$\n");
    let mut settings = fixture.settings();
    settings.bake_file = Some(bake);
    settings.bake_output = Some(fixture.dir.path().join("dist"));
    let runner = EdgeRunner::with_settings(settings, InvokeSettings::default()).unwrap();

    let request = forwarded_request(&runner, "/");
    assert_eq!(header(&request, "x-api-key"), Some("secret-999"));
    assert_eq!(header(&request, "x-pattern"), Some("$1$&$$"));
    assert_eq!(header(&request, "x-missing"), Some("__NOT_BAKED__"));

    let baked = fs::read_to_string(fixture.dir.path().join("dist/keys.js")).unwrap();
    assert!(baked.contains("'secret-999'"));
}

#[test]
fn test_env_file_feeds_process_env_and_context() {
    let fixture = Fixture::new();
    fixture.plugin(
        "env.js",
        r#"
        exports.stage = 'viewer-request';
        exports.handler = async (event, context) => {
            const request = event.Records[0].cf.request;
            request.headers['x-region'] = [{ key: 'X-Region', value: process.env.REGION }];
            request.headers['x-function'] = [{ key: 'X-Function', value: context.functionName }];
            request.headers['x-remaining'] = [{ key: 'X-Remaining', value: String(context.getRemainingTimeInMillis()) }];
            return request;
        };
        "#,
    );
    let env = fixture.file("runtime.env", "REGION=eu-west-1\nFUNCTION_NAME=site-edge\n");
    let mut settings = fixture.settings();
    settings.env_file = Some(env);
    let runner = EdgeRunner::with_settings(settings, InvokeSettings::default()).unwrap();

    let request = forwarded_request(&runner, "/");
    assert_eq!(header(&request, "x-region"), Some("eu-west-1"));
    assert_eq!(header(&request, "x-function"), Some("site-edge"));
    assert_eq!(header(&request, "x-remaining"), Some("5000"));
}

#[test]
fn test_local_require_is_confined_to_plugin_root() {
    let fixture = Fixture::new();
    fixture.file("outside.js", "module.exports = 'outside';");
    fs::create_dir(fixture.plugins().join("lib")).unwrap();
    fs::write(
        fixture.plugins().join("lib/paths.js"),
        "module.exports = { home: '/index.html' };",
    )
    .unwrap();
    fixture.plugin(
        "rewrite.js",
        r#"
        const { home } = require('./lib/paths');
        exports.stage = 'viewer-request';
        exports.handler = async (event) => {
            const request = event.Records[0].cf.request;
            let escaped;
            try { require('../outside'); escaped = 'yes'; } catch (err) { escaped = err.name; }
            request.uri = home;
            request.headers['x-escape'] = [{ key: 'X-Escape', value: escaped }];
            return request;
        };
        "#,
    );
    let runner = fixture.runner();
    let request = forwarded_request(&runner, "/");
    assert_eq!(request.uri, "/index.html");
    assert_eq!(header(&request, "x-escape"), Some("PermissionDenied"));
}

// ============================================================================
// Response side
// ============================================================================

#[test]
fn test_response_stages_thread_the_record() {
    let fixture = Fixture::new();
    fixture
        .plugin(
            "origin-response.js",
            r#"
            exports.stage = 'origin-response';
            exports.handler = (event, context, callback) => {
                const response = event.Records[0].cf.response;
                response.headers['cache-control'] = [{ key: 'Cache-Control', value: 'max-age=60' }];
                callback(null, response);
            };
            "#,
        )
        .plugin(
            "viewer-response.js",
            r#"
            exports.stage = 'viewer-response';
            exports.handler = async (event) => {
                const response = event.Records[0].cf.response;
                const cc = response.headers['cache-control'][0].value;
                response.headers['x-frame-options'] = [{ key: 'X-Frame-Options', value: 'DENY' }];
                response.headers['x-seen-cache'] = [{ key: 'X-Seen-Cache', value: cc }];
                response.headers['via'] = [{ key: 'Via', value: '1.1 plugin' }];
                return response;
            };
            "#,
        );
    let runner = fixture.runner();

    let request = get("/");
    let origin = ResponseRecord::new(
        200,
        HeaderMap::from_pairs([("Content-Type", "text/html"), ("Via", "1.1 origin")]),
    );
    let run = runner.handle_response(&request, origin);
    assert_eq!(run.stages_run, vec![Stage::OriginResponse, Stage::ViewerResponse]);
    assert_eq!(run.violations.len(), 1);
    assert_eq!(run.violations[0].header, "via");
    assert_eq!(run.violations[0].kind, ViolationKind::Modified);
    assert_eq!(run.violations[0].stage, Stage::ViewerResponse);

    let outcome = runner.response_outcome(&request, ResponseRecord::new(200, HeaderMap::new()));
    assert_eq!(outcome.status, 200);
    assert_eq!(outcome.headers["Cache-Control"], "max-age=60");
    assert_eq!(outcome.headers["X-Frame-Options"], "DENY");
    assert_eq!(outcome.headers["X-Seen-Cache"], "max-age=60");
}

#[test]
fn test_invalid_response_result_keeps_previous_record() {
    let fixture = Fixture::new();
    fixture.plugin(
        "broken.js",
        "exports.stage = 'viewer-response'; exports.handler = async () => ({ headers: 'nope' });",
    );
    let runner = fixture.runner();
    let origin = ResponseRecord::new(404, HeaderMap::from_pairs([("X-Origin", "1")]));
    let run = runner.handle_response(&get("/"), origin.clone());
    assert_eq!(run.response, origin);
}
