//! Invocation adapter: one handler call, normalized.
//!
//! Builds the CloudFront-shaped event and Lambda-style context, runs the
//! module's handler in its sandbox and turns whatever it signalled into an
//! [`InvocationResult`]. Every failure fails open: the error is logged and the
//! stage becomes a no-op ([`InvocationResult::Passthrough`]).

use crate::registry::PluginModule;
use crate::sandbox::Settlement;
use edge_common::{Error, RequestId, RequestRecord, ResponseRecord, Stage};
use edge_config::{RunnerConfig, VariableStore};
use serde_json::{json, Value};
use std::time::Instant;
use tracing::{debug, error, warn};

/// Region reported when the env file does not set `REGION`.
const DEFAULT_REGION: &str = "us-east-1";
const ACCOUNT_ID: &str = "123456789012";

/// What a stage produced.
#[derive(Debug, Clone, PartialEq)]
pub enum InvocationResult {
    /// Continue with this request.
    Request(RequestRecord),
    /// Answer immediately; later request stages do not run.
    ShortCircuit(ResponseRecord),
    /// Continue with this response.
    Response(ResponseRecord),
    /// Keep the previous record.
    Passthrough,
}

/// Static values surfaced to handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvokeSettings {
    pub function_name: Option<String>,
    pub function_version: String,
    pub memory_limit_mb: u32,
    pub remaining_time_ms: u64,
    pub distribution_domain: String,
    pub distribution_id: String,
}

impl InvokeSettings {
    pub fn from_config(config: &RunnerConfig) -> Self {
        Self {
            function_name: config.function.name.clone(),
            function_version: config.function.version.clone(),
            memory_limit_mb: config.function.memory_limit_mb,
            remaining_time_ms: config.function.remaining_time_ms,
            distribution_domain: config.distribution.domain_name.clone(),
            distribution_id: config.distribution.id.clone(),
        }
    }
}

impl Default for InvokeSettings {
    fn default() -> Self {
        Self::from_config(&RunnerConfig::default())
    }
}

#[derive(Debug, Clone, Default)]
pub struct Invoker {
    settings: InvokeSettings,
}

impl Invoker {
    pub fn new(settings: InvokeSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &InvokeSettings {
        &self.settings
    }

    /// Run `module` for `stage`. Never fails; see the module docs.
    pub fn invoke(
        &self,
        module: &PluginModule,
        stage: Stage,
        request: &RequestRecord,
        response: Option<&ResponseRecord>,
        variables: &VariableStore,
    ) -> InvocationResult {
        let request_id = RequestId::new();
        let event = self.build_event(stage, &request_id, request, response);
        let context = self.build_context(module, &request_id, variables);

        let started = Instant::now();
        let settled = module.run(&event.to_string(), &context.to_string());
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let outcome = match settled {
            Ok(Settlement::Value(value)) => interpret(stage, value, module),
            Ok(Settlement::Error(thrown)) => {
                let err = if thrown.is_permission_denied() {
                    Error::PermissionDenied(thrown.message)
                } else {
                    Error::HandlerFailure {
                        stage,
                        message: format!("{}: {}", thrown.name, thrown.message),
                    }
                };
                warn!(
                    module = module.name(),
                    %stage,
                    code = err.code(),
                    error = %err,
                    "handler failed; passing through"
                );
                InvocationResult::Passthrough
            }
            Ok(Settlement::Abandoned) => {
                warn!(
                    module = module.name(),
                    %stage,
                    "handler returned without signalling completion; passing through"
                );
                InvocationResult::Passthrough
            }
            Err(err) => {
                error!(
                    module = module.name(),
                    %stage,
                    error = %err,
                    "sandbox failure; passing through"
                );
                InvocationResult::Passthrough
            }
        };

        debug!(
            module = module.name(),
            %stage,
            request_id = %request_id,
            elapsed_ms,
            outcome = outcome_label(&outcome),
            "stage invoked"
        );
        outcome
    }

    /// `{Records: [{cf: {config, request, response?}}]}`.
    pub fn build_event(
        &self,
        stage: Stage,
        request_id: &RequestId,
        request: &RequestRecord,
        response: Option<&ResponseRecord>,
    ) -> Value {
        let mut cf = json!({
            "config": {
                "distributionDomainName": self.settings.distribution_domain,
                "distributionId": self.settings.distribution_id,
                "eventType": stage.as_str(),
                "requestId": request_id.as_str(),
            },
            "request": request,
        });
        if let Some(response) = response {
            cf["response"] = json!(response);
        }
        json!({ "Records": [{ "cf": cf }] })
    }

    /// Context fields; the sandbox adds `getRemainingTimeInMillis()` and
    /// the legacy `done`/`succeed`/`fail` helpers.
    pub fn build_context(
        &self,
        module: &PluginModule,
        request_id: &RequestId,
        variables: &VariableStore,
    ) -> Value {
        let name = self
            .settings
            .function_name
            .clone()
            .or_else(|| variables.env("FUNCTION_NAME").map(str::to_string))
            .unwrap_or_else(|| module.stem());
        let version = &self.settings.function_version;
        let region = variables.env("REGION").unwrap_or(DEFAULT_REGION);
        let day = chrono::Utc::now().format("%Y/%m/%d");

        json!({
            "awsRequestId": request_id.as_str(),
            "functionName": name,
            "functionVersion": version,
            "memoryLimitInMB": self.settings.memory_limit_mb.to_string(),
            "logGroupName": format!("/aws/lambda/{region}.{name}"),
            "logStreamName": format!("{day}/[{version}]{}", &module.fingerprint()[..32]),
            "invokedFunctionArn": format!("arn:aws:lambda:{region}:{ACCOUNT_ID}:function:{name}:{version}"),
            "callbackWaitsForEmptyEventLoop": true,
            "remainingTimeMs": self.settings.remaining_time_ms,
        })
    }
}

/// Turn a settled value into a typed result for `stage`.
pub fn classify(stage: Stage, value: Value) -> Result<InvocationResult, serde_json::Error> {
    if value.is_null() {
        return Ok(InvocationResult::Passthrough);
    }
    if !stage.is_request_side() {
        return serde_json::from_value(value)
            .map(|r: ResponseRecord| InvocationResult::Response(r.with_reason_phrase()));
    }
    let generated = value.get("status").is_some() && value.get("uri").is_none();
    if generated {
        serde_json::from_value(value)
            .map(|r: ResponseRecord| InvocationResult::ShortCircuit(r.with_reason_phrase()))
    } else {
        serde_json::from_value(value).map(InvocationResult::Request)
    }
}

fn interpret(stage: Stage, value: Value, module: &PluginModule) -> InvocationResult {
    match classify(stage, value) {
        Ok(result) => result,
        Err(err) => {
            warn!(
                module = module.name(),
                %stage,
                error = %err,
                "handler result is not a valid record; passing through"
            );
            InvocationResult::Passthrough
        }
    }
}

fn outcome_label(outcome: &InvocationResult) -> &'static str {
    match outcome {
        InvocationResult::Request(_) => "request",
        InvocationResult::ShortCircuit(_) => "short_circuit",
        InvocationResult::Response(_) => "response",
        InvocationResult::Passthrough => "passthrough",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edge_common::HeaderMap;

    #[test]
    fn test_classify_request_side() {
        let request = classify(Stage::ViewerRequest, json!({"uri": "/a", "querystring": "x=1"}));
        match request.unwrap() {
            InvocationResult::Request(r) => assert_eq!(r.addressable_path(), "/a?x=1"),
            other => panic!("unexpected: {other:?}"),
        }

        let generated = classify(
            Stage::ViewerRequest,
            json!({"status": "302", "headers": {"location": [{"key": "Location", "value": "/b"}]}}),
        );
        match generated.unwrap() {
            InvocationResult::ShortCircuit(r) => {
                assert_eq!(r.status, 302);
                assert_eq!(r.status_description, "Found");
                assert_eq!(r.headers.get("Location"), Some("/b"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_status_with_uri_is_still_a_request() {
        let result = classify(Stage::OriginRequest, json!({"uri": "/a", "status": "200"})).unwrap();
        assert!(matches!(result, InvocationResult::Request(_)));
    }

    #[test]
    fn test_classify_response_side() {
        let result = classify(Stage::ViewerResponse, json!({"status": 200})).unwrap();
        assert_eq!(
            result,
            InvocationResult::Response(ResponseRecord::new(200, HeaderMap::new()))
        );
        assert!(classify(Stage::OriginResponse, json!({"headers": {}})).is_err());
    }

    #[test]
    fn test_null_is_passthrough() {
        assert_eq!(
            classify(Stage::OriginRequest, Value::Null).unwrap(),
            InvocationResult::Passthrough
        );
    }

    #[test]
    fn test_event_shape() {
        let invoker = Invoker::default();
        let id = RequestId::new();
        let request = RequestRecord::from_target("GET", "/p?q=1");
        let response = ResponseRecord::new(200, HeaderMap::new());
        let event = invoker.build_event(Stage::OriginResponse, &id, &request, Some(&response));
        let cf = &event["Records"][0]["cf"];
        assert_eq!(cf["config"]["eventType"], "origin-response");
        assert_eq!(cf["config"]["requestId"], id.as_str());
        assert_eq!(cf["request"]["uri"], "/p");
        assert_eq!(cf["request"]["querystring"], "q=1");
        assert_eq!(cf["response"]["status"], "200");

        let event = invoker.build_event(Stage::ViewerRequest, &id, &request, None);
        assert!(event["Records"][0]["cf"].get("response").is_none());
    }
}
