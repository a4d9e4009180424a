//! Pipeline orchestration.
//!
//! Request side: viewer-request, then origin-request. A stage that returns a
//! generated response short-circuits the rest. Response side: origin-response,
//! then viewer-response, each receiving the record the previous one produced.
//! Stages with no bound module are skipped; a stage that passes through keeps
//! the previous record. Every stage runs under a header snapshot.

use crate::invoke::{InvocationResult, Invoker};
use crate::policy::{HeaderSnapshot, HeaderViolation};
use crate::registry::Generation;
use edge_common::{RequestRecord, ResponseRecord, Stage, REQUEST_STAGES, RESPONSE_STAGES};
use serde::Serialize;
use tracing::{debug, info};

/// How the request side ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RequestResolution {
    /// Continue to the file layer with this request.
    Forward {
        request: RequestRecord,
        /// Last stage that ran, if any.
        stage: Option<Stage>,
    },
    /// A stage answered; nothing is served from disk.
    ShortCircuit { response: ResponseRecord, stage: Stage },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestRun {
    pub resolution: RequestResolution,
    pub stages_run: Vec<Stage>,
    pub violations: Vec<HeaderViolation>,
}

impl RequestRun {
    /// `uri` re-joined with `?querystring` for the forwarded request.
    pub fn forwarded_path(&self) -> Option<String> {
        match &self.resolution {
            RequestResolution::Forward { request, .. } => Some(request.addressable_path()),
            RequestResolution::ShortCircuit { .. } => None,
        }
    }

    pub fn is_short_circuit(&self) -> bool {
        matches!(self.resolution, RequestResolution::ShortCircuit { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseRun {
    pub response: ResponseRecord,
    pub stages_run: Vec<Stage>,
    pub violations: Vec<HeaderViolation>,
}

#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    invoker: Invoker,
}

impl Pipeline {
    pub fn new(invoker: Invoker) -> Self {
        Self { invoker }
    }

    pub fn invoker(&self) -> &Invoker {
        &self.invoker
    }

    pub fn run_request(&self, generation: &Generation, request: RequestRecord) -> RequestRun {
        let mut request = request;
        let mut stages_run = Vec::new();
        let mut violations = Vec::new();

        for stage in REQUEST_STAGES {
            for module in generation.stages.modules(stage) {
                let snapshot = HeaderSnapshot::capture(stage, &request.headers);
                stages_run.push(stage);
                match self
                    .invoker
                    .invoke(module, stage, &request, None, &generation.variables)
                {
                    InvocationResult::Request(next) => {
                        violations.extend(snapshot.diff(&next.headers));
                        request = next;
                    }
                    InvocationResult::ShortCircuit(response) => {
                        info!(
                            %stage,
                            module = module.name(),
                            status = response.status,
                            "request short-circuited"
                        );
                        return RequestRun {
                            resolution: RequestResolution::ShortCircuit { response, stage },
                            stages_run,
                            violations,
                        };
                    }
                    InvocationResult::Response(_) | InvocationResult::Passthrough => {}
                }
            }
        }

        let stage = stages_run.last().copied();
        debug!(
            path = %request.addressable_path(),
            stages = stages_run.len(),
            "request side done"
        );
        RequestRun {
            resolution: RequestResolution::Forward { request, stage },
            stages_run,
            violations,
        }
    }

    pub fn run_response(
        &self,
        generation: &Generation,
        request: &RequestRecord,
        response: ResponseRecord,
    ) -> ResponseRun {
        let mut response = response;
        let mut stages_run = Vec::new();
        let mut violations = Vec::new();

        for stage in RESPONSE_STAGES {
            for module in generation.stages.modules(stage) {
                let snapshot = HeaderSnapshot::capture(stage, &response.headers);
                stages_run.push(stage);
                if let InvocationResult::Response(next) = self.invoker.invoke(
                    module,
                    stage,
                    request,
                    Some(&response),
                    &generation.variables,
                ) {
                    violations.extend(snapshot.diff(&next.headers));
                    response = next;
                }
            }
        }

        debug!(
            status = response.status,
            stages = stages_run.len(),
            "response side done"
        );
        ResponseRun {
            response,
            stages_run,
            violations,
        }
    }
}
