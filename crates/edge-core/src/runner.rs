//! The runner facade the serving layer holds on to.

use crate::boundary::{RequestOutcome, ResponseOutcome};
use crate::invoke::{InvokeSettings, Invoker};
use crate::pipeline::{Pipeline, RequestRun, ResponseRun};
use crate::registry::{LoadReport, ModuleRegistry, RegistrySettings, StageMap};
use edge_common::{RequestRecord, ResponseRecord, Result};
use edge_config::RunnerConfig;
use std::sync::Arc;
use tracing::info;

/// Registry plus pipeline, ready to serve.
#[derive(Debug)]
pub struct EdgeRunner {
    registry: Arc<ModuleRegistry>,
    pipeline: Pipeline,
}

impl EdgeRunner {
    /// Load everything `config` names and, if enabled, start watching.
    ///
    /// Fatal configuration problems (restricted env names, duplicate stage
    /// bindings, missing paths) are returned and nothing is served.
    pub fn start(config: &RunnerConfig) -> Result<Self> {
        let runner = Self::with_settings(
            RegistrySettings::from_config(config)?,
            InvokeSettings::from_config(config),
        )?;
        if config.watch.enabled {
            runner.watch()?;
        }
        Ok(runner)
    }

    pub fn with_settings(registry: RegistrySettings, invoke: InvokeSettings) -> Result<Self> {
        let registry = Arc::new(ModuleRegistry::open(registry)?);
        let map = registry.stage_map();
        info!(
            modules = map.len(),
            stages = ?map.iter().map(|(s, _)| s.as_str()).collect::<Vec<_>>(),
            "edge runner ready"
        );
        Ok(Self {
            registry,
            pipeline: Pipeline::new(Invoker::new(invoke)),
        })
    }

    /// Run the request-side stages against one generation.
    pub fn handle_request(&self, request: RequestRecord) -> RequestRun {
        let generation = self.registry.current();
        self.pipeline.run_request(&generation, request)
    }

    pub fn request_outcome(&self, request: RequestRecord) -> RequestOutcome {
        self.handle_request(request).into()
    }

    /// Run the response-side stages against one generation.
    pub fn handle_response(&self, request: &RequestRecord, response: ResponseRecord) -> ResponseRun {
        let generation = self.registry.current();
        self.pipeline.run_response(&generation, request, response)
    }

    pub fn response_outcome(&self, request: &RequestRecord, response: ResponseRecord) -> ResponseOutcome {
        self.handle_response(request, response).into()
    }

    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.registry
    }

    pub fn stage_map(&self) -> Arc<StageMap> {
        self.registry.stage_map()
    }

    pub fn report(&self) -> Arc<LoadReport> {
        self.registry.report()
    }

    pub fn reload(&self) -> Result<()> {
        self.registry.reload()
    }

    pub fn watch(&self) -> Result<()> {
        self.registry.watch()
    }

    pub fn close(&self) {
        self.registry.close();
    }
}

impl Drop for EdgeRunner {
    fn drop(&mut self) {
        self.close();
    }
}
