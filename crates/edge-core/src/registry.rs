//! Plugin module registry.
//!
//! The registry turns a plugin path into a [`StageMap`]: every plugin file is
//! baked, evaluated in its own sandbox and bound to the stage it exports.
//!
//! - A directory contributes each direct child `.js`/`.cjs`/`.mjs` file, in
//!   name order; anything else is skipped.
//! - A file that fails to evaluate is logged, recorded in the [`LoadReport`]
//!   and left out. The rest of the directory still loads.
//! - Two modules exporting the same stage abort the whole load with
//!   [`Error::DuplicateStageBinding`].
//!
//! The active generation (stage map, variables, report) lives behind an
//! [`ArcSwap`]. Readers take one snapshot per request; [`ModuleRegistry::reload`]
//! builds a complete new generation off to the side and publishes it with a
//! single swap, so a request only ever sees the old map or the new one.

use crate::sandbox::resolve::ModuleResolver;
use crate::sandbox::{bake, Sandbox, SandboxLimits, Settlement};
use crate::watch::WatchHandle;
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use edge_common::{Error, Result, Stage, SCHEMA_VERSION};
use edge_config::{RunnerConfig, VariableStore};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// File extensions considered when loading a plugin directory.
pub const PLUGIN_EXTENSIONS: [&str; 3] = ["js", "cjs", "mjs"];

/// Everything the registry needs to (re)build a generation.
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub plugins: PathBuf,
    pub bake_file: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
    pub bake_output: Option<PathBuf>,
    pub limits: SandboxLimits,
    pub debounce: Duration,
}

impl RegistrySettings {
    pub fn new(plugins: impl Into<PathBuf>) -> Self {
        Self {
            plugins: plugins.into(),
            bake_file: None,
            env_file: None,
            bake_output: None,
            limits: SandboxLimits::default(),
            debounce: Duration::from_millis(edge_config::runner::DEFAULT_DEBOUNCE_MS),
        }
    }

    pub fn from_config(config: &RunnerConfig) -> Result<Self> {
        let plugins = config
            .plugins
            .clone()
            .ok_or_else(|| Error::Config("no plugin file or directory configured".to_string()))?;
        Ok(Self {
            plugins,
            bake_file: config.bake_file.clone(),
            env_file: config.env_file.clone(),
            bake_output: config.bake_output.clone(),
            limits: SandboxLimits::from_settings(&config.sandbox),
            debounce: Duration::from_millis(config.watch.debounce_ms),
        })
    }

    /// Files and directories whose changes should trigger a reload.
    pub fn watched_paths(&self) -> Vec<PathBuf> {
        let mut paths = vec![self.plugins.clone()];
        paths.extend(self.bake_file.iter().cloned());
        paths.extend(self.env_file.iter().cloned());
        paths
    }
}

// ── Modules and stage map ───────────────────────────────────────────────

/// A loaded plugin bound to one stage.
#[derive(Debug)]
pub struct PluginModule {
    path: PathBuf,
    stage: Stage,
    fingerprint: String,
    sandbox: Sandbox,
}

impl PluginModule {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// SHA-256 of the baked source, hex encoded.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn name(&self) -> &str {
        self.sandbox.name()
    }

    /// File stem, used as the default function name.
    pub fn stem(&self) -> String {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.name().to_string())
    }

    pub(crate) fn run(&self, event_json: &str, context_json: &str) -> Result<Settlement> {
        self.sandbox.invoke(event_json, context_json)
    }
}

/// Stage → modules bound to it, in execution order.
#[derive(Debug, Default)]
pub struct StageMap {
    stages: BTreeMap<Stage, Vec<Arc<PluginModule>>>,
}

impl StageMap {
    pub fn modules(&self, stage: Stage) -> &[Arc<PluginModule>] {
        self.stages.get(&stage).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_bound(&self, stage: Stage) -> bool {
        !self.modules(stage).is_empty()
    }

    /// Bind a module, refusing a second module for an occupied stage.
    pub fn bind(&mut self, module: PluginModule) -> Result<()> {
        let slot = self.stages.entry(module.stage).or_default();
        if let Some(first) = slot.first() {
            return Err(Error::DuplicateStageBinding {
                stage: module.stage,
                first: first.path.clone(),
                second: module.path,
            });
        }
        slot.push(Arc::new(module));
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = (Stage, &Arc<PluginModule>)> {
        self.stages
            .iter()
            .flat_map(|(stage, modules)| modules.iter().map(move |m| (*stage, m)))
    }

    /// Number of bound modules.
    pub fn len(&self) -> usize {
        self.stages.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── Load report ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadedModule {
    pub path: PathBuf,
    pub stage: Stage,
    pub fingerprint: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedFile {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedFile {
    pub path: PathBuf,
    pub error: String,
    pub code: u32,
}

/// What one load pass did with each file it saw.
#[derive(Debug, Clone, Serialize)]
pub struct LoadReport {
    pub schema_version: &'static str,
    pub generation: u64,
    pub loaded_at: DateTime<Utc>,
    pub plugins: PathBuf,
    pub loaded: Vec<LoadedModule>,
    pub skipped: Vec<SkippedFile>,
    pub failed: Vec<FailedFile>,
}

impl LoadReport {
    fn new(generation: u64, plugins: &Path) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            generation,
            loaded_at: Utc::now(),
            plugins: plugins.to_path_buf(),
            loaded: Vec::new(),
            skipped: Vec::new(),
            failed: Vec::new(),
        }
    }
}

// ── Generations ─────────────────────────────────────────────────────────

/// One consistent view: the variables and the modules built from them.
#[derive(Debug)]
pub struct Generation {
    pub stages: Arc<StageMap>,
    pub variables: Arc<VariableStore>,
    pub report: Arc<LoadReport>,
}

/// Build a complete generation from scratch.
pub fn build_generation(settings: &RegistrySettings, number: u64) -> Result<Generation> {
    let variables = Arc::new(VariableStore::load(
        settings.bake_file.as_deref(),
        settings.env_file.as_deref(),
    )?);
    let (stages, report) = load_plugins(settings, &variables, number)?;
    info!(
        generation = number,
        modules = stages.len(),
        failed = report.failed.len(),
        "plugin generation built"
    );
    Ok(Generation {
        stages: Arc::new(stages),
        variables,
        report: Arc::new(report),
    })
}

/// Load every plugin under `settings.plugins`.
pub fn load_plugins(
    settings: &RegistrySettings,
    variables: &VariableStore,
    generation: u64,
) -> Result<(StageMap, LoadReport)> {
    let root = &settings.plugins;
    let mut report = LoadReport::new(generation, root);

    let (files, confinement) = if root.is_dir() {
        (plugin_files(root, &mut report)?, root.clone())
    } else if root.is_file() {
        let parent = root
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        (vec![root.clone()], parent)
    } else {
        return Err(Error::PluginPathNotFound { path: root.clone() });
    };

    let bake_vars = Arc::new(variables.bake_vars().clone());
    let resolver = Arc::new(ModuleResolver::new(&confinement, bake_vars));
    let mut stages = StageMap::default();

    for file in files {
        match load_module(&file, settings, variables, Arc::clone(&resolver)) {
            Ok(Loaded::Module(module)) => {
                report.loaded.push(LoadedModule {
                    path: module.path.clone(),
                    stage: module.stage,
                    fingerprint: module.fingerprint.clone(),
                });
                info!(
                    path = %module.path.display(),
                    stage = %module.stage,
                    fingerprint = &module.fingerprint[..12],
                    "module bound"
                );
                stages.bind(module)?;
            }
            Ok(Loaded::Ignored(reason)) => {
                debug!(path = %file.display(), %reason, "module ignored");
                report.skipped.push(SkippedFile { path: file, reason });
            }
            Err(err) => {
                error!(path = %file.display(), error = %err, "module failed to load");
                report.failed.push(FailedFile {
                    path: file,
                    code: err.code(),
                    error: err.to_string(),
                });
            }
        }
    }

    Ok((stages, report))
}

fn plugin_files(dir: &Path, report: &mut LoadReport) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(dir).map_err(|e| Error::io(dir, e))?;
    let mut files = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| Error::io(dir, e))?.path();
        if !path.is_file() {
            continue;
        }
        if is_plugin_file(&path) {
            files.push(path);
        } else {
            debug!(path = %path.display(), "skipping non-plugin file");
            report.skipped.push(SkippedFile {
                path,
                reason: "not a plugin source file".to_string(),
            });
        }
    }
    files.sort();
    Ok(files)
}

/// Write baked copies of every plugin source to `output` without evaluating them.
pub fn bake_plugins(settings: &RegistrySettings, output: &Path) -> Result<Vec<PathBuf>> {
    let variables = VariableStore::load(settings.bake_file.as_deref(), settings.env_file.as_deref())?;
    let root = &settings.plugins;
    let files = if root.is_dir() {
        let mut scratch = LoadReport::new(0, root);
        plugin_files(root, &mut scratch)?
    } else if root.is_file() {
        vec![root.clone()]
    } else {
        return Err(Error::PluginPathNotFound { path: root.clone() });
    };

    let mut written = Vec::with_capacity(files.len());
    for file in files {
        let source = fs::read_to_string(&file).map_err(|e| Error::io(&file, e))?;
        let target = bake::artifact_path(output, root, &file);
        bake::write_artifact(&target, &bake::substitute(&source, variables.bake_vars()))?;
        written.push(target);
    }
    Ok(written)
}

pub fn is_plugin_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| PLUGIN_EXTENSIONS.contains(&ext))
}

enum Loaded {
    Module(PluginModule),
    Ignored(String),
}

fn load_module(
    path: &Path,
    settings: &RegistrySettings,
    variables: &VariableStore,
    resolver: Arc<ModuleResolver>,
) -> Result<Loaded> {
    let source = fs::read_to_string(path).map_err(|e| Error::ModuleLoad {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    let baked = bake::substitute(&source, variables.bake_vars());

    let unresolved = bake::unresolved_tokens(&baked, variables.bake_vars());
    if !unresolved.is_empty() && !variables.bake_vars().is_empty() {
        debug!(path = %path.display(), tokens = ?unresolved, "tokens left without bake value");
    }

    if let Some(output) = &settings.bake_output {
        let target = bake::artifact_path(output, &settings.plugins, path);
        if let Err(err) = bake::write_artifact(&target, &baked) {
            warn!(path = %target.display(), error = %err, "failed to write baked artifact");
        }
    }

    let fingerprint = hex::encode(Sha256::digest(baked.as_bytes()));
    let (sandbox, descriptor) = Sandbox::evaluate(
        path,
        &baked,
        variables.env_vars(),
        resolver,
        settings.limits,
    )
    .map_err(|err| match err {
        Error::ModuleLoad { .. } => err,
        other => Error::ModuleLoad {
            path: path.to_path_buf(),
            message: other.to_string(),
        },
    })?;

    let Some(stage_name) = descriptor.stage else {
        return Ok(Loaded::Ignored("no stage export".to_string()));
    };
    let stage: Stage = match stage_name.parse() {
        Ok(stage) => stage,
        Err(err) => return Ok(Loaded::Ignored(format!("{err}"))),
    };
    if !descriptor.has_handler {
        return Ok(Loaded::Ignored("handler export is not a function".to_string()));
    }

    Ok(Loaded::Module(PluginModule {
        path: path.to_path_buf(),
        stage,
        fingerprint,
        sandbox,
    }))
}

// ── Registry ────────────────────────────────────────────────────────────

/// The live set of plugin modules.
pub struct ModuleRegistry {
    settings: RegistrySettings,
    current: ArcSwap<Generation>,
    generation: AtomicU64,
    pub(crate) watcher: Mutex<Option<WatchHandle>>,
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("plugins", &self.settings.plugins)
            .field("generation", &self.generation.load(Ordering::Relaxed))
            .finish()
    }
}

impl ModuleRegistry {
    /// Load variables and plugins. Fatal errors are returned as-is.
    pub fn open(settings: RegistrySettings) -> Result<Self> {
        let first = build_generation(&settings, 1)?;
        Ok(Self {
            settings,
            current: ArcSwap::from_pointee(first),
            generation: AtomicU64::new(1),
            watcher: Mutex::new(None),
        })
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.settings
    }

    /// The active generation, held for the duration of one request.
    pub fn current(&self) -> Arc<Generation> {
        self.current.load_full()
    }

    pub fn stage_map(&self) -> Arc<StageMap> {
        Arc::clone(&self.current.load().stages)
    }

    pub fn variables(&self) -> Arc<VariableStore> {
        Arc::clone(&self.current.load().variables)
    }

    pub fn report(&self) -> Arc<LoadReport> {
        Arc::clone(&self.current.load().report)
    }

    /// Rebuild everything and publish it atomically.
    ///
    /// On error the active generation is left untouched.
    pub fn reload(&self) -> Result<()> {
        let number = self.generation.load(Ordering::SeqCst) + 1;
        match build_generation(&self.settings, number) {
            Ok(next) => {
                self.current.store(Arc::new(next));
                self.generation.store(number, Ordering::SeqCst);
                info!(generation = number, "plugin generation published");
                Ok(())
            }
            Err(err) => {
                error!(
                    error = %err,
                    code = err.code(),
                    "reload failed; keeping previous plugin generation"
                );
                Err(err)
            }
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}
