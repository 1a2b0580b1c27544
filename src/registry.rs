//! Registry of named pipelines.
//!
//! The registry maps pipeline names to [`Pipeline`] handles. It is built
//! once from a TOML definitions file and lives for the process lifetime.
//!
//! # Definitions file
//!
//! ```toml
//! [pipelines.indexing]
//! script = "indexing.lua"          # relative to this file
//! nodes = ["converter", "cleaner", "splitter", "writer"]
//! timeout = 60
//!
//! [pipelines.indexing.metadata]
//! description = "Index uploaded documents"
//! ```
//!
//! # One-time initialization
//!
//! [`LazyRegistry`] wraps the load in a [`tokio::sync::OnceCell`]: the first
//! caller triggers the load, concurrent callers wait for that same load,
//! and nobody ever sees a partially built mapping. A failed load is not
//! cached, so the next request tries again.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::OnceCell;
use tracing::info;

use crate::audit::{format_seconds, WarmUpRecord};
use crate::error::{ServeError, ServeResult};
use crate::pipeline::Pipeline;
use crate::script::{PipelineDefinition, ScriptPipeline};

/// Parsed definitions file.
#[derive(Debug, Deserialize)]
pub struct DefinitionsFile {
    #[serde(default)]
    pub pipelines: BTreeMap<String, PipelineDefinition>,
}

/// Outcome of warming one pipeline.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct WarmUpReport {
    pub pipeline: String,
    /// Elapsed seconds, two decimals.
    pub time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Name → pipeline mapping.
#[derive(Default)]
pub struct PipelineRegistry {
    pipelines: BTreeMap<String, Arc<dyn Pipeline>>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every pipeline declared in the definitions file at `source`.
    pub fn load(source: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(source)
            .with_context(|| format!("Failed to read pipeline definitions: {}", source.display()))?;
        let file: DefinitionsFile = toml::from_str(&content)
            .with_context(|| format!("Failed to parse pipeline definitions: {}", source.display()))?;

        let base_dir = source.parent().unwrap_or(Path::new("."));
        let mut registry = Self::new();
        for (name, def) in &file.pipelines {
            let pipeline = ScriptPipeline::from_definition(name, def, base_dir)
                .with_context(|| format!("Failed to load pipeline '{}'", name))?;
            registry.register(name.clone(), Arc::new(pipeline))?;
        }

        info!(
            source = %source.display(),
            count = registry.len(),
            "loaded pipeline definitions"
        );
        Ok(registry)
    }

    /// Build a registry from already constructed handles.
    pub fn from_pipelines<I, S>(pipelines: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, Arc<dyn Pipeline>)>,
        S: Into<String>,
    {
        let mut registry = Self::new();
        for (name, pipeline) in pipelines {
            registry.register(name, pipeline)?;
        }
        Ok(registry)
    }

    /// Register a pipeline. Names must be unique.
    pub fn register(&mut self, name: impl Into<String>, pipeline: Arc<dyn Pipeline>) -> Result<()> {
        let name = name.into();
        if self.pipelines.contains_key(&name) {
            bail!("pipeline '{}' is registered twice", name);
        }
        self.pipelines.insert(name, pipeline);
        Ok(())
    }

    /// Look up a pipeline by name.
    pub fn get(&self, name: &str) -> ServeResult<Arc<dyn Pipeline>> {
        self.pipelines.get(name).cloned().ok_or_else(|| {
            ServeError::NotFound(format!(
                "Pipeline named '{}' not found. Available pipelines: {}",
                name,
                self.names().join(", ")
            ))
        })
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.pipelines.keys().cloned().collect()
    }

    /// Name → metadata for every registered pipeline.
    pub fn list(&self) -> Map<String, Value> {
        self.pipelines
            .iter()
            .map(|(name, p)| (name.clone(), p.metadata()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }

    /// Warm up one pipeline.
    ///
    /// Unknown names fail with [`ServeError::NotFound`]; a failing warm-up
    /// is reported as [`ServeError::Execution`].
    pub async fn warm_up(&self, name: &str) -> ServeResult<WarmUpReport> {
        let pipeline = self.get(name)?;
        let report = warm_up_one(name, pipeline).await;
        match &report.error {
            Some(message) => Err(ServeError::Execution {
                pipeline: name.to_string(),
                message: message.clone(),
            }),
            None => Ok(report),
        }
    }

    /// Warm up every pipeline. Each one is attempted regardless of how the
    /// others fared; failures are logged and reported individually.
    pub async fn warm_up_all(&self) -> Vec<WarmUpReport> {
        let mut reports = Vec::with_capacity(self.pipelines.len());
        for (name, pipeline) in &self.pipelines {
            reports.push(warm_up_one(name, pipeline.clone()).await);
        }
        reports
    }
}

/// Warm up on a separate task so a panicking engine is reported like any
/// other failure.
async fn warm_up_one(name: &str, pipeline: Arc<dyn Pipeline>) -> WarmUpReport {
    let start = Instant::now();
    let outcome = tokio::spawn(async move { pipeline.warm_up().await }).await;
    let time = format_seconds(start.elapsed());
    let error = match outcome {
        Ok(Ok(())) => None,
        Ok(Err(err)) => Some(format!("{:#}", err)),
        Err(join_err) => Some(format!("pipeline task aborted: {}", join_err)),
    };

    WarmUpRecord {
        kind: "warmup",
        pipeline: name,
        time: time.clone(),
        error: error.as_deref(),
    }
    .emit();

    WarmUpReport {
        pipeline: name.to_string(),
        time,
        error,
    }
}

type Loader = Arc<dyn Fn() -> Result<PipelineRegistry> + Send + Sync>;

/// Process-wide registry handle with one-time initialization.
///
/// Constructed at startup and shared with every request handler.
pub struct LazyRegistry {
    loader: Loader,
    cell: OnceCell<PipelineRegistry>,
}

impl LazyRegistry {
    /// Load from the definitions file at `source` on first use.
    pub fn new(source: impl Into<PathBuf>) -> Self {
        let source = source.into();
        Self::with_loader(move || PipelineRegistry::load(&source))
    }

    /// Run `loader` on first use.
    pub fn with_loader<F>(loader: F) -> Self
    where
        F: Fn() -> Result<PipelineRegistry> + Send + Sync + 'static,
    {
        Self {
            loader: Arc::new(loader),
            cell: OnceCell::new(),
        }
    }

    /// Wrap an already built registry.
    pub fn ready(registry: PipelineRegistry) -> Self {
        Self {
            loader: Arc::new(|| -> Result<PipelineRegistry> {
                bail!("registry was provided pre-built")
            }),
            cell: OnceCell::new_with(Some(registry)),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.cell.initialized()
    }

    /// The registry, loading it first if nobody has yet.
    pub async fn get(&self) -> ServeResult<&PipelineRegistry> {
        self.cell
            .get_or_try_init(|| async {
                let loader = self.loader.clone();
                tokio::task::spawn_blocking(move || loader())
                    .await
                    .map_err(|e| ServeError::Internal(format!("Pipeline loading panicked: {}", e)))?
                    .map_err(|e| ServeError::Internal(format!("Failed to load pipelines: {:#}", e)))
            })
            .await
    }
}
