//! Offline CLI commands.
//!
//! These act on the configured storage root and definitions file directly,
//! without a running server, and print results to stdout.

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::io::Write;
use std::path::Path;
use tokio::io::AsyncReadExt;
use tokio_util::io::ReaderStream;

use crate::config::Config;
use crate::dispatch::run_pipeline;
use crate::files::{FileStore, Listing};
use crate::pipeline::{NodeParameters, RunRequest};
use crate::registry::PipelineRegistry;

fn load_registry(config: &Config) -> Result<PipelineRegistry> {
    PipelineRegistry::load(&config.pipelines.definitions)
}

fn open_store(config: &Config) -> Result<FileStore> {
    FileStore::open(&config.files.root).with_context(|| {
        format!(
            "Failed to open storage root: {}",
            config.files.root.display()
        )
    })
}

/// Print every pipeline with its node names.
pub fn list_pipelines(config: &Config) -> Result<()> {
    let registry = load_registry(config)?;
    if registry.is_empty() {
        println!(
            "No pipelines defined in {}",
            config.pipelines.definitions.display()
        );
        return Ok(());
    }

    println!("{:<24} NODES", "PIPELINE");
    for name in registry.names() {
        let pipeline = registry.get(&name)?;
        println!("{:<24} {}", name, pipeline.nodes().join(", "));
    }
    Ok(())
}

/// Warm up one pipeline, or all of them when `name` is `None`.
///
/// Returns an error if any warm-up failed.
pub async fn warm_up(config: &Config, name: Option<&str>) -> Result<()> {
    let registry = load_registry(config)?;
    let reports = match name {
        Some(name) => vec![registry.warm_up(name).await?],
        None => registry.warm_up_all().await,
    };

    let mut failed = 0;
    for report in &reports {
        match &report.error {
            None => println!("{:<24} ok      {}s", report.pipeline, report.time),
            Some(err) => {
                failed += 1;
                println!("{:<24} FAILED  {}s  {}", report.pipeline, report.time, err);
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{} of {} pipelines failed to warm up", failed, reports.len());
    }
    Ok(())
}

/// Run a pipeline once and pretty-print its JSON result.
pub async fn run(
    config: &Config,
    name: &str,
    data: Option<&str>,
    parameters: Option<&str>,
    debug: bool,
) -> Result<()> {
    let data: Map<String, Value> = match data {
        Some(raw) => serde_json::from_str(raw).context("--data must be a JSON object")?,
        None => Map::new(),
    };
    let parameters: NodeParameters = match parameters {
        Some(raw) => serde_json::from_str(raw)
            .context("--parameters must be a JSON object of objects keyed by node name")?,
        None => NodeParameters::new(),
    };

    let registry = load_registry(config)?;
    let request = RunRequest {
        data,
        parameters,
        debug,
    };
    let result = run_pipeline(&registry, name, request).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

/// List a directory, or write a file's bytes to stdout.
pub async fn list_files(config: &Config, path: Option<&str>) -> Result<()> {
    let store = open_store(config)?;
    match store.list(path).await? {
        Listing::Directory(entries) => {
            for entry in entries {
                println!("{}", entry);
            }
        }
        Listing::File(mut download) => {
            let mut content = Vec::new();
            download.file.read_to_end(&mut content).await?;
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&content)?;
            stdout.flush()?;
        }
    }
    Ok(())
}

/// Copy a local file into the store under `dest`, or under its own name.
pub async fn upload_file(config: &Config, local: &Path, dest: Option<&str>) -> Result<()> {
    let store = open_store(config)?;
    let file = tokio::fs::File::open(local)
        .await
        .with_context(|| format!("Failed to open {}", local.display()))?;
    let filename = local.file_name().and_then(|n| n.to_str());

    let stored = store
        .upload(dest, filename, ReaderStream::new(file))
        .await?;
    println!("Stored {}", stored.display());
    Ok(())
}
