//! Batch ingest: store a set of uploaded files, run one pipeline over them,
//! then discard them unless the caller asked to keep them.
//!
//! Each file is stored at the top of the storage root as
//! `<uuid>_<original name>`, so repeated uploads of the same name never
//! conflict. The pipeline's first node receives the files as
//!
//! ```json
//! { "sources": [{ "path": "<stored path>", "filename": "a.txt", "text": "..." }] }
//! ```
//!
//! where `text` is `null` for content that is not valid UTF-8.

use futures::Stream;
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{info, warn};
use uuid::Uuid;

use crate::dispatch::run_pipeline;
use crate::error::{ServeError, ServeResult};
use crate::files::FileStore;
use crate::paths;
use crate::pipeline::{NodeParameters, RunRequest};
use crate::registry::PipelineRegistry;

/// A file stored for one ingest request.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedFile {
    /// Stored path, relative to the storage root.
    pub path: PathBuf,
    /// Name the client uploaded it under.
    pub filename: String,
}

/// Store one uploaded file under a fresh unique name.
pub async fn stage<S, B, E>(
    store: &FileStore,
    filename: Option<&str>,
    content: S,
) -> ServeResult<StagedFile>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let filename = filename
        .and_then(|f| Path::new(f).file_name())
        .and_then(|f| f.to_str())
        .ok_or_else(|| ServeError::BadRequest("Every uploaded file needs a file name.".to_string()))?;

    let unique = format!("{}_{}", Uuid::new_v4().simple(), filename);
    let path = store.upload(Some(&unique), None, content).await?;
    Ok(StagedFile {
        path,
        filename: filename.to_string(),
    })
}

/// Run pipeline `name` over `staged`, then remove the files unless
/// `keep_files` is set. Files are removed whether or not the run succeeded.
pub async fn ingest(
    store: &FileStore,
    registry: &PipelineRegistry,
    name: &str,
    staged: Vec<StagedFile>,
    keep_files: bool,
) -> ServeResult<Value> {
    let outcome = run(store, registry, name, &staged).await;
    if !keep_files {
        discard(store, &staged).await;
    }
    outcome
}

async fn run(
    store: &FileStore,
    registry: &PipelineRegistry,
    name: &str,
    staged: &[StagedFile],
) -> ServeResult<Value> {
    if staged.is_empty() {
        return Err(ServeError::BadRequest("No files were uploaded.".to_string()));
    }

    let pipeline = registry.get(name)?;
    let entry = pipeline
        .nodes()
        .into_iter()
        .next()
        .ok_or_else(|| ServeError::Internal(format!("Pipeline '{}' has no nodes.", name)))?;

    let mut sources = Vec::with_capacity(staged.len());
    for file in staged {
        let bytes = fs::read(store.root().join(&file.path)).await?;
        sources.push(json!({
            "path": paths::relative_display(&file.path),
            "filename": file.filename,
            "text": String::from_utf8(bytes).ok(),
        }));
    }
    info!(pipeline = name, node = %entry, files = sources.len(), "ingesting files");

    let mut data = Map::new();
    data.insert(entry, json!({ "sources": sources }));
    let request = RunRequest {
        data,
        parameters: NodeParameters::new(),
        debug: false,
    };
    run_pipeline(registry, name, request).await
}

/// Remove staged files, logging failures.
pub async fn discard(store: &FileStore, staged: &[StagedFile]) {
    for file in staged {
        if let Err(err) = store.remove(&file.path).await {
            warn!(path = %file.path.display(), error = %err, "failed to remove ingested file");
        }
    }
}
