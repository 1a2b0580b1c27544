//! Run dispatch: validation, execution, audit logging, error translation.
//!
//! A run goes through these steps and stops at the first failure:
//!
//! 1. resolve the pipeline name in the registry,
//! 2. check every key of `parameters` names a node of that pipeline,
//! 3. run the pipeline on its own task and emit a [`RunLogRecord`] there,
//! 4. return the result verbatim.
//!
//! Engine failures, including a panicking engine task, come back as
//! [`ServeError::Execution`] and never reach the transport as a fault.

use chrono::Utc;
use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use crate::audit::{format_seconds, RunLogRecord};
use crate::error::{ServeError, ServeResult};
use crate::pipeline::{Pipeline, RunRequest};
use crate::registry::PipelineRegistry;

/// Check that every parameter key names a node of `pipeline`.
pub fn validate_nodes(name: &str, pipeline: &dyn Pipeline, request: &RunRequest) -> ServeResult<()> {
    match request.parameters.keys().find(|node| !pipeline.has_node(node)) {
        Some(node) => Err(ServeError::NotFound(format!(
            "Node named '{}' not found. Available nodes for '{}': {}",
            node,
            name,
            pipeline.nodes().join(", ")
        ))),
        None => Ok(()),
    }
}

/// Run the pipeline called `name` with `request`.
///
/// The engine call and its audit record happen on a spawned task. If the
/// caller stops waiting (client disconnect), the run still completes and
/// is audited, but its result is discarded.
pub async fn run_pipeline(
    registry: &PipelineRegistry,
    name: &str,
    request: RunRequest,
) -> ServeResult<Value> {
    let pipeline = registry.get(name)?;
    validate_nodes(name, pipeline.as_ref(), &request)?;

    let task_name = name.to_string();
    let outcome = tokio::spawn(async move { execute(&task_name, pipeline, request).await }).await;

    match outcome {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(message)) => Err(ServeError::Execution {
            pipeline: name.to_string(),
            message,
        }),
        Err(join_err) => Err(ServeError::Execution {
            pipeline: name.to_string(),
            message: format!("pipeline task aborted: {}", join_err),
        }),
    }
}

/// Call the engine, contain a panic, and emit the run record.
async fn execute(
    name: &str,
    pipeline: Arc<dyn Pipeline>,
    request: RunRequest,
) -> Result<Value, String> {
    let started_at = Utc::now();
    let start = Instant::now();

    let call = pipeline.run(request.data.clone(), request.parameters.clone(), request.debug);
    let outcome = match AssertUnwindSafe(call).catch_unwind().await {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(err)) => Err(format!("{:#}", err)),
        Err(panic) => Err(format!("pipeline task aborted: {}", panic_message(&*panic))),
    };

    let mut record = RunLogRecord {
        kind: "run",
        pipeline: name,
        started_at,
        time: format_seconds(start.elapsed()),
        data: &request.data,
        parameters: &request.parameters,
        debug: request.debug,
        response: None,
        error: None,
    };
    match &outcome {
        Ok(result) => record.response = Some(result),
        Err(message) => record.error = Some(message),
    }
    record.emit();

    outcome
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("panic")
}
