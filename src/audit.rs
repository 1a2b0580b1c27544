//! Structured audit records for pipeline runs and warm-ups.
//!
//! Each record is serialized to a single JSON line and emitted through
//! `tracing` under the [`AUDIT_TARGET`] target, so it can be routed or
//! filtered independently of ordinary service logs
//! (`RUST_LOG=pipeline_serve::audit=info`). Records are never persisted.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::{info, warn};

use crate::pipeline::NodeParameters;

pub const AUDIT_TARGET: &str = "pipeline_serve::audit";

/// One pipeline run, successful or not.
#[derive(Debug, Serialize)]
pub struct RunLogRecord<'a> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub pipeline: &'a str,
    pub started_at: DateTime<Utc>,
    /// Elapsed seconds, two decimals.
    pub time: String,
    pub data: &'a Map<String, Value>,
    pub parameters: &'a NodeParameters,
    pub debug: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<&'a str>,
}

/// One pipeline warm-up.
#[derive(Debug, Serialize)]
pub struct WarmUpRecord<'a> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub pipeline: &'a str,
    pub time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<&'a str>,
}

pub fn format_seconds(elapsed: Duration) -> String {
    format!("{:.2}", elapsed.as_secs_f64())
}

impl RunLogRecord<'_> {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| format!("{{\"type\":\"run\",\"encode_error\":\"{}\"}}", e))
    }

    pub fn emit(&self) {
        let line = self.to_json();
        if self.error.is_some() {
            warn!(target: AUDIT_TARGET, pipeline = self.pipeline, record = %line, "pipeline run failed");
        } else {
            info!(target: AUDIT_TARGET, pipeline = self.pipeline, record = %line, "pipeline run");
        }
    }
}

impl WarmUpRecord<'_> {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| format!("{{\"type\":\"warmup\",\"encode_error\":\"{}\"}}", e))
    }

    pub fn emit(&self) {
        let line = self.to_json();
        if self.error.is_some() {
            warn!(target: AUDIT_TARGET, pipeline = self.pipeline, record = %line, "pipeline warm-up failed");
        } else {
            info!(target: AUDIT_TARGET, pipeline = self.pipeline, record = %line, "pipeline warm-up");
        }
    }
}
