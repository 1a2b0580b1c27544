//! The pipeline engine contract.
//!
//! A [`Pipeline`] is an opaque, pre-built executable unit. The service never
//! looks inside one: it reads its metadata and node names, asks it to warm
//! up, and hands it request data to run. The bundled Lua engine lives in
//! [`crate::script`]; any other engine plugs in by implementing this trait
//! and registering the handle with a [`PipelineRegistry`](crate::registry::PipelineRegistry).
//!
//! # Example
//!
//! ```rust
//! use async_trait::async_trait;
//! use anyhow::Result;
//! use serde_json::{json, Map, Value};
//! use pipeline_serve::pipeline::{NodeParameters, Pipeline};
//!
//! pub struct Echo;
//!
//! #[async_trait]
//! impl Pipeline for Echo {
//!     fn metadata(&self) -> Value { json!({ "description": "echoes its input" }) }
//!     fn nodes(&self) -> Vec<String> { vec!["echo".to_string()] }
//!
//!     async fn warm_up(&self) -> Result<()> { Ok(()) }
//!
//!     async fn run(&self, data: Map<String, Value>, _parameters: NodeParameters, _debug: bool) -> Result<Value> {
//!         Ok(json!({ "echo": data }))
//!     }
//! }
//! ```

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Per-node parameter mapping: node name → parameter object.
pub type NodeParameters = BTreeMap<String, Map<String, Value>>;

#[async_trait]
pub trait Pipeline: Send + Sync {
    /// Free-form metadata served by `GET /pipelines`.
    fn metadata(&self) -> Value;

    /// Names of the nodes in this pipeline's graph.
    fn nodes(&self) -> Vec<String>;

    /// Whether `name` is a node of this pipeline.
    fn has_node(&self, name: &str) -> bool {
        self.nodes().iter().any(|n| n == name)
    }

    /// Pay initialization cost ahead of the first run.
    ///
    /// Must be idempotent: calling it repeatedly, or concurrently, has the
    /// same effect as calling it once.
    async fn warm_up(&self) -> Result<()>;

    /// Execute the pipeline.
    ///
    /// `data` maps node names to their inputs, `parameters` maps node names
    /// to per-node parameters. The returned value is sent to the client
    /// verbatim.
    async fn run(&self, data: Map<String, Value>, parameters: NodeParameters, debug: bool)
        -> Result<Value>;
}

/// The client-supplied part of a run request. The pipeline name comes from
/// the route.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default)]
    pub parameters: NodeParameters,
    #[serde(default)]
    pub debug: bool,
}
