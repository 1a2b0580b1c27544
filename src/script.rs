//! Lua-scripted pipelines, the engine bundled with the service.
//!
//! A scripted pipeline is declared in the definitions file and backed by a
//! `.lua` script that defines a global `pipeline` table:
//!
//! ```lua
//! pipeline = {}
//!
//! function pipeline.warm_up()
//!     log.info("loading lookup tables")
//! end
//!
//! function pipeline.run(data, parameters, debug)
//!     local query = data.retriever and data.retriever.query or ""
//!     return { retriever = { documents = {}, query = query } }
//! end
//! ```
//!
//! `pipeline.run` is required, `pipeline.warm_up` is optional. The script
//! source is read once when the registry loads. Warm-up compiles the
//! script in a throwaway VM and calls `pipeline.warm_up` exactly once; each
//! run then executes in a fresh VM on a blocking thread, bounded by the
//! definition's `timeout`.
//!
//! # JSON in Lua
//!
//! `data`, `parameters` and the returned value cross the boundary as plain
//! Lua tables. JSON `null` becomes `nil`, so null members disappear. Lua
//! has no separate empty array: a table with no array part comes back as an
//! object, so an empty JSON array returned by a script arrives as `{}`.
//! Scripts that must return an empty list should return a count alongside
//! it, as the bundled `indexing.lua` does.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use mlua::prelude::*;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::OnceCell;

use crate::lua_runtime::{json_value_to_lua, lua_value_to_json, new_vm};
use crate::pipeline::{NodeParameters, Pipeline};

/// One `[pipelines.<name>]` entry of the definitions file.
#[derive(Debug, Deserialize, Clone)]
pub struct PipelineDefinition {
    /// Script path, relative to the definitions file.
    pub script: PathBuf,
    /// Node names of the pipeline graph, in graph order.
    pub nodes: Vec<String>,
    /// Maximum execution time of a single run or warm-up, in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Free-form metadata served by `GET /pipelines`.
    #[serde(default)]
    pub metadata: toml::Table,
}

fn default_timeout() -> u64 {
    30
}

/// A [`Pipeline`] backed by a Lua script.
pub struct ScriptPipeline {
    name: String,
    script_path: PathBuf,
    script_source: String,
    nodes: Vec<String>,
    metadata: Value,
    timeout: Duration,
    warmed: OnceCell<()>,
}

impl ScriptPipeline {
    /// Build a pipeline from its definition, reading the script source.
    ///
    /// `base_dir` is the directory relative script paths are resolved against.
    pub fn from_definition(name: &str, def: &PipelineDefinition, base_dir: &Path) -> Result<Self> {
        if def.nodes.is_empty() {
            bail!("pipeline '{}' declares no nodes", name);
        }
        let mut seen = std::collections::HashSet::new();
        for node in &def.nodes {
            if !seen.insert(node.as_str()) {
                bail!("pipeline '{}' declares node '{}' twice", name, node);
            }
        }
        if def.timeout == 0 {
            bail!("pipeline '{}': timeout must be > 0", name);
        }

        let script_path = if def.script.is_absolute() {
            def.script.clone()
        } else {
            base_dir.join(&def.script)
        };
        let script_source = std::fs::read_to_string(&script_path)
            .with_context(|| format!("Failed to read pipeline script: {}", script_path.display()))?;

        Ok(Self {
            name: name.to_string(),
            script_path,
            script_source,
            nodes: def.nodes.clone(),
            metadata: toml_table_to_json(&def.metadata),
            timeout: Duration::from_secs(def.timeout),
            warmed: OnceCell::new(),
        })
    }

    pub fn is_warm(&self) -> bool {
        self.warmed.initialized()
    }

    fn job(&self) -> ScriptJob {
        ScriptJob {
            name: self.name.clone(),
            script_path: self.script_path.clone(),
            script_source: self.script_source.clone(),
            timeout: self.timeout,
        }
    }
}

#[async_trait]
impl Pipeline for ScriptPipeline {
    fn metadata(&self) -> Value {
        self.metadata.clone()
    }

    fn nodes(&self) -> Vec<String> {
        self.nodes.clone()
    }

    async fn warm_up(&self) -> Result<()> {
        self.warmed
            .get_or_try_init(|| async {
                let job = self.job();
                tokio::task::spawn_blocking(move || job.warm_up())
                    .await
                    .context("Lua warm-up task panicked")?
            })
            .await?;
        Ok(())
    }

    async fn run(
        &self,
        data: Map<String, Value>,
        parameters: NodeParameters,
        debug: bool,
    ) -> Result<Value> {
        self.warm_up().await?;

        let job = self.job();
        tokio::task::spawn_blocking(move || job.run(data, parameters, debug))
            .await
            .context("Lua pipeline task panicked")?
    }
}

/// Owned copy of everything a blocking Lua call needs.
struct ScriptJob {
    name: String,
    script_path: PathBuf,
    script_source: String,
    timeout: Duration,
}

impl ScriptJob {
    fn load(&self) -> Result<(Lua, LuaTable)> {
        let lua = new_vm(&self.name, self.timeout)?;
        lua.load(&self.script_source)
            .set_name(self.script_path.to_string_lossy())
            .exec()
            .map_err(|e| {
                anyhow::anyhow!(
                    "Failed to execute pipeline script {}: {}",
                    self.script_path.display(),
                    e
                )
            })?;

        let table: LuaTable = lua
            .globals()
            .get::<LuaTable>("pipeline")
            .map_err(|e| anyhow::anyhow!("Script must define a global 'pipeline' table: {}", e))?;

        Ok((lua, table))
    }

    fn warm_up(&self) -> Result<()> {
        let (_lua, table) = self.load()?;

        table
            .get::<LuaFunction>("run")
            .map_err(|e| anyhow::anyhow!("pipeline.run function not defined: {}", e))?;

        if let Some(warm_up) = table.get::<Option<LuaFunction>>("warm_up")? {
            warm_up.call::<()>(()).map_err(|e| {
                anyhow::anyhow!(
                    "pipeline.warm_up() failed in '{}': {}",
                    self.script_path.display(),
                    e
                )
            })?;
        }
        Ok(())
    }

    fn run(&self, data: Map<String, Value>, parameters: NodeParameters, debug: bool) -> Result<Value> {
        let (lua, table) = self.load()?;

        let run: LuaFunction = table
            .get::<LuaFunction>("run")
            .map_err(|e| anyhow::anyhow!("pipeline.run function not defined: {}", e))?;

        let data_lua = json_value_to_lua(&lua, &Value::Object(data))?;
        let parameters_lua = json_value_to_lua(&lua, &serde_json::to_value(parameters)?)?;

        let result: LuaValue = run
            .call::<LuaValue>((data_lua, parameters_lua, debug))
            .map_err(|e| {
                anyhow::anyhow!(
                    "pipeline.run() failed in '{}': {}",
                    self.script_path.display(),
                    e
                )
            })?;

        lua_value_to_json(result)
            .map_err(|e| anyhow::anyhow!("Failed to convert pipeline result to JSON: {}", e))
    }
}

/// Convert TOML metadata to JSON. Datetimes become RFC 3339 strings.
fn toml_table_to_json(table: &toml::Table) -> Value {
    Value::Object(
        table
            .iter()
            .map(|(k, v)| (k.clone(), toml_value_to_json(v)))
            .collect(),
    )
}

fn toml_value_to_json(value: &toml::Value) -> Value {
    match value {
        toml::Value::String(s) => Value::String(s.clone()),
        toml::Value::Integer(i) => Value::from(*i),
        toml::Value::Float(f) => serde_json::Number::from_f64(*f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        toml::Value::Boolean(b) => Value::Bool(*b),
        toml::Value::Datetime(dt) => Value::String(dt.to_string()),
        toml::Value::Array(items) => Value::Array(items.iter().map(toml_value_to_json).collect()),
        toml::Value::Table(t) => toml_table_to_json(t),
    }
}
