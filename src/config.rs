//! Service configuration.
//!
//! Read from a TOML file (default `./config/pipeline-serve.toml`). Every key
//! has a default, so the file may be partial or absent. A few settings can be
//! overridden from the environment, which wins over the file:
//!
//! | Variable | Setting | Default |
//! |----------|---------|---------|
//! | `PIPELINE_SERVE_FILE_UPLOAD_PATH` | `files.root` | `./files` |
//! | `PIPELINE_SERVE_PIPELINES_PATH` | `pipelines.definitions` | `./pipelines/pipelines.toml` |
//! | `PIPELINE_SERVE_BIND` | `server.bind` | `127.0.0.1:8000` |
//!
//! ```toml
//! [server]
//! bind = "0.0.0.0:8000"
//!
//! [files]
//! root = "/var/lib/pipeline-serve/files"
//! max_upload_mb = 256
//!
//! [pipelines]
//! definitions = "/etc/pipeline-serve/pipelines.toml"
//! eager_load = true
//! warm_up_on_start = true
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const ENV_FILE_UPLOAD_PATH: &str = "PIPELINE_SERVE_FILE_UPLOAD_PATH";
pub const ENV_PIPELINES_PATH: &str = "PIPELINE_SERVE_PIPELINES_PATH";
pub const ENV_BIND: &str = "PIPELINE_SERVE_BIND";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub files: FilesConfig,
    #[serde(default)]
    pub pipelines: PipelinesConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct FilesConfig {
    /// Storage root for uploaded files.
    #[serde(default = "default_files_root")]
    pub root: PathBuf,
    /// Largest accepted upload request body, in MiB.
    #[serde(default = "default_max_upload_mb")]
    pub max_upload_mb: usize,
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            root: default_files_root(),
            max_upload_mb: default_max_upload_mb(),
        }
    }
}

fn default_files_root() -> PathBuf {
    PathBuf::from("./files")
}
fn default_max_upload_mb() -> usize {
    1024
}

impl FilesConfig {
    pub fn max_upload_bytes(&self) -> usize {
        self.max_upload_mb.saturating_mul(1024 * 1024)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelinesConfig {
    /// TOML file declaring the pipelines.
    #[serde(default = "default_definitions")]
    pub definitions: PathBuf,
    /// Load the registry at startup instead of on the first request.
    #[serde(default = "default_eager_load")]
    pub eager_load: bool,
    /// Warm every pipeline up at startup.
    #[serde(default)]
    pub warm_up_on_start: bool,
}

impl Default for PipelinesConfig {
    fn default() -> Self {
        Self {
            definitions: default_definitions(),
            eager_load: default_eager_load(),
            warm_up_on_start: false,
        }
    }
}

fn default_definitions() -> PathBuf {
    PathBuf::from("./pipelines/pipelines.toml")
}
fn default_eager_load() -> bool {
    true
}

impl Config {
    /// All defaults, no file involved.
    pub fn minimal() -> Self {
        Self::default()
    }

    /// Apply overrides from `lookup` (normally [`std::env::var`]).
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(root) = non_empty(ENV_FILE_UPLOAD_PATH) {
            self.files.root = PathBuf::from(root);
        }
        if let Some(definitions) = non_empty(ENV_PIPELINES_PATH) {
            self.pipelines.definitions = PathBuf::from(definitions);
        }
        if let Some(bind) = non_empty(ENV_BIND) {
            self.server.bind = bind;
        }
    }
}

/// Parse and validate the config file at `path`.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

/// Load `path` if it exists (defaults otherwise), then apply environment
/// overrides and validate the result.
pub fn load_effective_config(path: &Path) -> Result<Config> {
    let mut config = if path.exists() {
        load_config(path)?
    } else {
        Config::minimal()
    };
    config.apply_overrides(|key| std::env::var(key).ok());
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.server.bind.trim().is_empty() {
        anyhow::bail!("server.bind must not be empty");
    }
    if config.files.root.as_os_str().is_empty() {
        anyhow::bail!("files.root must not be empty");
    }
    if config.files.max_upload_mb == 0 {
        anyhow::bail!("files.max_upload_mb must be > 0");
    }
    if config.pipelines.definitions.as_os_str().is_empty() {
        anyhow::bail!("pipelines.definitions must not be empty");
    }
    Ok(())
}
