//! # pipeline-serve CLI
//!
//! Serves the file store and pipeline API over HTTP, and exposes the same
//! operations offline for scripting and debugging.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `pipeline-serve serve` | Start the HTTP server |
//! | `pipeline-serve pipelines list` | List pipelines and their nodes |
//! | `pipeline-serve pipelines warmup [name]` | Warm up one or all pipelines |
//! | `pipeline-serve pipelines run <name>` | Run a pipeline and print the result |
//! | `pipeline-serve files list [path]` | List a directory or print a file |
//! | `pipeline-serve files upload <local>` | Copy a local file into the store |
//!
//! ## Examples
//!
//! ```bash
//! pipeline-serve serve --config ./config/pipeline-serve.toml
//! pipeline-serve pipelines run indexing --data '{"text": "some text"}' --debug
//! pipeline-serve files upload ./report.pdf --dest reports/2024/report.pdf
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use pipeline_serve::{commands, config, logging, server};

/// pipeline-serve: file storage and named pipeline execution over HTTP.
#[derive(Parser)]
#[command(name = "pipeline-serve", version)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/pipeline-serve.toml`. Built-in defaults are
    /// used when the file does not exist. `PIPELINE_SERVE_*` environment
    /// variables override file values.
    #[arg(long, global = true, default_value = "./config/pipeline-serve.toml")]
    config: PathBuf,

    /// Log at debug level (ignored when `RUST_LOG` is set).
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server.
    ///
    /// Binds to `[server].bind` and serves until Ctrl-C.
    Serve,

    /// Inspect, warm up and run pipelines.
    Pipelines {
        #[command(subcommand)]
        action: PipelineAction,
    },

    /// Browse and fill the storage root.
    Files {
        #[command(subcommand)]
        action: FileAction,
    },
}

#[derive(Subcommand)]
enum PipelineAction {
    /// List pipelines and their nodes.
    List,
    /// Warm up one pipeline, or every pipeline when no name is given.
    Warmup {
        name: Option<String>,
    },
    /// Run a pipeline once and print its JSON result.
    Run {
        name: String,
        /// Input data as a JSON object.
        #[arg(long)]
        data: Option<String>,
        /// Per-node parameters as a JSON object keyed by node name.
        #[arg(long)]
        parameters: Option<String>,
        /// Ask the pipeline for debug output.
        #[arg(long)]
        debug: bool,
    },
}

#[derive(Subcommand)]
enum FileAction {
    /// List a directory, or write a file to stdout.
    List {
        /// Path relative to the storage root.
        path: Option<String>,
    },
    /// Copy a local file into the storage root.
    Upload {
        local: PathBuf,
        /// Destination relative to the storage root. Defaults to the file name.
        #[arg(long)]
        dest: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.verbose)?;

    let cfg = config::load_effective_config(&cli.config)?;

    match cli.command {
        Commands::Serve => server::run_server(&cfg).await?,
        Commands::Pipelines { action } => match action {
            PipelineAction::List => commands::list_pipelines(&cfg)?,
            PipelineAction::Warmup { name } => commands::warm_up(&cfg, name.as_deref()).await?,
            PipelineAction::Run {
                name,
                data,
                parameters,
                debug,
            } => {
                commands::run(&cfg, &name, data.as_deref(), parameters.as_deref(), debug).await?
            }
        },
        Commands::Files { action } => match action {
            FileAction::List { path } => commands::list_files(&cfg, path.as_deref()).await?,
            FileAction::Upload { local, dest } => {
                commands::upload_file(&cfg, &local, dest.as_deref()).await?
            }
        },
    }

    Ok(())
}
