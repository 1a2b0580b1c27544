//! # pipeline-serve
//!
//! An HTTP service for hierarchical file storage and named pipeline execution.
//!
//! Clients upload files into a single storage root, browse and download
//! them, list the available pipelines, warm them up, and run them with
//! per-node parameters. Every run is recorded as a structured audit line.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌────────────┐   ┌───────────────┐
//! │   HTTP   │──▶│ FileStore  │──▶│ storage root  │
//! │  (axum)  │   └────────────┘   └───────────────┘
//! │          │   ┌────────────┐   ┌───────────────┐
//! │   CLI    │──▶│  dispatch  │──▶│ LazyRegistry  │──▶ Pipeline (Lua)
//! └──────────┘   └────────────┘   └───────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`paths`] | Confine client paths to the storage root |
//! | [`files`] | Upload and list/download |
//! | [`pipeline`] | The pipeline engine contract |
//! | [`script`] | Lua-scripted pipelines |
//! | [`registry`] | Named pipelines, loaded once |
//! | [`dispatch`] | Validated, audited runs |
//! | [`ingest`] | Run a pipeline over a batch of uploaded files |
//! | [`audit`] | Run and warm-up log records |
//! | [`server`] | HTTP routes |
//! | [`config`] | TOML configuration |

pub mod audit;
pub mod commands;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod files;
pub mod ingest;
pub mod logging;
mod lua_runtime;
pub mod paths;
pub mod pipeline;
pub mod registry;
pub mod script;
pub mod server;

pub use error::{ServeError, ServeResult};
