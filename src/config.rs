//! Configuration management for the bridge.
//!
//! This module provides configuration handling through multiple sources:
//! 1. Default configuration (embedded in binary)
//! 2. System-wide configuration file (`/etc/loombridge/config.toml`)
//! 3. User-specified configuration file
//! 4. Environment variables (prefixed with `LOOMBRIDGE_`, sections split by `__`)
//! 5. Command-line arguments
//!
//! Configuration options are loaded in order of precedence, with later sources
//! overriding earlier ones.
//!
//! # Environment Variables
//!
//! - `LOOMBRIDGE_STORE__PATH` - Engine store directory
//! - `LOOMBRIDGE_STORE__PROJECT_PREFIX` - Fixed project name prefix
//! - `LOOMBRIDGE_ENGINE__PYTHON` - Interpreter used to launch engine tasks and servers
//! - `LOOMBRIDGE_ENGINE__SERVER_MODULE` - Module serving query and prediction requests
//! - `LOOMBRIDGE_RECONCILE__SEED` - Seed for ensemble reconciliation

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::constants::defaults;
use crate::error::Result;

/// Command-line arguments
#[derive(Debug, Default, Parser)]
#[clap(version, about)]
pub struct Args {
    /// Configuration file path
    #[clap(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Engine store directory
    #[clap(long, global = true)]
    pub store_path: Option<PathBuf>,

    /// Project name prefix (defaults to a timestamp)
    #[clap(long, global = true)]
    pub project_prefix: Option<String>,

    /// Python interpreter for engine tasks
    #[clap(long, global = true)]
    pub python: Option<String>,

    /// Seed for ensemble reconciliation
    #[clap(long, global = true)]
    pub seed: Option<u64>,
}

/// Bridge configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Engine store settings
    #[serde(default)]
    pub store: StoreSettings,
    /// Engine process settings
    #[serde(default)]
    pub engine: EngineSettings,
    /// Query defaults
    #[serde(default)]
    pub query: QuerySettings,
    /// Ensemble reconciliation settings
    #[serde(default)]
    pub reconcile: ReconcileSettings,
}

/// Where the engine keeps its projects
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    /// Root directory of engine projects
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
    /// Project name prefix; a timestamp is used when absent
    #[serde(default)]
    pub project_prefix: Option<String>,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            project_prefix: None,
        }
    }
}

/// How engine tasks are launched
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Interpreter binary
    #[serde(default = "default_python")]
    pub python: String,
    /// Module providing the ingest and infer tasks
    #[serde(default = "default_task_module")]
    pub task_module: String,
    /// Module serving query and prediction requests over stdio
    #[serde(default = "default_server_module")]
    pub server_module: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            python: default_python(),
            task_module: default_task_module(),
            server_module: default_server_module(),
        }
    }
}

/// Defaults for analytic queries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuerySettings {
    /// Draws for confidence-scored prediction
    #[serde(default = "default_predict_samples")]
    pub default_predict_samples: usize,
    /// Sample count for mutual information estimates
    #[serde(default = "default_mi_samples")]
    pub mutual_information_samples: usize,
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            default_predict_samples: default_predict_samples(),
            mutual_information_samples: default_mi_samples(),
        }
    }
}

/// Ensemble reconciliation settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReconcileSettings {
    /// Refinement passes after migration; `None` uses sqrt of the output count
    #[serde(default)]
    pub refine_passes: Option<usize>,
    /// Seed from which every member's random source is derived
    #[serde(default)]
    pub seed: u64,
    /// Worker threads for the member fan-out; `None` uses the global pool
    #[serde(default)]
    pub threads: Option<usize>,
}

impl BridgeConfig {
    /// Load configuration from all sources
    pub fn load(args: &Args) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::File::from_str(
                include_str!("../config/default.toml"),
                config::FileFormat::Toml,
            ))
            .add_source(config::File::with_name("/etc/loombridge/config.toml").required(false));

        if let Some(path) = &args.config {
            builder = builder.add_source(config::File::from(path.as_path()));
        }

        builder = builder.add_source(config::Environment::with_prefix("LOOMBRIDGE").separator("__"));

        let mut config: BridgeConfig = builder.build()?.try_deserialize()?;

        if let Some(path) = &args.store_path {
            config.store.path = path.clone();
        }
        if let Some(prefix) = &args.project_prefix {
            config.store.project_prefix = Some(prefix.clone());
        }
        if let Some(python) = &args.python {
            config.engine.python = python.clone();
        }
        if let Some(seed) = args.seed {
            config.reconcile.seed = seed;
        }

        Ok(config)
    }

    /// Configuration rooted at an explicit store directory, defaults elsewhere
    pub fn with_store(path: impl Into<PathBuf>) -> Self {
        Self {
            store: StoreSettings {
                path: path.into(),
                project_prefix: None,
            },
            ..Self::default()
        }
    }
}

fn default_store_path() -> PathBuf {
    PathBuf::from("loomstore")
}

fn default_python() -> String {
    "python".to_string()
}

fn default_task_module() -> String {
    "loom.tasks".to_string()
}

fn default_server_module() -> String {
    "loom.server".to_string()
}

fn default_predict_samples() -> usize {
    defaults::PREDICT_SAMPLES
}

fn default_mi_samples() -> usize {
    defaults::MUTUAL_INFORMATION_SAMPLES
}
