//! Runtime configuration for model-host.
//!
//! Configuration is loaded from a JSON file or constructed programmatically.
//! Search locations, validation thresholds, the tier ladder and the fault
//! containment mode all live here.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::artifact::validator::ValidationConfig;
use crate::inference::llama_ffi::LoadParams;
use crate::loader::isolation::WorkerCommand;
use crate::loader::resilient::Containment;
use crate::loader::tiers::{default_tiers, LoadTier};

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "model-host", about = "Handle registry and resilient loader for GGUF models")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON.
    #[arg(long)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Serve the HTTP API.
    Serve {
        /// HTTP listen address (overrides the config file).
        #[arg(long)]
        listen: Option<String>,
    },

    /// Locate a model and print its header without loading it.
    Probe {
        model: PathBuf,

        /// Extra candidate paths, probed in order after MODEL.
        #[arg(short, long = "search-path")]
        search_paths: Vec<PathBuf>,
    },

    /// Load a model through the tier ladder, report the result, release it.
    Load {
        model: PathBuf,

        #[arg(short, long = "search-path")]
        search_paths: Vec<PathBuf>,
    },

    /// List GGUF files in the models directory.
    Models,

    /// Run one isolated load attempt (used by subprocess containment).
    #[command(hide = true)]
    Worker {
        #[arg(long)]
        model: PathBuf,

        /// LoadParams as JSON.
        #[arg(long)]
        params: String,
    },
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server configuration.
    pub server: ServerConfig,

    /// Where models live.
    pub storage: StorageConfig,

    /// Artifact validation thresholds.
    pub validation: ValidationConfig,

    /// Tier ladder and containment.
    pub loader: LoaderConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g. "127.0.0.1:8080").
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8080".to_string(),
        }
    }
}

/// Model storage locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directories searched (in order) for the requested file name, after
    /// the caller's own search roots.
    pub search_dirs: Vec<PathBuf>,

    /// Download target and source for the available-model listing.
    pub models_dir: PathBuf,

    /// Android application id. When set, the app's internal and external
    /// storage directories are searched too.
    pub app_id: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            search_dirs: vec![PathBuf::from("models")],
            models_dir: PathBuf::from("models"),
            app_id: None,
        }
    }
}

impl StorageConfig {
    /// Configured directories followed by the platform storage directories.
    pub fn search_dirs(&self) -> Vec<PathBuf> {
        let mut dirs = self.search_dirs.clone();
        if let Some(app_id) = &self.app_id {
            dirs.extend(android_storage_dirs(app_id));
        }
        dirs
    }
}

/// Internal and external storage directories of an Android app, in the
/// order the platform plugin probes them.
pub fn android_storage_dirs(app_id: &str) -> Vec<PathBuf> {
    let internal = PathBuf::from(format!("/data/data/{app_id}/files"));
    let external = PathBuf::from(format!("/storage/emulated/0/Android/data/{app_id}/files"));
    vec![
        internal.clone(),
        internal.join("Documents"),
        external.clone(),
        external.join("Documents"),
        PathBuf::from("/storage/emulated/0/Documents"),
        PathBuf::from("/storage/emulated/0/Download"),
    ]
}

/// Where load attempts run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainmentMode {
    #[default]
    InProcess,
    Subprocess,
}

/// Fault containment settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainmentConfig {
    pub mode: ContainmentMode,

    /// Worker executable. Required in subprocess mode; the `model-host`
    /// binary fills in its own `worker` subcommand when unset.
    pub worker_program: Option<PathBuf>,

    /// Arguments placed before the worker protocol arguments.
    pub worker_args: Vec<String>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContainmentError {
    #[error("subprocess containment requires loader.containment.worker_program")]
    MissingWorker,
}

impl ContainmentConfig {
    /// Resolve into the loader's [`Containment`].
    pub fn resolve(&self) -> Result<Containment, ContainmentError> {
        match self.mode {
            ContainmentMode::InProcess => Ok(Containment::InProcess),
            ContainmentMode::Subprocess => {
                let program = self.worker_program.clone().ok_or(ContainmentError::MissingWorker)?;
                Ok(Containment::Subprocess(WorkerCommand::new(program, self.worker_args.clone())))
            }
        }
    }

    /// Use `worker` (program and arguments) unless a worker program is configured.
    pub fn default_worker(&mut self, worker: WorkerCommand) {
        if self.worker_program.is_none() {
            self.worker_program = Some(worker.program);
            self.worker_args = worker.args;
        }
    }
}

/// Loader settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Parameters every tier starts from.
    pub baseline: LoadParams,

    /// Tiers, most capable first.
    pub tiers: Vec<LoadTier>,

    pub containment: ContainmentConfig,

    /// Most contexts alive at once. Unlimited when unset.
    pub max_contexts: Option<usize>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            baseline: LoadParams::default(),
            tiers: default_tiers(),
            containment: ContainmentConfig::default(),
            max_contexts: None,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }
}
