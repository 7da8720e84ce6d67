//! Model service: the operations boundary adapters call.
//!
//! `create_context` runs locator → validator → resilient loader → registry
//! and either returns a new handle or fails with the most specific cause;
//! a failed call never registers anything. Every other operation goes
//! through the registry by handle.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::artifact::locator::{join_file_name, locate};
use crate::artifact::validator::{read_header, ValidationVerdict, Validator};
use crate::config::{Config, StorageConfig};
use crate::inference::engine::{EngineError, EngineFactory, NativeContext};
use crate::loader::resilient::{LoadFailure, ResilientLoader};
use crate::loader::tiers::LoadTier;
use crate::metrics::ServiceMetrics;
use crate::registry::{HandleRegistry, ModelHandle, RegistryError};

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Model file not found: {} ({candidates} locations checked)", requested.display())]
    NotFound { requested: PathBuf, candidates: usize },

    #[error("Invalid model artifact {}: {verdict}", path.display())]
    InvalidArtifact {
        path: PathBuf,
        verdict: ValidationVerdict,
    },

    #[error(transparent)]
    LoadFailure(#[from] LoadFailure),

    #[error("Invalid context handle: {0}")]
    InvalidHandle(ModelHandle),

    #[error("Context limit reached ({limit} live)")]
    ContextLimit { limit: usize },

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServiceError {
    /// Stable machine-readable kind.
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceError::NotFound { .. } => "not_found",
            ServiceError::InvalidArtifact { .. } => "invalid_artifact",
            ServiceError::LoadFailure(_) => "load_failure",
            ServiceError::InvalidHandle(_) => "invalid_handle",
            ServiceError::ContextLimit { .. } => "context_limit",
            ServiceError::Engine(_) => "engine_error",
            ServiceError::InvalidRequest(_) => "invalid_request",
            ServiceError::Io(_) => "io_error",
        }
    }
}

impl From<RegistryError> for ServiceError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::InvalidHandle(handle) => ServiceError::InvalidHandle(handle),
            RegistryError::LimitReached { limit } => ServiceError::ContextLimit { limit },
        }
    }
}

/// Header facts for a located artifact, without loading it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactInfo {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub format_version: u32,
    pub description: String,
}

/// Summary of a live context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextInfo {
    pub handle: ModelHandle,
    pub model_path: PathBuf,
    pub tier_index: usize,
    pub tier_name: String,
    pub n_ctx: u32,
    pub n_batch: u32,
    pub use_mmap: bool,
    pub size_bytes: Option<u64>,
    pub format_version: Option<u32>,
    pub description: String,
    pub loaded_secs: u64,
}

/// A GGUF file found in the models directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailableModel {
    pub name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// Registry, loader and validator wired together.
pub struct ModelService {
    registry: HandleRegistry,
    loader: ResilientLoader,
    validator: Validator,
    storage: StorageConfig,
    tiers: Vec<LoadTier>,
    max_contexts: Option<usize>,
    metrics: ServiceMetrics,
}

impl ModelService {
    pub fn new(config: &Config, factory: Arc<dyn EngineFactory>) -> anyhow::Result<Self> {
        let containment = config.loader.containment.resolve()?;
        Ok(Self {
            registry: HandleRegistry::new(),
            loader: ResilientLoader::new(factory, config.loader.baseline.clone(), containment),
            validator: Validator::new(config.validation.clone()),
            storage: config.storage.clone(),
            tiers: config.loader.tiers.clone(),
            max_contexts: config.loader.max_contexts,
            metrics: ServiceMetrics::new()?,
        })
    }

    pub fn registry(&self) -> &HandleRegistry {
        &self.registry
    }

    pub fn metrics(&self) -> &ServiceMetrics {
        &self.metrics
    }

    /// Caller roots verbatim, then configured directories joined with the file name.
    fn search_roots(&self, requested: &Path, caller_roots: &[PathBuf]) -> Vec<PathBuf> {
        let mut roots = caller_roots.to_vec();
        if let Some(file_name) = requested.file_name() {
            roots.extend(join_file_name(Path::new(file_name), &self.storage.search_dirs()));
        }
        roots
    }

    fn locate(&self, requested: &Path, caller_roots: &[PathBuf]) -> Result<PathBuf, ServiceError> {
        let roots = self.search_roots(requested, caller_roots);
        locate(requested, &roots).ok_or_else(|| ServiceError::NotFound {
            requested: requested.to_path_buf(),
            candidates: roots.len() + 1,
        })
    }

    /// Locate, validate, load and register a model.
    ///
    /// `tiers` overrides the configured ladder for this call.
    pub fn create_context(
        &self,
        requested: &Path,
        search_roots: &[PathBuf],
        tiers: Option<&[LoadTier]>,
    ) -> Result<ModelHandle, ServiceError> {
        let result = self.try_create_context(requested, search_roots, tiers);
        if let Err(e) = &result {
            self.metrics.create_failures.with_label_values(&[e.kind()]).inc();
            warn!(requested = %requested.display(), kind = e.kind(), "Context creation failed: {e}");
        }
        result
    }

    fn try_create_context(
        &self,
        requested: &Path,
        search_roots: &[PathBuf],
        tiers: Option<&[LoadTier]>,
    ) -> Result<ModelHandle, ServiceError> {
        if let Some(limit) = self.max_contexts {
            if self.registry.len() >= limit {
                return Err(ServiceError::ContextLimit { limit });
            }
        }

        let path = self.locate(requested, search_roots)?;

        let verdict = self.validator.validate(&path);
        if self.validator.blocks(verdict) {
            return Err(ServiceError::InvalidArtifact { path, verdict });
        }
        if verdict == ValidationVerdict::SuspiciousVersion {
            warn!(path = %path.display(), "Proceeding with suspicious format version");
        }
        let header = read_header(&path).ok();

        let tiers = tiers.unwrap_or(self.tiers.as_slice());
        let loaded = self.loader.load(&path, tiers);

        let attempts = match &loaded {
            Ok(model) => &model.attempts,
            Err(failure) => &failure.attempts,
        };
        for attempt in attempts {
            self.metrics
                .load_attempts
                .with_label_values(&[attempt.outcome.label()])
                .inc();
        }

        let loaded = loaded?;
        let context = NativeContext::new(loaded.engine, path, loaded.tier, header);
        // Checked again under the registry lock: a concurrent create may
        // have filled the last slot while this one was loading.
        let handle = match self.max_contexts {
            Some(limit) => self.registry.register_within(context, limit)?,
            None => self.registry.register(context),
        };

        self.metrics.contexts_created.inc();
        self.metrics.live_contexts.inc();
        Ok(handle)
    }

    /// Release `handle`. Unknown handles are ignored.
    pub fn release_context(&self, handle: ModelHandle) {
        if self.registry.release(handle) {
            self.metrics.contexts_released.inc();
            self.metrics.live_contexts.dec();
        }
    }

    /// Release every live context.
    pub fn release_all(&self) -> usize {
        let count = self.registry.release_all();
        self.metrics.contexts_released.inc_by(count as u64);
        self.metrics.live_contexts.sub(count as i64);
        count
    }

    /// Run `op` against the context behind `handle`.
    pub fn with_context<R>(
        &self,
        handle: ModelHandle,
        op: impl FnOnce(&mut NativeContext) -> R,
    ) -> Result<R, ServiceError> {
        let lease = self.registry.lookup(handle)?;
        Ok(lease.with(op))
    }

    /// Render a chat prompt with the engine behind `handle`.
    pub fn format_chat(
        &self,
        handle: ModelHandle,
        messages: &str,
        chat_template: &str,
    ) -> Result<String, ServiceError> {
        let prompt = self.with_context(handle, |ctx| ctx.engine().format_chat(messages, chat_template))??;
        Ok(prompt)
    }

    pub fn context_info(&self, handle: ModelHandle) -> Result<ContextInfo, ServiceError> {
        self.with_context(handle, |ctx| describe(handle, ctx))
    }

    /// Every live context, in handle order.
    pub fn list_contexts(&self) -> Vec<ContextInfo> {
        self.registry
            .handles()
            .into_iter()
            // A handle released in between is simply skipped.
            .filter_map(|handle| self.context_info(handle).ok())
            .collect()
    }

    /// Locate an artifact and read its header. Loads nothing, allocates no handle.
    pub fn probe_artifact(
        &self,
        requested: &Path,
        search_roots: &[PathBuf],
    ) -> Result<ArtifactInfo, ServiceError> {
        let path = self.locate(requested, search_roots)?;

        let header = match read_header(&path) {
            Ok(header) => header,
            Err(e) => {
                warn!("{e}");
                return Err(ServiceError::InvalidArtifact {
                    path,
                    verdict: ValidationVerdict::UnreadableHeader,
                });
            }
        };

        if !header.magic_ok {
            return Err(ServiceError::InvalidArtifact {
                path,
                verdict: ValidationVerdict::BadMagic,
            });
        }

        info!(
            path = %path.display(),
            size = header.size_bytes,
            version = header.version,
            "Model info retrieved"
        );

        Ok(ArtifactInfo {
            path,
            size_bytes: header.size_bytes,
            format_version: header.version,
            description: format!("GGUF Model (v{})", header.version),
        })
    }

    /// `.gguf` files in the models directory, sorted by name.
    pub fn available_models(&self) -> Result<Vec<AvailableModel>, ServiceError> {
        let entries = match std::fs::read_dir(&self.storage.models_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut models = Vec::new();
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let metadata = entry.metadata()?;
            let is_gguf = path.extension().is_some_and(|ext| ext == "gguf");
            if !metadata.is_file() || !is_gguf {
                continue;
            }
            models.push(AvailableModel {
                name: entry.file_name().to_string_lossy().into_owned(),
                path,
                size_bytes: metadata.len(),
            });
        }

        models.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(models)
    }

    /// Create the models directory and return where `filename` should be written.
    pub fn prepare_download_path(&self, filename: &str) -> Result<PathBuf, ServiceError> {
        let name = Path::new(filename);
        let plain = name.components().count() == 1
            && name.file_name().is_some_and(|n| n == name.as_os_str());
        if filename.is_empty() || !plain {
            return Err(ServiceError::InvalidRequest(format!(
                "download filename must be a plain file name: {filename:?}"
            )));
        }

        std::fs::create_dir_all(&self.storage.models_dir)?;
        let path = self.storage.models_dir.join(name);
        info!(path = %path.display(), "Download path prepared");
        Ok(path)
    }
}

fn describe(handle: ModelHandle, ctx: &NativeContext) -> ContextInfo {
    ContextInfo {
        handle,
        model_path: ctx.model_path().to_path_buf(),
        tier_index: ctx.tier().index,
        tier_name: ctx.tier().name.clone(),
        n_ctx: ctx.params().n_ctx,
        n_batch: ctx.params().n_batch,
        use_mmap: ctx.params().use_mmap,
        size_bytes: ctx.header().map(|h| h.size_bytes),
        format_version: ctx.header().map(|h| h.version),
        description: ctx.engine().description(),
        loaded_secs: ctx.loaded_at().elapsed().as_secs(),
    }
}
