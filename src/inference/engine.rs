//! Engine seam and the registry-owned native context.
//!
//! The inference engine itself (tokenization, sampling, generation) is an
//! external collaborator. This crate only needs two things from it: a way to
//! load a model with a given parameter set (`load_model -> bool`), and a
//! handful of operations callers run through a handle (`format_chat`).

use std::path::{Path, PathBuf};
use std::time::Instant;

use thiserror::Error;
use tracing::debug;

use crate::artifact::validator::ArtifactHeader;
use crate::inference::llama_ffi::LoadParams;
use crate::loader::tiers::SelectedTier;

/// Recoverable engine failure.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Model load error: {0}")]
    Load(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("No model loaded")]
    NotLoaded,

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// A native engine instance.
///
/// `load_model` has three distinct failure shapes: `Ok(false)` (soft
/// failure), `Err(_)` (recoverable fault), and a panic or native crash
/// (fatal fault, contained by the loader).
pub trait NativeEngine: Send {
    fn load_model(&mut self, path: &Path, params: &LoadParams) -> Result<bool, EngineError>;

    fn format_chat(&self, messages: &str, chat_template: &str) -> Result<String, EngineError>;

    /// Short human-readable description of the loaded model.
    fn description(&self) -> String {
        String::from("native engine")
    }
}

/// Creates a fresh engine per load attempt.
pub trait EngineFactory: Send + Sync {
    fn create(&self) -> Box<dyn NativeEngine>;
}

/// One loaded model and its execution state.
///
/// Owned exclusively by the handle registry. Dropping it releases the engine.
pub struct NativeContext {
    engine: Box<dyn NativeEngine>,
    model_path: PathBuf,
    tier: SelectedTier,
    header: Option<ArtifactHeader>,
    loaded_at: Instant,
}

impl NativeContext {
    pub fn new(
        engine: Box<dyn NativeEngine>,
        model_path: PathBuf,
        tier: SelectedTier,
        header: Option<ArtifactHeader>,
    ) -> Self {
        Self {
            engine,
            model_path,
            tier,
            header,
            loaded_at: Instant::now(),
        }
    }

    pub fn engine(&self) -> &dyn NativeEngine {
        self.engine.as_ref()
    }

    pub fn engine_mut(&mut self) -> &mut dyn NativeEngine {
        self.engine.as_mut()
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    /// The tier this context was loaded with.
    pub fn tier(&self) -> &SelectedTier {
        &self.tier
    }

    pub fn params(&self) -> &LoadParams {
        &self.tier.params
    }

    pub fn header(&self) -> Option<&ArtifactHeader> {
        self.header.as_ref()
    }

    pub fn loaded_at(&self) -> Instant {
        self.loaded_at
    }
}

impl Drop for NativeContext {
    fn drop(&mut self) {
        debug!(
            path = %self.model_path.display(),
            tier = self.tier.index,
            alive_secs = self.loaded_at.elapsed().as_secs(),
            "Native context destroyed"
        );
    }
}

impl std::fmt::Debug for NativeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeContext")
            .field("model_path", &self.model_path)
            .field("tier", &self.tier)
            .field("header", &self.header)
            .finish_non_exhaustive()
    }
}
