//! llama.cpp-facing types.
//!
//! [`LoadParams`] mirrors the subset of llama.cpp's `common_params` that the
//! loader varies between tiers. [`LlamaEngine`] is the stand-in engine used
//! when no native library is linked: it honours the same `load_model -> bool`
//! contract so the registry and loader can run end to end.

use std::fs::File;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::artifact::validator::GGUF_MAGIC;
use crate::inference::engine::{EngineError, EngineFactory, NativeEngine};

/// Load-time parameters (mirrors llama.cpp `common_params`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadParams {
    /// Context size in tokens.
    pub n_ctx: u32,

    /// Batch size for prompt processing.
    pub n_batch: u32,

    /// Number of threads for computation.
    pub n_threads: u32,

    /// Number of layers to offload to the GPU.
    pub n_gpu_layers: i32,

    /// Memory-map the model file.
    pub use_mmap: bool,

    /// Lock model memory.
    pub use_mlock: bool,

    /// Number of parallel sequences.
    pub n_parallel: u32,

    /// Use flash attention.
    pub flash_attn: bool,
}

impl Default for LoadParams {
    fn default() -> Self {
        Self {
            n_ctx: 2048,
            n_batch: 512,
            n_threads: 4,
            n_gpu_layers: 0,
            use_mmap: true,
            use_mlock: false,
            n_parallel: 1,
            flash_attn: false,
        }
    }
}

/// One chat message as passed through `format_chat`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Stub engine.
///
/// In a real build this wraps `llama_cap_context` from the native library.
#[derive(Debug, Default)]
pub struct LlamaEngine {
    model_path: Option<PathBuf>,
    params: Option<LoadParams>,
}

impl LlamaEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn model_path(&self) -> Option<&PathBuf> {
        self.model_path.as_ref()
    }
}

impl NativeEngine for LlamaEngine {
    fn load_model(&mut self, path: &std::path::Path, params: &LoadParams) -> Result<bool, EngineError> {
        debug!(
            path = %path.display(),
            n_ctx = params.n_ctx,
            n_batch = params.n_batch,
            n_gpu_layers = params.n_gpu_layers,
            use_mmap = params.use_mmap,
            "Loading model"
        );

        if params.n_ctx == 0 || params.n_batch == 0 {
            return Ok(false);
        }

        // Stub: the native loader rejects anything without a GGUF tag.
        let mut file = File::open(path).map_err(|e| EngineError::Io(e.to_string()))?;
        let mut magic = [0u8; 4];
        if std::io::Read::read_exact(&mut file, &mut magic).is_err() || magic != GGUF_MAGIC {
            return Ok(false);
        }

        self.model_path = Some(path.to_path_buf());
        self.params = Some(params.clone());
        info!(path = %path.display(), n_ctx = params.n_ctx, "Model loaded");
        Ok(true)
    }

    fn format_chat(&self, messages: &str, chat_template: &str) -> Result<String, EngineError> {
        if self.model_path.is_none() {
            return Err(EngineError::NotLoaded);
        }

        let messages: Vec<ChatMessage> = serde_json::from_str(messages)
            .map_err(|e| EngineError::InvalidInput(format!("messages: {e}")))?;

        // Stub: only ChatML is rendered; a named template is accepted but ignored.
        if !chat_template.is_empty() && chat_template != "chatml" {
            debug!(chat_template, "Unknown chat template, using chatml");
        }

        let mut prompt = String::new();
        for message in &messages {
            prompt.push_str("<|im_start|>");
            prompt.push_str(&message.role);
            prompt.push('\n');
            prompt.push_str(&message.content);
            prompt.push_str("<|im_end|>\n");
        }
        prompt.push_str("<|im_start|>assistant\n");
        Ok(prompt)
    }

    fn description(&self) -> String {
        match &self.params {
            Some(params) => format!("llama (stub) n_ctx={} n_batch={}", params.n_ctx, params.n_batch),
            None => "llama (stub), not loaded".to_string(),
        }
    }
}

/// Factory for [`LlamaEngine`].
#[derive(Debug, Default, Clone, Copy)]
pub struct LlamaEngineFactory;

impl EngineFactory for LlamaEngineFactory {
    fn create(&self) -> Box<dyn NativeEngine> {
        Box::new(LlamaEngine::new())
    }
}
