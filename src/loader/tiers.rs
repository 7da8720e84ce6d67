//! Load tiers.
//!
//! Every tier starts from one baseline [`LoadParams`] and lists only the
//! fields it changes. Tiers are ordered from most capable to most
//! conservative; the loader walks them in order.

use serde::{Deserialize, Serialize};

use crate::inference::llama_ffi::LoadParams;

/// Fields a tier may override. `None` keeps the baseline value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n_ctx: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub n_batch: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub n_threads: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub n_gpu_layers: Option<i32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_mmap: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_mlock: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub n_parallel: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub flash_attn: Option<bool>,
}

/// One named configuration profile tried during loading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadTier {
    pub name: String,

    #[serde(flatten)]
    pub overrides: TierOverrides,
}

impl LoadTier {
    pub fn new(name: impl Into<String>, overrides: TierOverrides) -> Self {
        Self {
            name: name.into(),
            overrides,
        }
    }

    /// Full context size, batch size and mmap from the baseline.
    pub fn normal() -> Self {
        Self::new("normal", TierOverrides::default())
    }

    /// Minimal context and batch, no mmap, single sequence.
    pub fn ultra_conservative() -> Self {
        Self::new(
            "ultra-conservative",
            TierOverrides {
                n_ctx: Some(256),
                n_batch: Some(128),
                use_mmap: Some(false),
                n_parallel: Some(1),
                ..Default::default()
            },
        )
    }

    /// Apply this tier's overrides on top of `baseline`.
    pub fn resolve(&self, baseline: &LoadParams) -> LoadParams {
        let o = &self.overrides;
        LoadParams {
            n_ctx: o.n_ctx.unwrap_or(baseline.n_ctx),
            n_batch: o.n_batch.unwrap_or(baseline.n_batch),
            n_threads: o.n_threads.unwrap_or(baseline.n_threads),
            n_gpu_layers: o.n_gpu_layers.unwrap_or(baseline.n_gpu_layers),
            use_mmap: o.use_mmap.unwrap_or(baseline.use_mmap),
            use_mlock: o.use_mlock.unwrap_or(baseline.use_mlock),
            n_parallel: o.n_parallel.unwrap_or(baseline.n_parallel),
            flash_attn: o.flash_attn.unwrap_or(baseline.flash_attn),
        }
    }
}

impl std::fmt::Display for LoadTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// The default ladder: normal, then ultra-conservative.
pub fn default_tiers() -> Vec<LoadTier> {
    vec![LoadTier::normal(), LoadTier::ultra_conservative()]
}

/// The tier a successful load ended on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectedTier {
    /// Position in the ladder (0-based).
    pub index: usize,
    pub name: String,
    pub params: LoadParams,
}
