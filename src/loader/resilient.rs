//! Resilient loader: walks the tier ladder until one attempt succeeds.
//!
//! Each attempt gets a fresh engine from the factory. An attempt ends in one
//! of four ways:
//! 1. `load_model` returns `true`: done, the engine becomes the context
//! 2. `load_model` returns `false`: soft failure, next tier
//! 3. `load_model` returns an error: logged, next tier
//! 4. the attempt faults (panic in-process, crash in the worker): logged as
//!    "fault contained" with path and tier, next tier
//!
//! Exhausting the ladder is a [`LoadFailure`]. The loader never retries a
//! ladder on its own.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::inference::engine::{EngineFactory, NativeEngine};
use crate::inference::llama_ffi::LoadParams;
use crate::loader::containment::contain;
use crate::loader::isolation::{preflight, WorkerCommand, WorkerVerdict};
use crate::loader::tiers::{LoadTier, SelectedTier};

/// How a single tier attempt ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "cause", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Loaded,
    SoftFailure,
    Error(String),
    FaultContained(String),
}

impl AttemptOutcome {
    /// Short label, used for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            AttemptOutcome::Loaded => "loaded",
            AttemptOutcome::SoftFailure => "soft_failure",
            AttemptOutcome::Error(_) => "error",
            AttemptOutcome::FaultContained(_) => "fault_contained",
        }
    }

    fn cause(&self) -> String {
        match self {
            AttemptOutcome::Loaded => "loaded".to_string(),
            AttemptOutcome::SoftFailure => "native loader returned false".to_string(),
            AttemptOutcome::Error(cause) => cause.clone(),
            AttemptOutcome::FaultContained(cause) => format!("fault contained: {cause}"),
        }
    }
}

/// Record of one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierAttempt {
    pub index: usize,
    pub tier: String,
    #[serde(flatten)]
    pub outcome: AttemptOutcome,
}

/// Every tier failed.
#[derive(Error, Debug, Clone)]
#[error("Failed to load model {}: {cause}", path.display())]
pub struct LoadFailure {
    pub path: PathBuf,
    pub cause: String,
    pub attempts: Vec<TierAttempt>,
}

/// Where attempts run.
#[derive(Debug, Clone, Default)]
pub enum Containment {
    /// In this process, under a [`crate::loader::containment::FaultGuard`].
    #[default]
    InProcess,
    /// Pre-flighted in a worker process, then loaded in-process.
    Subprocess(WorkerCommand),
}

/// A successful load.
pub struct LoadedModel {
    pub engine: Box<dyn NativeEngine>,
    pub tier: SelectedTier,
    pub attempts: Vec<TierAttempt>,
}

impl std::fmt::Debug for LoadedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModel")
            .field("tier", &self.tier)
            .field("attempts", &self.attempts)
            .finish_non_exhaustive()
    }
}

/// Tiered loader.
pub struct ResilientLoader {
    factory: Arc<dyn EngineFactory>,
    baseline: LoadParams,
    containment: Containment,
}

impl ResilientLoader {
    pub fn new(factory: Arc<dyn EngineFactory>, baseline: LoadParams, containment: Containment) -> Self {
        Self {
            factory,
            baseline,
            containment,
        }
    }

    pub fn baseline(&self) -> &LoadParams {
        &self.baseline
    }

    /// Try `tiers` in order against `path`.
    pub fn load(&self, path: &Path, tiers: &[LoadTier]) -> Result<LoadedModel, LoadFailure> {
        let mut attempts = Vec::with_capacity(tiers.len());

        for (index, tier) in tiers.iter().enumerate() {
            let params = tier.resolve(&self.baseline);

            info!(
                path = %path.display(),
                tier = index,
                tier_name = %tier,
                n_ctx = params.n_ctx,
                n_batch = params.n_batch,
                use_mmap = params.use_mmap,
                "Attempting model load"
            );

            let (outcome, engine) = self.attempt(path, index, &params);
            attempts.push(TierAttempt {
                index,
                tier: tier.name.clone(),
                outcome: outcome.clone(),
            });

            if let Some(engine) = engine {
                info!(path = %path.display(), tier = index, tier_name = %tier, "Model loaded");
                return Ok(LoadedModel {
                    engine,
                    tier: SelectedTier {
                        index,
                        name: tier.name.clone(),
                        params,
                    },
                    attempts,
                });
            }
        }

        let cause = match attempts.last() {
            Some(last) => format!(
                "all {} load tiers failed, last ({}): {}",
                attempts.len(),
                last.tier,
                last.outcome.cause()
            ),
            None => "no load tiers configured".to_string(),
        };

        error!(path = %path.display(), tiers = attempts.len(), "{cause}");

        Err(LoadFailure {
            path: path.to_path_buf(),
            cause,
            attempts,
        })
    }

    fn attempt(
        &self,
        path: &Path,
        index: usize,
        params: &LoadParams,
    ) -> (AttemptOutcome, Option<Box<dyn NativeEngine>>) {
        if let Containment::Subprocess(worker) = &self.containment {
            let outcome = match preflight(worker, path, params) {
                Ok(WorkerVerdict::Loaded) => None,
                Ok(WorkerVerdict::SoftFailure) => Some(AttemptOutcome::SoftFailure),
                Ok(WorkerVerdict::Failed(cause)) => Some(AttemptOutcome::Error(cause)),
                Ok(WorkerVerdict::Faulted(cause)) => Some(AttemptOutcome::FaultContained(cause)),
                Err(e) => Some(AttemptOutcome::Error(format!("failed to run load worker: {e}"))),
            };
            if let Some(outcome) = outcome {
                self.log_failure(path, index, &outcome);
                return (outcome, None);
            }
        }

        let mut engine = self.factory.create();
        let outcome = match contain(|| engine.load_model(path, params)) {
            Ok(Ok(true)) => return (AttemptOutcome::Loaded, Some(engine)),
            Ok(Ok(false)) => AttemptOutcome::SoftFailure,
            Ok(Err(e)) => AttemptOutcome::Error(e.to_string()),
            Err(fault) => {
                // Its destructor would run over whatever state the fault left.
                std::mem::forget(engine);
                AttemptOutcome::FaultContained(fault.message)
            }
        };

        self.log_failure(path, index, &outcome);
        (outcome, None)
    }

    fn log_failure(&self, path: &Path, index: usize, outcome: &AttemptOutcome) {
        match outcome {
            AttemptOutcome::FaultContained(cause) => error!(
                path = %path.display(),
                tier = index,
                cause = %cause,
                "fault contained during model load; process state may be degraded"
            ),
            AttemptOutcome::Error(cause) => {
                warn!(path = %path.display(), tier = index, cause = %cause, "Model load raised an error")
            }
            AttemptOutcome::SoftFailure => {
                warn!(path = %path.display(), tier = index, "Model load returned false")
            }
            AttemptOutcome::Loaded => {}
        }
    }
}
