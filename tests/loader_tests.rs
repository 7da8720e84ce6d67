//! Resilient loader behaviour across failure shapes.

mod common;

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use model_host::inference::engine::{EngineError, EngineFactory, NativeEngine};
use model_host::inference::llama_ffi::{LlamaEngineFactory, LoadParams};
use model_host::loader::resilient::{AttemptOutcome, Containment, ResilientLoader};
use model_host::loader::tiers::{default_tiers, LoadTier, TierOverrides};

use common::{write_gguf, MIB};

/// How the scripted engine reacts to a given `n_ctx`.
#[derive(Clone, Copy)]
enum Reaction {
    Load,
    Refuse,
    Fail,
    Panic,
}

struct ScriptedEngine {
    script: Arc<dyn Fn(&LoadParams) -> Reaction + Send + Sync>,
    calls: Arc<Mutex<Vec<u32>>>,
}

impl NativeEngine for ScriptedEngine {
    fn load_model(&mut self, _path: &Path, params: &LoadParams) -> Result<bool, EngineError> {
        self.calls.lock().push(params.n_ctx);
        match (self.script)(params) {
            Reaction::Load => Ok(true),
            Reaction::Refuse => Ok(false),
            Reaction::Fail => Err(EngineError::Load("tensor shape mismatch".to_string())),
            Reaction::Panic => panic!("ggml_abort: out of memory at n_ctx={}", params.n_ctx),
        }
    }

    fn format_chat(&self, _messages: &str, _template: &str) -> Result<String, EngineError> {
        Ok(String::new())
    }
}

struct ScriptedFactory {
    script: Arc<dyn Fn(&LoadParams) -> Reaction + Send + Sync>,
    calls: Arc<Mutex<Vec<u32>>>,
}

impl EngineFactory for ScriptedFactory {
    fn create(&self) -> Box<dyn NativeEngine> {
        Box::new(ScriptedEngine {
            script: Arc::clone(&self.script),
            calls: Arc::clone(&self.calls),
        })
    }
}

fn scripted(
    script: impl Fn(&LoadParams) -> Reaction + Send + Sync + 'static,
) -> (ResilientLoader, Arc<Mutex<Vec<u32>>>) {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let factory = Arc::new(ScriptedFactory {
        script: Arc::new(script),
        calls: Arc::clone(&calls),
    });
    (
        ResilientLoader::new(factory, LoadParams::default(), Containment::InProcess),
        calls,
    )
}

fn ladder(sizes: &[u32]) -> Vec<LoadTier> {
    sizes
        .iter()
        .map(|&n_ctx| {
            LoadTier::new(
                format!("ctx-{n_ctx}"),
                TierOverrides {
                    n_ctx: Some(n_ctx),
                    ..Default::default()
                },
            )
        })
        .collect()
}

#[test]
fn test_first_k_soft_failures_then_success() {
    let (loader, calls) = scripted(|p| if p.n_ctx <= 512 { Reaction::Load } else { Reaction::Refuse });

    let loaded = loader
        .load(Path::new("m.gguf"), &ladder(&[4096, 2048, 1024, 512, 256]))
        .unwrap();

    assert_eq!(loaded.tier.index, 3);
    assert_eq!(loaded.tier.params.n_ctx, 512);
    assert_eq!(*calls.lock(), vec![4096, 2048, 1024, 512]);
    assert_eq!(loaded.attempts.len(), 4);
    assert!(loaded.attempts[..3]
        .iter()
        .all(|a| a.outcome == AttemptOutcome::SoftFailure));
}

#[test]
fn test_panic_is_contained_and_next_tier_runs() {
    let (loader, calls) = scripted(|p| if p.use_mmap { Reaction::Panic } else { Reaction::Load });

    let loaded = loader.load(Path::new("m.gguf"), &default_tiers()).unwrap();

    assert_eq!(loaded.tier.name, "ultra-conservative");
    assert_eq!(*calls.lock(), vec![2048, 256]);
    match &loaded.attempts[0].outcome {
        AttemptOutcome::FaultContained(cause) => assert!(cause.contains("ggml_abort"), "{cause}"),
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[test]
fn test_recoverable_error_moves_to_next_tier() {
    let (loader, _) = scripted(|p| if p.n_ctx > 256 { Reaction::Fail } else { Reaction::Load });

    let loaded = loader.load(Path::new("m.gguf"), &default_tiers()).unwrap();
    assert_eq!(loaded.tier.index, 1);
    assert_eq!(
        loaded.attempts[0].outcome,
        AttemptOutcome::Error("Model load error: tensor shape mismatch".to_string())
    );
}

#[test]
fn test_every_tier_faulting_reports_last_cause() {
    let (loader, calls) = scripted(|_| Reaction::Panic);

    let failure = loader.load(Path::new("m.gguf"), &default_tiers()).unwrap_err();
    assert_eq!(calls.lock().len(), 2);
    assert!(failure.cause.contains("all 2 load tiers failed"), "{}", failure.cause);
    assert!(failure.cause.contains("fault contained"), "{}", failure.cause);
    assert!(failure
        .attempts
        .iter()
        .all(|a| matches!(a.outcome, AttemptOutcome::FaultContained(_))));
}

#[test]
fn test_attempts_run_from_many_threads() {
    let (loader, calls) = scripted(|p| if p.use_mmap { Reaction::Panic } else { Reaction::Load });
    let loader = Arc::new(loader);

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let loader = Arc::clone(&loader);
            std::thread::spawn(move || loader.load(Path::new("m.gguf"), &default_tiers()).unwrap())
        })
        .collect();

    for worker in workers {
        assert_eq!(worker.join().unwrap().tier.index, 1);
    }
    assert_eq!(calls.lock().len(), 8);
}

#[cfg(unix)]
mod subprocess {
    use super::*;
    use model_host::loader::isolation::WorkerCommand;

    fn sh(script: &str) -> WorkerCommand {
        WorkerCommand::new("sh", vec!["-c".to_string(), script.to_string(), "worker".to_string()])
    }

    #[test]
    fn test_worker_crash_falls_back_to_next_tier() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_gguf(dir.path(), "m.gguf", 3, 2 * MIB);

        // Crash unless the params disable mmap, which only the conservative tier does.
        let worker = sh(r#"case "$4" in *'"use_mmap":false'*) exit 0;; *) kill -SEGV $$;; esac"#);
        let loader = ResilientLoader::new(
            Arc::new(LlamaEngineFactory),
            LoadParams::default(),
            Containment::Subprocess(worker),
        );

        let loaded = loader.load(&path, &default_tiers()).unwrap();
        assert_eq!(loaded.tier.name, "ultra-conservative");
        match &loaded.attempts[0].outcome {
            AttemptOutcome::FaultContained(cause) => assert!(cause.contains("signal"), "{cause}"),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn test_worker_soft_failure_skips_in_process_attempt() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let factory = Arc::new(ScriptedFactory {
            script: Arc::new(|_: &LoadParams| Reaction::Load),
            calls: Arc::clone(&calls),
        });
        let loader = ResilientLoader::new(factory, LoadParams::default(), Containment::Subprocess(sh("exit 3")));

        let failure = loader.load(Path::new("m.gguf"), &default_tiers()).unwrap_err();
        assert!(failure
            .attempts
            .iter()
            .all(|a| a.outcome == AttemptOutcome::SoftFailure));
        assert!(calls.lock().is_empty());
    }
}
