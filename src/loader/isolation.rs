//! Out-of-process tier pre-flight.
//!
//! A worker process performs the load attempt first. If the native code
//! crashes, only the worker dies; the parent reads the exit status instead
//! of relying on in-process interception. A tier the worker loaded is then
//! loaded in-process.
//!
//! Worker protocol: `<program> <args..> --model <path> --params <json>`.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::inference::engine::EngineFactory;
use crate::inference::llama_ffi::LoadParams;
use crate::loader::containment::contain;

/// Worker loaded the model.
pub const EXIT_LOADED: i32 = 0;
/// `load_model` returned false.
pub const EXIT_SOFT_FAILURE: i32 = 3;
/// `load_model` returned an error.
pub const EXIT_LOAD_ERROR: i32 = 4;
/// A panic was contained inside the worker.
pub const EXIT_FAULT: i32 = 70;

/// How to launch a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCommand {
    pub program: PathBuf,

    #[serde(default)]
    pub args: Vec<String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// The running executable, invoked with the `worker` subcommand.
    pub fn current_exe() -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?, vec!["worker".to_string()]))
    }
}

/// What the parent concluded from one worker run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerVerdict {
    Loaded,
    SoftFailure,
    Failed(String),
    Faulted(String),
}

/// Run one tier in a worker and classify its exit.
pub fn preflight(
    worker: &WorkerCommand,
    model: &Path,
    params: &LoadParams,
) -> std::io::Result<WorkerVerdict> {
    let params_json = serde_json::to_string(params).map_err(std::io::Error::other)?;

    debug!(
        program = %worker.program.display(),
        model = %model.display(),
        "Spawning load worker"
    );

    let output = Command::new(&worker.program)
        .args(&worker.args)
        .arg("--model")
        .arg(model)
        .arg("--params")
        .arg(&params_json)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()?;

    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr_tail = stderr.lines().last().unwrap_or("").trim().to_string();

    let verdict = match output.status.code() {
        Some(EXIT_LOADED) => WorkerVerdict::Loaded,
        Some(EXIT_SOFT_FAILURE) => WorkerVerdict::SoftFailure,
        Some(EXIT_FAULT) => WorkerVerdict::Faulted(non_empty(stderr_tail, "worker contained a fault")),
        Some(code) => WorkerVerdict::Failed(non_empty(stderr_tail, &format!("worker exited with code {code}"))),
        None => WorkerVerdict::Faulted(termination_cause(&output.status)),
    };

    Ok(verdict)
}

fn non_empty(text: String, fallback: &str) -> String {
    if text.is_empty() {
        fallback.to_string()
    } else {
        text
    }
}

#[cfg(unix)]
fn termination_cause(status: &std::process::ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;
    match status.signal() {
        Some(signal) => format!("worker terminated by signal {signal}"),
        None => "worker terminated abnormally".to_string(),
    }
}

#[cfg(not(unix))]
fn termination_cause(_status: &std::process::ExitStatus) -> String {
    "worker terminated abnormally".to_string()
}

/// Worker side: perform one attempt and return the process exit code.
pub fn run_worker(factory: &dyn EngineFactory, model: &Path, params: &LoadParams) -> i32 {
    let mut engine = factory.create();
    match contain(|| engine.load_model(model, params)) {
        Ok(Ok(true)) => EXIT_LOADED,
        Ok(Ok(false)) => {
            warn!(model = %model.display(), "Worker: load_model returned false");
            EXIT_SOFT_FAILURE
        }
        Ok(Err(e)) => {
            eprintln!("{e}");
            EXIT_LOAD_ERROR
        }
        Err(fault) => {
            error!(model = %model.display(), "Worker: {fault}");
            eprintln!("{fault}");
            std::mem::forget(engine);
            EXIT_FAULT
        }
    }
}
