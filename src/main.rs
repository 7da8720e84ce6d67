//! model-host: handle registry and resilient loader for GGUF models.
//!
//! Locates a model artifact, validates its header, loads it through a
//! ladder of progressively conservative configurations, and hands back an
//! opaque handle. Exposes the operations over HTTP and as CLI commands.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use model_host::config::{Cli, Command, Config, ContainmentMode};
use model_host::inference::llama_ffi::{LlamaEngineFactory, LoadParams};
use model_host::loader::isolation::{run_worker, WorkerCommand};
use model_host::server::{self, AppState};
use model_host::service::ModelService;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    // The worker stays minimal: no config, no service, one attempt.
    if let Command::Worker { model, params } = &cli.command {
        let params: LoadParams = serde_json::from_str(params).context("invalid --params")?;
        std::process::exit(run_worker(&LlamaEngineFactory, model, &params));
    }

    info!("model-host v{}", env!("CARGO_PKG_VERSION"));

    let mut config = Config::load(&cli.config)?;
    // This binary can serve as its own load worker.
    if config.loader.containment.mode == ContainmentMode::Subprocess {
        config.loader.containment.default_worker(WorkerCommand::current_exe()?);
    }
    info!(
        search_dirs = config.storage.search_dirs().len(),
        models_dir = %config.storage.models_dir.display(),
        tiers = config.loader.tiers.len(),
        containment = ?config.loader.containment.mode,
        "Configuration loaded"
    );

    let service = Arc::new(ModelService::new(&config, Arc::new(LlamaEngineFactory))?);

    match cli.command {
        Command::Serve { listen } => {
            let listen = listen.unwrap_or_else(|| config.server.listen.clone());
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(async move {
                info!(addr = listen, "Starting server");
                let listener = TcpListener::bind(&listen)
                    .await
                    .with_context(|| format!("failed to bind {listen}"))?;
                let state = Arc::new(AppState::new(service));
                server::serve(listener, state, shutdown_signal()).await?;
                anyhow::Ok(())
            })?;
        }
        Command::Probe { model, search_paths } => {
            let artifact = service.probe_artifact(&model, &search_paths)?;
            println!("{}", serde_json::to_string_pretty(&artifact)?);
        }
        Command::Load { model, search_paths } => {
            let handle = service.create_context(&model, &search_paths, None)?;
            let context = service.context_info(handle)?;
            println!("{}", serde_json::to_string_pretty(&context)?);
            service.release_context(handle);
        }
        Command::Models => {
            let models = service.available_models()?;
            println!("{}", serde_json::to_string_pretty(&models)?);
        }
        Command::Worker { .. } => {}
    }

    Ok(())
}

fn init_tracing(cli: &Cli) {
    let default_filter = if cli.verbose {
        "model_host=debug,tower_http=debug"
    } else {
        "model_host=info,tower_http=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());

    // Logs go to stderr so command output on stdout stays machine-readable.
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    if cli.log_json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
