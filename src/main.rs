//! strata-memory daemon
//!
//! Runs the promotion, consolidation and distillation loops against embedded
//! stores under `STRATA_DATA_PATH` until Ctrl-C or SIGTERM. Applications
//! embed the library and talk to `MemoryOrchestrator` directly; this binary
//! keeps the background lifecycle going for a shared data directory.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{debug, error, info, warn};

use strata_memory::clock::system_clock;
use strata_memory::config::{print_env_help, StrataConfig};
use strata_memory::constants::GRACEFUL_SHUTDOWN_TIMEOUT_SECS;
use strata_memory::embeddings::{Embedder, HashEmbedder};
use strata_memory::llm::{LlmClient, OllamaClient};
use strata_memory::memory::{MemoryOrchestrator, StrataStores};
use strata_memory::metrics;
use strata_memory::scheduler::ShutdownSignal;
use strata_memory::tracing_setup::{self, LogFormat};

#[tokio::main]
async fn main() -> Result<()> {
    if std::env::args().any(|a| a == "--help" || a == "-h") {
        print_env_help();
        return Ok(());
    }

    tracing_setup::init_tracing(LogFormat::from_env())
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;
    metrics::register_metrics().context("failed to register metrics")?;

    info!("Starting strata-memory");
    let config = StrataConfig::from_env();
    config.validate().context("invalid configuration")?;
    config.log();

    let clock = system_clock();
    let stores = StrataStores::embedded(&config.data_path, clock.clone())
        .with_context(|| format!("failed to open stores under {:?}", config.data_path))?;
    let llm: Option<Arc<dyn LlmClient>> = config.llm.endpoint.as_deref().map(|endpoint| {
        let client: Arc<dyn LlmClient> = Arc::new(OllamaClient::new(endpoint, &config.llm.model));
        client
    });
    let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::default());

    let orchestrator = Arc::new(MemoryOrchestrator::new(
        config, stores, llm, embedder, clock,
    )?);

    let health = orchestrator.health_check().await;
    info!(status = ?health.status, "Initial health check");
    for problem in &health.problems {
        warn!(problem = %problem, "Health problem at startup");
    }

    let shutdown = ShutdownSignal::new();
    let handles = orchestrator.spawn_background(&shutdown);

    shutdown_signal().await;
    shutdown.trigger();

    match tokio::time::timeout(
        Duration::from_secs(GRACEFUL_SHUTDOWN_TIMEOUT_SECS),
        futures::future::join_all(handles),
    )
    .await
    {
        Ok(results) => {
            for result in results {
                match result {
                    Ok(exit) => info!(
                        engine = %exit.name,
                        cycles = exit.cycles,
                        failures = exit.failures,
                        "Engine stopped"
                    ),
                    Err(e) => error!(error = %e, "Engine task panicked"),
                }
            }
            debug!("Final metrics:\n{}", metrics::render());
            info!("Shutdown complete");
        }
        Err(_) => {
            error!(
                "Graceful shutdown timed out after {}s, forcing exit",
                GRACEFUL_SHUTDOWN_TIMEOUT_SECS
            );
            std::process::exit(1);
        }
    }

    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, stopping engines");
}
