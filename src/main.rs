use std::panic;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::config::{Config, SandboxBackend};
use crate::core::coordinator::Coordinator;
use crate::core::logs::LogCollector;
use crate::core::pipeline::reaping::handle_reaping;
use crate::core::queue::RunQueue;
use crate::core::traits::{artifact_store::ArtifactStore, sandbox::SandboxRuntime};
use crate::http::services::{AppState, router};
use crate::native::{sandbox::NodeSandbox, scope::ScopeManager};
use crate::storage::fs::FsArtifactStore;
use crate::stubs::sandbox::{SandboxStub, StubScript};

mod config;
mod constants;
mod core;
mod http;
mod native;
mod storage;
mod stubs;

#[tokio::main]
#[tracing::instrument]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    set_panic_hook();

    let config = Config::load()?;
    tracing::debug!("Loaded config: {:?}", config);

    let store: Arc<dyn ArtifactStore> = Arc::new(FsArtifactStore::new(config.store_settings())?);
    let sandbox = build_sandbox(&config).await?;

    let coordinator = Arc::new(Coordinator::new(
        sandbox,
        store.clone(),
        LogCollector::new(config.log_limits()),
        RunQueue::new(config.queue.concurrency, config.queue.max_waiting),
        config.coordinator_settings(),
    ));

    let stop_reaper = CancellationToken::new();
    let reaper = handle_reaping(
        store.clone(),
        coordinator.clone(),
        config.reap_interval(),
        config.retention(),
        stop_reaper.clone(),
    );

    let app = router(
        AppState {
            coordinator: coordinator.clone(),
            store,
        },
        config.max_body_bytes(),
    );

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("HTTP server listening on {}", addr);

    let shutdown_coordinator = coordinator.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", err);
            }
            tracing::info!("Shutting down");
            shutdown_coordinator.shutdown();
        })
        .await?;

    stop_reaper.cancel();
    if let Err(err) = reaper.await {
        tracing::error!("Reaper task failed: {}", err);
    }

    Ok(())
}

async fn build_sandbox(config: &Config) -> std::io::Result<Arc<dyn SandboxRuntime>> {
    match config.sandbox.backend {
        SandboxBackend::Stub => {
            tracing::warn!("Using the stub sandbox, scripts will not be executed");
            Ok(Arc::new(SandboxStub::new(
                StubScript::hello(),
                Duration::from_secs(1),
            )))
        }
        SandboxBackend::Node => {
            let scopes = match ScopeManager::connect(config.sandbox.systemd_scope).await {
                Ok(scopes) => scopes,
                Err(err) => {
                    tracing::warn!("systemd scopes unavailable, continuing without: {}", err);
                    None
                }
            };
            let limits = config.execution_limits();
            if scopes.is_none() && (limits.memory_bytes.is_some() || limits.pids_count.is_some()) {
                tracing::warn!(
                    "No systemd scope: memory and process limits are enforced by polling /proc and short spikes can pass"
                );
            }
            Ok(Arc::new(NodeSandbox::new(config.node_settings(), scopes)?))
        }
    }
}

fn set_panic_hook() {
    panic::set_hook(Box::new(|panic_info| {
        tracing::error!(
            message = "panic occurred",
            panic = %panic_info
        );
    }));
}
