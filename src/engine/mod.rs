pub mod api;
pub mod config;
pub mod error;
pub mod executor;
pub mod language;
pub mod launcher;
pub mod metrics;
pub mod models;
pub mod registry;
pub mod relay;
pub mod timeout;
pub mod workspace;

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::Router;

use crate::engine::{
    api::{AppState, routes},
    config::{LogFormat, RunnerConfig},
    executor::{ExecutorSettings, PipelineExecutor},
    language::LanguageTable,
    launcher::HostLauncher,
    metrics::MetricsRegistry,
    registry::SessionRegistry,
    relay::ConnectionTable,
    workspace::WorkspaceProvisioner,
};

pub async fn run() -> anyhow::Result<()> {
    let config = RunnerConfig::from_env();
    init_tracing(&config);

    tokio::fs::create_dir_all(&config.workspace_root)
        .await
        .with_context(|| {
            format!(
                "failed to create workspace root {}",
                config.workspace_root.display()
            )
        })?;

    let workspaces = WorkspaceProvisioner::new(config.workspace_root.clone());
    let registry = Arc::new(SessionRegistry::new());
    let connections = Arc::new(ConnectionTable::new());
    let metrics = Arc::new(MetricsRegistry::new());
    let launcher = Arc::new(HostLauncher::new());

    tracing::info!(
        workspace_root = %workspaces.root().display(),
        timeout_secs = config.run_timeout.as_secs(),
        conflict_policy = ?config.conflict_policy,
        "workspace ready"
    );

    let executor = Arc::new(PipelineExecutor::new(
        Arc::new(LanguageTable::builtin()),
        workspaces,
        registry.clone(),
        connections.clone(),
        launcher,
        metrics.clone(),
        ExecutorSettings::from(&config),
    ));

    let app: Router = routes(AppState::new(executor, connections, registry, metrics));
    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    let local = listener
        .local_addr()
        .unwrap_or(SocketAddr::from(([0, 0, 0, 0], 0)));
    tracing::info!(bind = %local, "code runner ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("code runner server error")?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

fn init_tracing(config: &RunnerConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.clone()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.log_format {
        LogFormat::Json => builder
            .json()
            .with_current_span(false)
            .with_span_list(false)
            .init(),
        LogFormat::Compact => builder.with_target(false).compact().init(),
    }
}
