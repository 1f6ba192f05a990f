use anyhow::{Context, Result};
use attendance_runner::{interpreter::PROBE_TIMEOUT, Runner, RunnerConfig};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod config;
mod error;
mod http;
mod ledger;
mod relay;
mod state;

use config::Config;
use ledger::Ledger;
use relay::Relay;
use state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("attendanced starting");
    let config = Config::from_env();

    // Resolve the interpreter once; a daemon that cannot run the recognition
    // script has nothing to serve.
    let discovery = attendance_runner::discover(&config.interpreters, PROBE_TIMEOUT)
        .await
        .context("no usable Python interpreter")?;

    if !config.script_path.is_file() {
        tracing::warn!(
            path = %config.script_path.display(),
            "recognition script not found; submissions will fail until it exists"
        );
    }

    let ledger = Ledger::open(&config.db_path)
        .await
        .with_context(|| format!("opening attendance ledger {}", config.db_path.display()))?;
    tracing::info!(path = %config.db_path.display(), "attendance ledger opened");

    let runner = Runner::new(RunnerConfig {
        interpreter: discovery.interpreter,
        script: config.script_path.clone(),
        timeout: Duration::from_secs(config.timeout_secs),
        server_mode: config.is_cloud(),
        max_concurrent: config.max_concurrent,
        queue_timeout: Duration::from_secs(config.queue_timeout_secs),
    });
    tracing::info!(
        command = %runner.command_line(),
        timeout_secs = config.timeout_secs,
        max_concurrent = runner.max_concurrent(),
        "recognition runner ready"
    );

    let relay = Relay::new(
        runner,
        config.upload_dir.clone(),
        config.max_upload_bytes,
        config.success_policy(),
    );
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let state = AppState::new(config, relay, ledger, discovery.probes);
    let app = http::build_router(state);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(%addr, "attendanced ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("attendanced shutting down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received Ctrl-C"),
        _ = terminate => tracing::info!("received SIGTERM"),
    }
}
