use std::net::SocketAddr;

use anyhow::Context;
use botdock_agent::AgentConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// stdout always; a daily-rolling file too when `BOTDOCK_LOG_DIR` is set.
/// The guard must live until exit or buffered lines are lost.
fn init_tracing() -> Option<WorkerGuard> {
    let stdout = tracing_subscriber::fmt::layer();
    match std::env::var("BOTDOCK_LOG_DIR") {
        Ok(dir) if !dir.trim().is_empty() => {
            let appender = tracing_appender::rolling::daily(dir.trim(), "botdock-control.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(EnvFilter::from_default_env())
                .with(stdout)
                .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        _ => {
            tracing_subscriber::registry()
                .with(EnvFilter::from_default_env())
                .with(stdout)
                .init();
            None
        }
    }
}

fn bind_addr() -> anyhow::Result<SocketAddr> {
    let raw = std::env::var("BOTDOCK_BIND").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    raw.parse()
        .with_context(|| format!("invalid BOTDOCK_BIND: {raw}"))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(%err, "ctrl-c handler failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                tracing::warn!(%err, "SIGTERM handler failed");
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
    tracing::info!("shutdown requested");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_tracing();

    let database_url =
        std::env::var("DATABASE_URL").map_err(|_| anyhow::anyhow!("DATABASE_URL is required"))?;
    let db = botdock_control::connect_and_migrate(&database_url).await?;

    let config = AgentConfig::from_env();
    tokio::fs::create_dir_all(&config.data_root)
        .await
        .with_context(|| format!("create data root {}", config.data_root.display()))?;
    let state = botdock_control::build_state(db, config).await?;

    let app = botdock_control::router(state.clone());
    let addr = bind_addr()?;
    tracing::info!(%addr, "botdock-control HTTP listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.orchestrator.shutdown().await;
    Ok(())
}
