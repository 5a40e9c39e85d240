//! API server entry point.

use std::sync::Arc;

use api::{AppState, Config, Providers, StartupError};
use event_store::EventStore;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to install SIGINT handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if config.log_json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Serves until a shutdown signal, running the reconciliation poller
/// alongside. The poller stops before the process exits.
async fn serve<S: EventStore + 'static>(
    state: Arc<AppState<S>>,
    metrics_handle: PrometheusHandle,
    config: &Config,
) -> Result<(), StartupError> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let poller = state.poller.clone();
    let poller_task = tokio::spawn(async move { poller.run(shutdown_rx).await });

    let app = api::create_app(state, metrics_handle);
    let addr = config.addr();
    tracing::info!(%addr, "starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    let _ = shutdown_tx.send(true);
    if let Err(err) = poller_task.await {
        tracing::error!(error = %err, "reconciliation poller task failed");
    }
    served?;

    tracing::info!("server shut down gracefully");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), StartupError> {
    // 1. Configuration and tracing
    let config = Config::from_env()?;
    init_tracing(&config);

    // 2. Install Prometheus metrics recorder
    let metrics_handle = match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => handle,
        Err(err) => {
            return Err(StartupError::Io(std::io::Error::other(format!(
                "failed to install Prometheus recorder: {err}"
            ))));
        }
    };

    // 3. Providers and stores
    let providers = Providers::from_config(&config)?;
    match config.database_url.clone() {
        Some(url) => {
            tracing::info!("using PostgreSQL event and receipt stores");
            let state = api::create_postgres_state(&url, &config, providers).await?;
            serve(state, metrics_handle, &config).await
        }
        None => {
            tracing::warn!("DATABASE_URL not set; orders are kept in memory only");
            let state = api::create_memory_state(&config, providers);
            serve(state, metrics_handle, &config).await
        }
    }
}
