use std::fs::OpenOptions;
use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use onql::api::ApiState;
use onql::engine::RocksEngine;
use onql::{server, Config, Db, StoreManager};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env();

    init_logging(&config)?;

    let engine = RocksEngine::open(&config.db_path)?;
    let store = Arc::new(StoreManager::new(Arc::new(engine))?);
    tracing::info!("store initialized at {}", config.db_path);

    // Background flusher; signalled on shutdown for a final flush.
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let flusher = tokio::spawn(
        store
            .clone()
            .run_flusher(config.flush_interval, shutdown_rx),
    );

    let state = ApiState::new(Db::new(store.clone()));

    tokio::select! {
        result = server::serve(state, &config.port) => {
            if let Err(e) = result {
                tracing::error!("server error: {}", e);
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received");
        }
    }

    let _ = shutdown_tx.send(true);
    let _ = flusher.await;
    tracing::info!("shutdown complete");
    Ok(())
}

fn init_logging(config: &Config) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| match config.log_level.to_uppercase().as_str() {
            "DEBUG" => "onql=debug".into(),
            "WARN" => "onql=warn".into(),
            "ERROR" => "onql=error".into(),
            _ => "onql=info".into(),
        });

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer());

    match &config.log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(Arc::new(file)),
                )
                .init();
        }
        None => registry.init(),
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
