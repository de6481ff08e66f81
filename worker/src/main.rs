use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;
use worker::{build_router, Config, Worker, WorkerState};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("worker=debug,common=info,tower_http=info")),
        )
        .init();

    let config = Config::from_env();

    // Nombre del host (solo para logs)
    let hostname_str = hostname::get()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();
    info!(
        "worker {} iniciando: sockets en {}, particiones en {}, hasta {} subprocesos",
        hostname_str,
        config.socket_dir.display(),
        config.mappers_dir,
        config.max_subprocesses
    );

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    info!("worker escuchando en {}", config.listen_addr);

    let app = build_router(WorkerState::new(Worker::new(Arc::new(config))));
    axum::serve(listener, app).await?;
    Ok(())
}
