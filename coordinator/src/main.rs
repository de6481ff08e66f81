mod artifacts;
mod config;
mod dispatch;
mod handlers;
mod jobs;
mod pods;
mod scheduler;
mod store;
#[cfg(test)]
mod testing;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::artifacts::ArtifactManager;
use crate::config::Config;
use crate::dispatch::HttpWorkerClient;
use crate::handlers::AppState;
use crate::jobs::JobManager;
use crate::pods::PreProvisioned;
use crate::scheduler::{JobScheduler, S3Registrars};
use crate::store::Store;

#[derive(Parser, Debug)]
#[command(name = "coordinator", about = "MapReduce job coordinator")]
struct Args {
    /// Dial workers through their dev-mode node ports on localhost
    #[arg(long)]
    dev: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("coordinator=debug,common=info,tower_http=info")),
        )
        .init();

    let args = Args::parse();
    let config = Arc::new(Config::from_env(args.dev));
    if config.dev_mode {
        info!("corriendo en modo dev");
    }

    // 1) estado
    let store = Store::new();
    let artifacts = ArtifactManager::new(store.clone(), config.artifacts_path.clone());
    info!("artefactos guardados en {}", artifacts.root().display());

    // 2) scheduler y sus colaboradores
    let scheduler = JobScheduler::new(
        config.clone(),
        store.clone(),
        artifacts.clone(),
        Arc::new(PreProvisioned),
        Arc::new(HttpWorkerClient::new(reqwest::Client::new())),
        Arc::new(S3Registrars {
            dev_mode: config.dev_mode,
        }),
    );
    let jobs = JobManager::new(store, scheduler);

    // 3) router HTTP
    let app = handlers::build_router(AppState { jobs, artifacts });

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("can't bind {}", config.listen_addr))?;
    info!("coordinator escuchando en {}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}
