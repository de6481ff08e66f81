use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use common::protocol::TASKS_ROUTE;
use common::{TaskPayload, TaskStatusInfo};
use tokio::sync::{mpsc, Mutex};
use tokio_stream::{wrappers::ReceiverStream, StreamExt};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::engine::Worker;

pub const NDJSON: &str = "application/x-ndjson";

#[derive(Clone)]
pub struct WorkerState {
    pub worker: Arc<Worker>,
    busy: Arc<Mutex<()>>,
}

impl WorkerState {
    pub fn new(worker: Worker) -> Self {
        Self {
            worker: Arc::new(worker),
            busy: Arc::new(Mutex::new(())),
        }
    }
}

pub fn build_router(state: WorkerState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(TASKS_ROUTE, post(start_task))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

// Acepta una tarea y devuelve sus estados como JSON delimitado por líneas
async fn start_task(State(state): State<WorkerState>, Json(task): Json<TaskPayload>) -> Response {
    // 1) una tarea a la vez
    let guard = match state.busy.clone().try_lock_owned() {
        Ok(guard) => guard,
        Err(_) => {
            warn!("rechazo tarea {}: worker ocupado", task.id);
            return (StatusCode::CONFLICT, "worker is busy with another task").into_response();
        }
    };
    info!("recibí tarea {}", task.id);

    // 2) ejecutar en segundo plano, ocupando el slot hasta terminar
    let (tx, rx) = mpsc::channel::<TaskStatusInfo>(8);
    let worker = state.worker.clone();
    tokio::spawn(async move {
        let _guard = guard;
        worker.compute(task, tx).await
    });

    // 3) devolver los estados en streaming
    let body = ReceiverStream::new(rx).map(|status| {
        let mut line = serde_json::to_vec(&status).unwrap_or_default();
        line.push(b'\n');
        Ok::<_, Infallible>(Bytes::from(line))
    });
    ([(header::CONTENT_TYPE, NDJSON)], Body::from_stream(body)).into_response()
}
