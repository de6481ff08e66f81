use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, put},
    Json, Router,
};
use common::job::ALLOWED_INPUT_TYPES;
use common::{Artifact, Code, Error, Job, JobRequest, ScheduleResponse, Task};
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::artifacts::{ArtifactManager, DEFAULT_ARTIFACT_TYPE};
use crate::jobs::JobManager;

#[derive(Clone)]
pub struct AppState {
    pub jobs: JobManager,
    pub artifacts: ArtifactManager,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/jobs", get(list_jobs).post(create_job))
        .route("/api/v1/jobs/:id", get(get_job).delete(stop_job))
        .route("/api/v1/jobs/:id/tasks", get(get_job_tasks))
        .route("/api/v1/artifacts", get(list_artifacts))
        .route(
            "/api/v1/artifacts/:name",
            put(upload_artifact).get(get_artifact).delete(delete_artifact),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/* ---------------- errors ---------------- */

pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.code() {
            Code::InvalidArgument => StatusCode::BAD_REQUEST,
            Code::FailedPrecondition => StatusCode::PRECONDITION_FAILED,
            Code::NotFound => StatusCode::NOT_FOUND,
            Code::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({ "code": self.0.code(), "message": self.0.to_string() });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/* ---------------- handlers HTTP ---------------- */

async fn health() -> &'static str {
    "ok"
}

// Valida el pedido, guarda el job y lo planifica en segundo plano
async fn create_job(
    State(state): State<AppState>,
    Json(req): Json<JobRequest>,
) -> ApiResult<(StatusCode, Json<ScheduleResponse>)> {
    if !ALLOWED_INPUT_TYPES.contains(&req.input_type.as_str()) {
        return Err(Error::invalid_argument(format!(
            "{} isn't in the allowed input types list {:?}",
            req.input_type, ALLOWED_INPUT_TYPES
        ))
        .into());
    }
    if req.n_reducers == 0 {
        return Err(Error::invalid_argument("nReducers must be greater than 0").into());
    }

    let map_program = state.artifacts.artifact(&req.mapper_name)?;
    let reduce_program = state.artifacts.artifact(&req.reducer_name)?;

    let job = state.jobs.persist_job(&req);
    let submitted = state.jobs.submit(
        job,
        [map_program.clone(), reduce_program.clone()],
        [
            req.input_storage_credentials.clone(),
            req.output_storage_credentials.clone(),
        ],
        req.split_size,
    );
    info!("job {} submitted", submitted.job.id);

    Ok((
        StatusCode::CREATED,
        Json(ScheduleResponse {
            job: submitted.job,
            map_program,
            reduce_program,
        }),
    ))
}

async fn list_jobs(State(state): State<AppState>) -> Json<Vec<Job>> {
    Json(state.jobs.jobs())
}

async fn get_job(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Job>> {
    Ok(Json(state.jobs.job(&id)?))
}

async fn get_job_tasks(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Vec<Task>>> {
    Ok(Json(state.jobs.tasks(&id)?))
}

// Detener un job en curso no está soportado
async fn stop_job(Path(id): Path<String>) -> (StatusCode, String) {
    (
        StatusCode::NOT_IMPLEMENTED,
        format!("stopping job {id} is not implemented"),
    )
}

#[derive(Debug, Deserialize)]
struct UploadQuery {
    #[serde(rename = "type")]
    artifact_type: Option<String>,
}

async fn upload_artifact(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<UploadQuery>,
    body: Bytes,
) -> ApiResult<Json<Artifact>> {
    let artifact_type = query.artifact_type.as_deref().unwrap_or(DEFAULT_ARTIFACT_TYPE);
    let artifact = state.artifacts.create_artifact(&name, artifact_type, &body).await?;
    Ok(Json(artifact))
}

async fn list_artifacts(State(state): State<AppState>) -> Json<Vec<Artifact>> {
    Json(state.artifacts.artifacts())
}

async fn get_artifact(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult<Json<Artifact>> {
    Ok(Json(state.artifacts.artifact(&name)?))
}

async fn delete_artifact(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult<StatusCode> {
    state.artifacts.delete_artifact(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}
