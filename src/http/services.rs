use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use uuid::Uuid;

use crate::{
    constants::ARTIFACTS_ROUTE_PREFIX,
    core::{
        coordinator::{Coordinator, InvalidInput, SubmitError},
        domain::{ArtifactKey, Submission},
        traits::artifact_store::ArtifactStore,
    },
    http::models::{
        CancelResponse, ErrorResponse, HealthResponse, RunRequest, RunResponse, RunSummary,
    },
};

#[derive(Clone, Debug)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    pub store: Arc<dyn ArtifactStore>,
}

pub fn router(state: AppState, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/run", post(run_script))
        .route("/api/v1/runs/{run_id}", get(run_status).delete(cancel_run))
        .route(
            &format!("{ARTIFACTS_ROUTE_PREFIX}/{{run_id}}/{{seq}}/{{filename}}"),
            get(fetch_artifact),
        )
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Submit(#[from] SubmitError),
    #[error("{what} not found")]
    NotFound { what: &'static str },
    #[error("internal error: {msg}")]
    Internal { msg: String },
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Submit(SubmitError::InvalidInput(InvalidInput::Empty)) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Submit(SubmitError::InvalidInput(InvalidInput::TooLarge { .. })) => {
                StatusCode::PAYLOAD_TOO_LARGE
            }
            ApiError::Submit(SubmitError::ResourceUnavailable { .. })
            | ApiError::Submit(SubmitError::Cancelled { .. }) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::NotFound { .. } => StatusCode::NOT_FOUND,
            ApiError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        }

        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        queue: state.coordinator.queue_stats().into(),
    })
}

/// Executes a script and answers once the run is terminal. The run is
/// cancelled if the client disconnects before that.
#[tracing::instrument(skip_all)]
async fn run_script(
    State(state): State<AppState>,
    Json(request): Json<RunRequest>,
) -> Result<Json<RunResponse>, ApiError> {
    let cancel = CancellationToken::new();
    let _disconnect = cancel.clone().drop_guard();

    let coordinator = state.coordinator.clone();
    let submission = Submission::from(request);
    let run = tokio::spawn(async move { coordinator.submit(submission, cancel).await })
        .await
        .map_err(|err| ApiError::Internal {
            msg: err.to_string(),
        })??;

    Ok(Json(RunResponse::from(&run)))
}

async fn run_status(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Result<Json<RunSummary>, ApiError> {
    state
        .coordinator
        .status(run_id)
        .map(|summary| Json(summary.into()))
        .ok_or(ApiError::NotFound { what: "run" })
}

async fn cancel_run(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Json<CancelResponse> {
    Json(CancelResponse {
        cancelled: state.coordinator.cancel(run_id),
    })
}

async fn fetch_artifact(
    State(state): State<AppState>,
    Path((run_id, seq, filename)): Path<(Uuid, u64, String)>,
) -> Result<Response, ApiError> {
    let artifact = state
        .store
        .get(&ArtifactKey { run_id, seq })
        .await
        .map_err(|err| ApiError::Internal {
            msg: err.to_string(),
        })?
        .filter(|artifact| artifact.filename == filename)
        .ok_or(ApiError::NotFound { what: "artifact" })?;

    Ok((
        [
            (header::CONTENT_TYPE, artifact.mimetype),
            (
                header::CONTENT_DISPOSITION,
                format!("inline; filename=\"{}\"", artifact.filename),
            ),
        ],
        artifact.bytes,
    )
        .into_response())
}
