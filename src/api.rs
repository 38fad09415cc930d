use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::error::{NotifyError, PipelineError, StoreError};
use crate::model::{Release, ReleaseStatus};
use crate::notify::{DispatchReport, NotificationDispatcher};
use crate::pipeline::{RunCoordinator, RunScope};
use crate::store::{ReleaseFilter, Store};

pub const ENV_PROCESS_SECRET: &str = "PROCESS_SECRET";
pub const SECRET_HEADER: &str = "x-process-secret";

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<RunCoordinator>,
    pub dispatcher: Arc<NotificationDispatcher>,
    pub store: Arc<dyn Store>,
    /// SHA-256 of the trigger secret; `None` disables the guarded endpoints.
    secret_digest: Option<[u8; 32]>,
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        coordinator: Arc<RunCoordinator>,
        dispatcher: Arc<NotificationDispatcher>,
        secret: Option<String>,
        shutdown: CancellationToken,
    ) -> Self {
        let secret_digest = secret
            .filter(|s| !s.trim().is_empty())
            .map(|s| digest(s.trim().as_bytes()));
        Self {
            store: coordinator.store().clone(),
            coordinator,
            dispatcher,
            secret_digest,
            shutdown,
        }
    }

    /// Secret from `PROCESS_SECRET`.
    pub fn secret_from_env() -> Option<String> {
        std::env::var(ENV_PROCESS_SECRET).ok()
    }

    /// Constant-time comparison of the provided secret against the configured one.
    pub fn secret_matches(&self, provided: &str) -> bool {
        let Some(expected) = &self.secret_digest else {
            return false;
        };
        let got = digest(provided.trim().as_bytes());
        expected
            .iter()
            .zip(got.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }

    fn authorize(&self, headers: &HeaderMap) -> Result<(), ApiError> {
        if self.secret_digest.is_none() {
            return Err(ApiError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "trigger secret not configured",
            ));
        }
        let provided = headers
            .get(SECRET_HEADER)
            .and_then(|v| v.to_str().ok())
            .or_else(|| {
                headers
                    .get(AUTHORIZATION)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.strip_prefix("Bearer "))
            });
        match provided {
            Some(p) if self.secret_matches(p) => Ok(()),
            _ => Err(ApiError::new(StatusCode::UNAUTHORIZED, "invalid secret")),
        }
    }
}

fn digest(bytes: &[u8]) -> [u8; 32] {
    Sha256::digest(bytes).into()
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/process", post(process))
        .route("/releases", get(list_releases))
        .route("/releases/{id}/approve", post(approve_release))
        .layer(CorsLayer::very_permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorBody { error: self.message })).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        let status = match e {
            StoreError::NotFound { .. } => StatusCode::NOT_FOUND,
            StoreError::Conflict { .. } => StatusCode::CONFLICT,
            StoreError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        Self::new(status, e.to_string())
    }
}

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        match e {
            PipelineError::UnknownSource(_) => Self::new(StatusCode::NOT_FOUND, e.to_string()),
            PipelineError::Store(s) => s.into(),
        }
    }
}

impl From<NotifyError> for ApiError {
    fn from(e: NotifyError) -> Self {
        match e {
            NotifyError::Store(s) => s.into(),
            NotifyError::Merged { .. } | NotifyError::NotApproved(_) => {
                Self::new(StatusCode::CONFLICT, e.to_string())
            }
            NotifyError::Send { .. } => Self::new(StatusCode::BAD_GATEWAY, e.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ProcessQuery {
    source_id: Option<String>,
}

async fn process(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(q): Query<ProcessQuery>,
) -> Result<Json<crate::pipeline::RunReport>, ApiError> {
    state.authorize(&headers)?;
    let scope = match q.source_id.filter(|s| !s.trim().is_empty()) {
        Some(id) => RunScope::Source(id),
        None => RunScope::All,
    };
    tracing::info!(target: "api", ?scope, "processing run triggered");
    let report = state.coordinator.run(scope, &state.shutdown).await?;
    Ok(Json(report))
}

#[derive(Debug, Deserialize)]
struct ReleasesQuery {
    status: Option<String>,
    park: Option<String>,
    limit: Option<usize>,
}

async fn list_releases(
    State(state): State<AppState>,
    Query(q): Query<ReleasesQuery>,
) -> Result<Json<Vec<Release>>, ApiError> {
    let status = match q.status.as_deref() {
        Some(s) => Some(
            s.parse::<ReleaseStatus>()
                .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e))?,
        ),
        None => None,
    };
    let filter = ReleaseFilter {
        status,
        park: crate::model::normalize_label(q.park.as_deref()),
        limit: q.limit,
    };
    Ok(Json(state.store.list_releases(&filter).await?))
}

#[derive(Debug, Serialize)]
struct ApproveResp {
    release_id: String,
    status: ReleaseStatus,
    dispatch: DispatchReport,
}

async fn approve_release(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<ApproveResp>, ApiError> {
    state.authorize(&headers)?;
    let release = state
        .store
        .get_release(&id)
        .await?
        .ok_or_else(|| StoreError::not_found("release", id.clone()))?;
    if let Some(into) = release.merged_into_id {
        return Err(NotifyError::Merged { id, into }.into());
    }
    state
        .store
        .set_release_status(&id, ReleaseStatus::Approved)
        .await?;
    tracing::info!(target: "api", release_id = %id, "release approved");

    let dispatch = state.dispatcher.dispatch(&id, &state.shutdown).await?;
    Ok(Json(ApproveResp {
        release_id: id,
        status: ReleaseStatus::Approved,
        dispatch,
    }))
}
