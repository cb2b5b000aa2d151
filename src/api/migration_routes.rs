//! Multi-sheet migration endpoints: upload, polling, cancel, system info.
//!
//! Data faults never surface here: they land in the error relations and are
//! visible through the progress and error endpoints. HTTP errors are input
//! faults (400), idempotency conflicts (409) or system faults (5xx).

use axum::{
    extract::{Multipart, Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::state::AppState;
use crate::error::MigrationError;
use crate::jobs::{CancelOutcome, SubmitOutcome};

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

type ApiError = (StatusCode, Json<ErrorBody>);

fn api_error(e: MigrationError) -> ApiError {
    let status =
        StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        tracing::error!(%e, "request failed");
    }
    (
        status,
        Json(ErrorBody {
            error: e.to_string(),
        }),
    )
}

fn not_found(job_id: &str) -> ApiError {
    api_error(MigrationError::NotFound(format!("job {job_id}")))
}

#[derive(Debug, Deserialize)]
struct UploadQuery {
    /// Async submission (the default) returns 202 immediately.
    #[serde(rename = "async", default = "default_async")]
    run_async: bool,
    /// Optional idempotency key; re-submitting a finished id replays it.
    #[serde(rename = "jobId")]
    job_id: Option<String>,
}

fn default_async() -> bool {
    true
}

/// POST /migration/multisheet/upload
async fn upload(
    State(state): State<AppState>,
    Query(query): Query<UploadQuery>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let mut file: Option<(String, Vec<u8>)> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| api_error(MigrationError::InvalidInput(e.to_string())))?
    {
        if field.name() == Some("file") {
            let name = field.file_name().unwrap_or("upload.xlsx").to_string();
            let bytes = field
                .bytes()
                .await
                .map_err(|e| api_error(MigrationError::InvalidInput(e.to_string())))?;
            file = Some((name, bytes.to_vec()));
        }
    }
    let (file_name, bytes) = file.ok_or_else(|| {
        api_error(MigrationError::InvalidInput(
            "multipart field 'file' is required".to_string(),
        ))
    })?;

    let outcome = state
        .manager
        .submit(&file_name, bytes, query.job_id)
        .await
        .map_err(api_error)?;

    match outcome {
        SubmitOutcome::Rejected(report) => Ok((
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": format!("workbook rejected: {}", report.summary()),
                "report": report,
            })),
        )),
        SubmitOutcome::AlreadyTerminal { job_id } => {
            let progress = state
                .progress
                .get_progress(&job_id)
                .await
                .map_err(api_error)?
                .ok_or_else(|| not_found(&job_id))?;
            Ok((StatusCode::OK, Json(json!(progress))))
        }
        SubmitOutcome::Accepted { job_id, mut done } => {
            if query.run_async {
                Ok((
                    StatusCode::ACCEPTED,
                    Json(json!({
                        "jobId": job_id,
                        "status": "STARTED",
                        "progressUrl": format!("/migration/multisheet/{job_id}/progress"),
                        "cancelUrl": format!("/migration/multisheet/{job_id}/cancel"),
                    })),
                ))
            } else {
                // Synchronous mode: wait for the run, then return the final
                // snapshot.
                let _ = done.changed().await;
                let progress = state
                    .progress
                    .get_progress(&job_id)
                    .await
                    .map_err(api_error)?
                    .ok_or_else(|| not_found(&job_id))?;
                Ok((StatusCode::OK, Json(json!(progress))))
            }
        }
    }
}

/// GET /migration/multisheet/{job_id}/progress
async fn job_progress(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let progress = state
        .progress
        .get_progress(&job_id)
        .await
        .map_err(api_error)?
        .ok_or_else(|| not_found(&job_id))?;
    Ok(Json(json!(progress)))
}

/// GET /migration/multisheet/{job_id}/sheets
async fn job_sheets(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if state
        .progress
        .get_job(&job_id)
        .await
        .map_err(api_error)?
        .is_none()
    {
        return Err(not_found(&job_id));
    }
    let sheets = state.progress.list_sheets(&job_id).await.map_err(api_error)?;
    Ok(Json(json!({ "jobId": job_id, "sheets": sheets })))
}

/// GET /migration/multisheet/{job_id}/sheet/{name}
async fn job_sheet(
    State(state): State<AppState>,
    Path((job_id, name)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let sheet = state
        .progress
        .get_sheet(&job_id, &name)
        .await
        .map_err(api_error)?
        .ok_or_else(|| not_found(&format!("{job_id}/{name}")))?;
    Ok(Json(json!(sheet)))
}

#[derive(Debug, Deserialize)]
struct ErrorsQuery {
    sheet: Option<String>,
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
}

fn default_limit() -> i64 {
    100
}

/// GET /migration/multisheet/{job_id}/errors
async fn job_errors(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Query(query): Query<ErrorsQuery>,
) -> Result<Json<Value>, ApiError> {
    if state
        .progress
        .get_job(&job_id)
        .await
        .map_err(api_error)?
        .is_none()
    {
        return Err(not_found(&job_id));
    }
    let errors = state
        .staging
        .list_row_errors(
            &job_id,
            query.sheet.as_deref(),
            query.limit.clamp(1, 1000),
            query.offset.max(0),
        )
        .await
        .map_err(api_error)?;
    Ok(Json(json!({ "jobId": job_id, "errors": errors })))
}

/// DELETE /migration/multisheet/{job_id}/cancel
async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    match state.manager.cancel(&job_id).await.map_err(api_error)? {
        CancelOutcome::Cancelled => Ok(Json(json!({
            "jobId": job_id,
            "status": "CANCELLING",
        }))),
        CancelOutcome::NotFound => Err(not_found(&job_id)),
        CancelOutcome::AlreadyTerminal => Err(api_error(MigrationError::Conflict(format!(
            "job {job_id} already finished"
        )))),
    }
}

/// GET /migration/multisheet/system/info
async fn system_info(State(state): State<AppState>) -> Json<Value> {
    let info = state.manager.system_info().await;
    Json(json!(info))
}

/// GET /health
async fn health(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    sqlx::query_scalar::<_, i32>("SELECT 1")
        .fetch_one(&state.pool)
        .await
        .map_err(|e| api_error(MigrationError::Database(e)))?;
    Ok(Json(json!({ "status": "ok" })))
}

/// Create the migration router. The body limit tracks the configured
/// payload cap so oversize uploads fail fast at the framework edge.
pub fn create_migration_router(state: AppState) -> Router {
    let body_limit = state.config.upload.max_payload_bytes as usize + 64 * 1024;
    Router::new()
        .route("/migration/multisheet/upload", post(upload))
        .route("/migration/multisheet/system/info", get(system_info))
        .route("/migration/multisheet/:job_id/progress", get(job_progress))
        .route("/migration/multisheet/:job_id/sheets", get(job_sheets))
        .route("/migration/multisheet/:job_id/sheet/:name", get(job_sheet))
        .route("/migration/multisheet/:job_id/errors", get(job_errors))
        .route("/migration/multisheet/:job_id/cancel", delete(cancel_job))
        .route("/health", get(health))
        .layer(axum::extract::DefaultBodyLimit::max(body_limit))
        .with_state(state)
}
