use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use orchestrator::{RunRegistry, RunSnapshot};
use pipeline::{OrganizationName, RunId};
use serde::Serialize;

use crate::error::AppError;

/// Body of every 202 that starts a run.
#[derive(Debug, Serialize)]
struct RunAccepted {
    run_id: RunId,
    status_url: String,
}

fn accepted(run_id: RunId) -> impl IntoResponse {
    let status_url = format!("/api/runs/{run_id}");
    (
        StatusCode::ACCEPTED,
        [(header::LOCATION, status_url.clone())],
        Json(RunAccepted { run_id, status_url }),
    )
}

fn parse_run_id(raw: &str) -> Result<RunId, AppError> {
    raw.parse()
        .map_err(|_| AppError::bad_request(format!("Invalid run id: {raw}")))
}

/// POST /api/orchestrators/{org}
pub async fn start_run(
    State(registry): State<RunRegistry>,
    Path(org): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let organization = OrganizationName::new(org)
        .ok_or_else(|| AppError::bad_request(OrganizationName::REQUIREMENTS))?;
    let run_id = registry.start(organization);
    Ok(accepted(run_id))
}

/// GET /api/runs
pub async fn list_runs(State(registry): State<RunRegistry>) -> Json<Vec<RunSnapshot>> {
    Json(registry.list())
}

/// GET /api/runs/{id}
pub async fn get_run(
    State(registry): State<RunRegistry>,
    Path(id): Path<String>,
) -> Result<Json<RunSnapshot>, AppError> {
    let run_id = parse_run_id(&id)?;
    Ok(Json(registry.status(run_id)?))
}

/// DELETE /api/runs/{id}
pub async fn cancel_run(
    State(registry): State<RunRegistry>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let run_id = parse_run_id(&id)?;
    registry.cancel(run_id)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "run_id": run_id, "status": "cancelling" })),
    ))
}

/// POST /api/runs/{id}/retry
pub async fn retry_run(
    State(registry): State<RunRegistry>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let run_id = parse_run_id(&id)?;
    let retry_id = registry.retry_failed(run_id)?;
    Ok(accepted(retry_id))
}

/// GET /health
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
