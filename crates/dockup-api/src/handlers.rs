//! REST API handlers.
//!
//! Reads go straight to the state store; anything that touches a container
//! goes through the job runner and answers with a job id.

use std::cmp::Reverse;

use axum::Json;
use axum::body::Bytes;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use dockup_rollout::OrchestratorError;
use dockup_scheduler::SchedulerError;
use dockup_state::{
    ContainerRecord, HistoryDocument, HistoryEntry, JobId, Settings, SettingsOverride,
    SettingsPatch, StateError, is_valid_container_name,
};

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

fn state_status(e: &StateError) -> StatusCode {
    match e {
        StateError::NotFound(_) => StatusCode::NOT_FOUND,
        StateError::MalformedImport(_) | StateError::InvalidSettings(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn scheduler_status(e: &SchedulerError) -> StatusCode {
    match e {
        SchedulerError::JobNotFound(_) => StatusCode::NOT_FOUND,
        SchedulerError::State(e) => state_status(e),
        SchedulerError::Orchestrator(e) => match e {
            OrchestratorError::OperationInProgress(_) => StatusCode::CONFLICT,
            OrchestratorError::ContainerNotFound(_) => StatusCode::NOT_FOUND,
            OrchestratorError::NotMonitored(_)
            | OrchestratorError::AlreadyAtTag { .. }
            | OrchestratorError::NoPreviousVersion(_) => StatusCode::BAD_REQUEST,
            OrchestratorError::State(e) => state_status(e),
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        },
        SchedulerError::Runtime(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn state_error(e: StateError) -> axum::response::Response {
    error_response(&e.to_string(), state_status(&e)).into_response()
}

fn scheduler_error(e: SchedulerError) -> axum::response::Response {
    error_response(&e.to_string(), scheduler_status(&e)).into_response()
}

fn bad_request(msg: &str) -> axum::response::Response {
    error_response(msg, StatusCode::BAD_REQUEST).into_response()
}

fn invalid_name(name: &str) -> Option<axum::response::Response> {
    (!is_valid_container_name(name))
        .then(|| bad_request(&format!("invalid container name {name:?}")))
}

#[derive(Serialize)]
struct JobCreated {
    job_id: JobId,
}

fn job_created(id: JobId) -> axum::response::Response {
    (StatusCode::ACCEPTED, ApiResponse::ok(JobCreated { job_id: id })).into_response()
}

// ── Health & status ────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthBody {
    pub status: &'static str,
    pub containers_monitored: usize,
}

/// GET /health
pub async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    match state.store().list_containers() {
        Ok(records) => Json(HealthBody {
            status: "ok",
            containers_monitored: records.iter().filter(|r| r.monitored).count(),
        })
        .into_response(),
        Err(e) => state_error(e),
    }
}

/// GET /api/status
pub async fn status(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.runner.checker().status())
}

// ── Containers ─────────────────────────────────────────────────

/// A monitored container as served to the UI.
#[derive(Serialize)]
pub struct ContainerView {
    #[serde(flatten)]
    pub record: ContainerRecord,
    pub has_update: bool,
    pub changelog: Option<String>,
    /// Newest first, at most `history_limit` entries.
    pub history: Vec<HistoryEntry>,
}

/// GET /api/containers
pub async fn list_containers(State(state): State<ApiState>) -> impl IntoResponse {
    let store = state.store();
    let settings = match store.effective_settings(state.defaults()) {
        Ok(settings) => settings,
        Err(e) => return state_error(e),
    };
    let records = match store.list_containers() {
        Ok(records) => records,
        Err(e) => return state_error(e),
    };

    let mut views = Vec::new();
    for record in records.into_iter().filter(|r| r.monitored) {
        let mut history = match store.list_history(&record.name) {
            Ok(history) => history,
            Err(e) => return state_error(e),
        };
        history.truncate(settings.history_limit as usize);
        let changelog = state
            .changelogs
            .resolve(&record.image, record.params.changelog.as_deref());
        views.push(ContainerView {
            has_update: record.has_update(),
            changelog,
            history,
            record,
        });
    }
    views.sort_by_key(|v| (Reverse(v.has_update), v.record.name.clone()));
    ApiResponse::ok(views).into_response()
}

// ── Jobs ───────────────────────────────────────────────────────

/// POST /api/check
pub async fn trigger_check(State(state): State<ApiState>) -> impl IntoResponse {
    match state.runner.submit_check().await {
        Ok(id) => job_created(id),
        Err(e) => scheduler_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct UpdateRequest {
    pub container: String,
    pub tag: String,
}

/// POST /api/update
pub async fn trigger_update(
    State(state): State<ApiState>,
    body: Result<Json<UpdateRequest>, JsonRejection>,
) -> impl IntoResponse {
    let Json(req) = match body {
        Ok(body) => body,
        Err(e) => return bad_request(&e.body_text()),
    };
    if let Some(resp) = invalid_name(&req.container) {
        return resp;
    }
    let tag = req.tag.trim();
    if tag.is_empty() || tag.chars().any(char::is_whitespace) {
        return bad_request("tag must be a non-empty token");
    }

    match state.runner.submit_update(&req.container, tag).await {
        Ok(id) => {
            info!(container = %req.container, tag = %tag, job = %id, "update requested");
            job_created(id)
        }
        Err(e) => scheduler_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct RollbackRequest {
    pub container: String,
    #[serde(default)]
    pub tag: Option<String>,
}

/// POST /api/rollback
pub async fn trigger_rollback(
    State(state): State<ApiState>,
    body: Result<Json<RollbackRequest>, JsonRejection>,
) -> impl IntoResponse {
    let Json(req) = match body {
        Ok(body) => body,
        Err(e) => return bad_request(&e.body_text()),
    };
    if let Some(resp) = invalid_name(&req.container) {
        return resp;
    }
    let tag = req.tag.as_deref().map(str::trim).filter(|t| !t.is_empty());

    match state.runner.submit_rollback(&req.container, tag).await {
        Ok(id) => {
            info!(container = %req.container, tag = ?tag, job = %id, "rollback requested");
            job_created(id)
        }
        Err(e) => scheduler_error(e),
    }
}

/// GET /api/jobs/{id}
pub async fn get_job(State(state): State<ApiState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.runner.get(&id).await {
        Ok(job) => ApiResponse::ok(job).into_response(),
        Err(e) => scheduler_error(e),
    }
}

// ── Settings ───────────────────────────────────────────────────

#[derive(Serialize)]
pub struct SettingsView {
    /// Values in force.
    pub settings: Settings,
    /// Persisted overrides only.
    pub overrides: SettingsOverride,
    /// Values from the daemon's configuration.
    pub defaults: Settings,
}

fn settings_view(state: &ApiState, overrides: SettingsOverride) -> SettingsView {
    SettingsView {
        settings: overrides.apply(state.defaults()),
        overrides,
        defaults: state.defaults().clone(),
    }
}

/// GET /api/settings
pub async fn get_settings(State(state): State<ApiState>) -> impl IntoResponse {
    match state.store().settings_override() {
        Ok(overrides) => ApiResponse::ok(settings_view(&state, overrides)).into_response(),
        Err(e) => state_error(e),
    }
}

/// POST /api/settings
pub async fn update_settings(
    State(state): State<ApiState>,
    body: Result<Json<SettingsPatch>, JsonRejection>,
) -> impl IntoResponse {
    let Json(patch) = match body {
        Ok(body) => body,
        Err(e) => return bad_request(&e.body_text()),
    };
    match state.store().update_settings(&patch, state.defaults()) {
        Ok(overrides) => {
            info!(?patch, "settings updated");
            ApiResponse::ok(settings_view(&state, overrides)).into_response()
        }
        Err(e) => state_error(e),
    }
}

// ── History ────────────────────────────────────────────────────

/// GET /api/history/export
pub async fn export_history(State(state): State<ApiState>) -> impl IntoResponse {
    let doc = match state.store().export(state.defaults()) {
        Ok(doc) => doc,
        Err(e) => return state_error(e),
    };
    let filename = format!(
        "attachment; filename=\"dockup-history-{}.json\"",
        doc.exported_at.format("%Y%m%d")
    );
    ([(header::CONTENT_DISPOSITION, filename)], Json(doc)).into_response()
}

/// POST /api/history/import
pub async fn import_history(State(state): State<ApiState>, body: Bytes) -> impl IntoResponse {
    let result = HistoryDocument::from_slice(&body).and_then(|doc| state.store().import(&doc));
    match result {
        Ok(summary) => {
            info!(inserted = summary.inserted, skipped = summary.skipped, "history imported");
            ApiResponse::ok(summary).into_response()
        }
        Err(e) => {
            warn!(error = %e, "history import rejected");
            state_error(e)
        }
    }
}

/// GET /api/history/{container}
pub async fn container_history(
    State(state): State<ApiState>,
    Path(container): Path<String>,
) -> impl IntoResponse {
    if let Some(resp) = invalid_name(&container) {
        return resp;
    }
    match state.store().list_history(&container) {
        Ok(history) => ApiResponse::ok(history).into_response(),
        Err(e) => state_error(e),
    }
}

#[derive(Serialize)]
struct Purged {
    purged: usize,
}

/// DELETE /api/history/{container}
pub async fn purge_history(
    State(state): State<ApiState>,
    Path(container): Path<String>,
) -> impl IntoResponse {
    if let Some(resp) = invalid_name(&container) {
        return resp;
    }
    match state.store().purge_history(&container) {
        Ok(purged) => {
            info!(container = %container, purged, "history purged");
            ApiResponse::ok(Purged { purged }).into_response()
        }
        Err(e) => state_error(e),
    }
}
