//! dockup-api: REST API for dockup.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/health` | Liveness and monitored container count |
//! | GET | `/api/status` | Last/next check time and interval |
//! | GET | `/api/containers` | Snapshots of monitored containers |
//! | POST | `/api/check` | Start a check job |
//! | POST | `/api/update` | Start an update job |
//! | POST | `/api/rollback` | Start a rollback job |
//! | GET | `/api/jobs/{id}` | Job status and log |
//! | GET/POST | `/api/settings` | Effective settings / partial update |
//! | GET | `/api/history/export` | History and settings document |
//! | POST | `/api/history/import` | Merge-import a document |
//! | GET/DELETE | `/api/history/{container}` | One container's history / purge |
//!
//! Update, rollback and check only enqueue a job; progress is polled
//! through `/api/jobs/{id}`.

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};

use dockup_registry::ChangelogResolver;
use dockup_scheduler::JobRunner;
use dockup_state::{Settings, StateStore};

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub runner: JobRunner,
    pub changelogs: Arc<ChangelogResolver>,
}

impl ApiState {
    pub fn new(runner: JobRunner, changelogs: ChangelogResolver) -> Self {
        Self {
            runner,
            changelogs: Arc::new(changelogs),
        }
    }

    fn store(&self) -> &StateStore {
        self.runner.checker().orchestrator().store()
    }

    fn defaults(&self) -> &Settings {
        &self.runner.checker().orchestrator().config().defaults
    }
}

/// Build the complete API router.
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/status", get(handlers::status))
        .route("/containers", get(handlers::list_containers))
        .route("/check", post(handlers::trigger_check))
        .route("/update", post(handlers::trigger_update))
        .route("/rollback", post(handlers::trigger_rollback))
        .route("/jobs/{id}", get(handlers::get_job))
        .route("/settings", get(handlers::get_settings).post(handlers::update_settings))
        .route("/history/export", get(handlers::export_history))
        .route("/history/import", post(handlers::import_history))
        .route(
            "/history/{container}",
            get(handlers::container_history).delete(handlers::purge_history),
        );

    Router::new()
        .route("/health", get(handlers::health))
        .nest("/api", api_routes)
        .with_state(state)
}
