//! End-to-end daemon lifecycle against the in-memory runtime.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use serde_json::{Value, json};
use tower::ServiceExt;

use dockup_registry::{ChangelogResolver, ImageRef, RegistryError, RegistryResult, TagSource};
use dockup_rollout::{NoopNotifier, OrchestratorConfig};
use dockup_runtime::{ContainerSpec, MemoryRuntime};
use dockup_state::{JobKind, JobRecord, JobStatus, Outcome};
use dockupd::{Collaborators, Daemon};

struct Tags(HashMap<String, Vec<String>>);

#[async_trait]
impl TagSource for Tags {
    async fn list_tags(&self, image: &ImageRef) -> RegistryResult<Vec<String>> {
        self.0
            .get(&image.path())
            .cloned()
            .ok_or_else(|| RegistryError::Network("unreachable".to_string()))
    }
}

fn runtime() -> Arc<MemoryRuntime> {
    let rt = Arc::new(MemoryRuntime::new());
    rt.add_container(ContainerSpec {
        name: "radarr".to_string(),
        image: "lscr.io/linuxserver/radarr:5.2.1".to_string(),
        labels: HashMap::from([("dockup.enable".to_string(), "true".to_string())]),
        ..Default::default()
    });
    rt
}

fn start(db: &std::path::Path, rt: Arc<MemoryRuntime>) -> Daemon {
    let tags = Tags(HashMap::from([(
        "linuxserver/radarr".to_string(),
        vec!["5.2.1".to_string(), "5.3.0".to_string()],
    )]));
    let store = Daemon::open_store(db).unwrap();
    Daemon::start(
        store,
        Collaborators {
            runtime: rt,
            tags: Arc::new(tags),
            notifier: Arc::new(NoopNotifier),
        },
        OrchestratorConfig::default(),
        ChangelogResolver::default(),
    )
    .unwrap()
}

async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let body = body.map_or_else(Body::empty, |v| Body::from(v.to_string()));
    let req = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(body)
        .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

#[tokio::test(start_paused = true)]
async fn update_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("data").join("versions.redb");
    let rt = runtime();

    let daemon = start(&db, rt.clone());
    let app = daemon.router();

    let (_, body) = call(&app, "POST", "/api/check", None).await;
    let check = body["data"]["job_id"].as_str().unwrap().to_string();
    daemon.runner().wait(&check).await.unwrap();
    let (_, containers) = call(&app, "GET", "/api/containers", None).await;
    assert_eq!(containers["data"][0]["latest_tag"], "5.3.0");

    let (status, body) = call(
        &app,
        "POST",
        "/api/update",
        Some(json!({"container": "radarr", "tag": "5.3.0"})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let update = body["data"]["job_id"].as_str().unwrap().to_string();
    let job = daemon.runner().wait(&update).await.unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);

    // The router shares the store; release it before reopening the file.
    drop(app);
    daemon.stop().await.unwrap();

    // Same database, fresh process.
    let daemon = start(&db, rt.clone());
    let app = daemon.router();

    let (status, job) = call(&app, "GET", &format!("/api/jobs/{update}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(job["data"]["status"], "succeeded");

    let history = daemon.store().list_history("radarr").unwrap();
    assert_eq!(history[0].tag, "5.3.0");
    assert_eq!(history[0].outcome, Outcome::Success);
    assert_eq!(history[0].replaced_tag.as_deref(), Some("5.2.1"));

    let (_, containers) = call(&app, "GET", "/api/containers", None).await;
    assert_eq!(containers["data"][0]["current_tag"], "5.3.0");
    assert_eq!(containers["data"][0]["has_update"], false);

    daemon.stop().await.unwrap();
}

#[tokio::test]
async fn unfinished_jobs_are_failed_on_start() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("versions.redb");
    {
        let store = Daemon::open_store(&db).unwrap();
        store
            .put_job(&JobRecord {
                id: "stale".to_string(),
                kind: JobKind::Update,
                container: Some("radarr".to_string()),
                target_tag: Some("5.3.0".to_string()),
                status: JobStatus::Running,
                log: Vec::new(),
                created_at: chrono::Utc::now(),
                started_at: None,
                finished_at: None,
                error: None,
            })
            .unwrap();
    }

    let daemon = start(&db, runtime());
    let job = daemon.runner().get("stale").await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(
        job.log
            .iter()
            .any(|l| l.message.contains("interrupted by shutdown"))
    );
    daemon.stop().await.unwrap();
}
