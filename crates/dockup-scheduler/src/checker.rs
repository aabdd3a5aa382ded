//! Update checks: compare every monitored container with its registry.
//!
//! A registry failure is recorded on the one container it concerns and the
//! scan moves on; nothing short of the runtime or store being unavailable
//! aborts a check.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use dockup_registry::{ImageRef, TagSource, VersionError, pick_update, split_reference};
use dockup_rollout::{Orchestrator, ResolvedStrategy, StepLog};
use dockup_runtime::ContainerSnapshot;
use dockup_state::{ContainerRecord, ContainerStatus, Settings, StateResult};

use crate::error::SchedulerResult;

/// Timing of the periodic check, as served by the status endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CheckStatus {
    pub last_check: Option<DateTime<Utc>>,
    pub next_check: Option<DateTime<Utc>>,
    /// Effective check interval in seconds.
    pub interval: u64,
}

/// A newer eligible tag found for a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AvailableUpdate {
    pub container: String,
    pub current_tag: String,
    pub latest_tag: String,
    /// Not reported by the previous check.
    pub newly_found: bool,
}

/// Result of one pass over all monitored containers.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CheckSummary {
    pub checked: usize,
    /// Containers whose registry lookup failed.
    pub failed: usize,
    pub updates: Vec<AvailableUpdate>,
}

enum Verdict {
    Newer(String),
    Current,
    /// The running tag is not version-like.
    Unparseable,
    Failed(String),
}

pub struct Checker {
    orchestrator: Arc<Orchestrator>,
    tags: Arc<dyn TagSource>,
    status: RwLock<CheckStatus>,
    /// Serializes overlapping checks (scheduled tick vs. manual trigger).
    running: tokio::sync::Mutex<()>,
}

impl Checker {
    pub fn new(orchestrator: Arc<Orchestrator>, tags: Arc<dyn TagSource>) -> Self {
        let interval = orchestrator.config().defaults.check_interval;
        Self {
            orchestrator,
            tags,
            status: RwLock::new(CheckStatus {
                interval,
                ..Default::default()
            }),
            running: tokio::sync::Mutex::new(()),
        }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn status(&self) -> CheckStatus {
        self.status
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub(crate) fn set_schedule(&self, next_check: DateTime<Utc>, interval: u64) {
        let mut status = self.status.write().unwrap_or_else(|e| e.into_inner());
        status.next_check = Some(next_check);
        status.interval = interval;
    }

    /// Settings in force right now: stored overrides over the defaults.
    pub fn settings(&self) -> StateResult<Settings> {
        self.orchestrator
            .store()
            .effective_settings(&self.orchestrator.config().defaults)
    }

    /// Check every monitored container and record what was found.
    pub async fn check_all(&self, log: &dyn StepLog) -> SchedulerResult<CheckSummary> {
        let _running = self.running.lock().await;
        let settings = self.settings()?;
        let store = self.orchestrator.store();

        let monitored: Vec<(ContainerSnapshot, ResolvedStrategy)> = self
            .orchestrator
            .runtime()
            .list_containers()
            .await?
            .into_iter()
            .filter_map(|snapshot| {
                let resolved = self.orchestrator.resolve(&snapshot)?;
                Some((snapshot, resolved))
            })
            .collect();
        log.step(&format!("Checking {} monitored container(s)", monitored.len()));

        let mut summary = CheckSummary::default();
        let mut seen = HashSet::new();
        for (snapshot, resolved) in &monitored {
            seen.insert(snapshot.name.clone());
            if self.orchestrator.is_busy(&snapshot.name) {
                log.step(&format!("{}: operation in progress, skipped", snapshot.name));
                continue;
            }

            let record = self.observe(snapshot, resolved)?;
            summary.checked += 1;
            let verdict = self
                .verdict(snapshot, &record.current_tag, settings.allow_prerelease)
                .await;
            if let Some(update) = self.apply_verdict(&record, verdict, &mut summary, log)? {
                summary.updates.push(update);
            }
        }

        for record in store.list_containers()? {
            if record.monitored
                && !seen.contains(&record.name)
                && !self.orchestrator.is_busy(&record.name)
            {
                info!(container = %record.name, "no longer monitored");
                store.update_container(&record.name, |r| r.monitored = false)?;
            }
        }

        self.status
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .last_check = Some(Utc::now());
        info!(
            checked = summary.checked,
            updates = summary.updates.len(),
            failed = summary.failed,
            "update check finished"
        );
        Ok(summary)
    }

    /// Upsert the stored record from the live container.
    fn observe(
        &self,
        snapshot: &ContainerSnapshot,
        resolved: &ResolvedStrategy,
    ) -> StateResult<ContainerRecord> {
        let store = self.orchestrator.store();
        let (repository, tag, _) = split_reference(&snapshot.image);
        let tag = tag.unwrap_or("latest");

        let updated = store.update_container(&snapshot.name, |record| {
            record.image = repository.to_string();
            if record.current_tag != tag {
                // Changed outside dockup.
                record.current_tag = tag.to_string();
                record.latest_tag = None;
            }
            record.digest = snapshot.digest.clone();
            record.monitored = true;
            record.strategy = resolved.strategy.kind();
            record.params = resolved.params();
        })?;
        match updated {
            Some(record) => Ok(record),
            None => {
                debug!(container = %snapshot.name, "first observation");
                let mut record = ContainerRecord::observed(&snapshot.name, repository, tag);
                record.digest = snapshot.digest.clone();
                record.strategy = resolved.strategy.kind();
                record.params = resolved.params();
                store.put_container(&record)?;
                Ok(record)
            }
        }
    }

    async fn verdict(&self, snapshot: &ContainerSnapshot, current: &str, allow_prerelease: bool) -> Verdict {
        let image = match ImageRef::parse(&snapshot.image) {
            Ok(image) => image,
            Err(e) => return Verdict::Failed(e.to_string()),
        };
        let tags = match self.tags.list_tags(&image).await {
            Ok(tags) => tags,
            Err(e) => return Verdict::Failed(e.to_string()),
        };
        match pick_update(current, tags.as_slice(), allow_prerelease) {
            Ok(Some(tag)) => Verdict::Newer(tag),
            Ok(None) => Verdict::Current,
            Err(VersionError::Unparseable(_)) => Verdict::Unparseable,
        }
    }

    fn apply_verdict(
        &self,
        record: &ContainerRecord,
        verdict: Verdict,
        summary: &mut CheckSummary,
        log: &dyn StepLog,
    ) -> StateResult<Option<AvailableUpdate>> {
        let name = record.name.as_str();
        let now = Utc::now();
        // A container awaiting manual intervention keeps its error status.
        let keep_error = record.status == ContainerStatus::Error;

        let (latest, status, detail, update) = match verdict {
            Verdict::Newer(tag) => {
                log.step(&format!("{name}: {tag} available (running {})", record.current_tag));
                let update = AvailableUpdate {
                    container: name.to_string(),
                    current_tag: record.current_tag.clone(),
                    latest_tag: tag.clone(),
                    newly_found: record.latest_tag.as_deref() != Some(tag.as_str()),
                };
                (Some(tag), ContainerStatus::UpdateAvailable, None, Some(update))
            }
            Verdict::Current => {
                log.step(&format!("{name}: up to date on {}", record.current_tag));
                (None, ContainerStatus::UpToDate, None, None)
            }
            Verdict::Unparseable => {
                info!(container = %name, tag = %record.current_tag, "running tag is not a version, updates not suggested");
                log.step(&format!(
                    "{name}: tag {} is not a version, no updates suggested",
                    record.current_tag
                ));
                let detail = format!("tag {} is not a version", record.current_tag);
                (None, ContainerStatus::Unknown, Some(detail), None)
            }
            Verdict::Failed(error) => {
                warn!(container = %name, %error, "registry lookup failed");
                log.step(&format!("{name}: registry lookup failed: {error}"));
                summary.failed += 1;
                self.orchestrator.store().update_container(name, |r| {
                    if superseded(record, r) {
                        return;
                    }
                    r.last_checked = Some(now);
                    if !keep_error {
                        r.status_detail = Some(format!("registry: {error}"));
                    }
                })?;
                return Ok(None);
            }
        };

        let mut stale = false;
        self.orchestrator.store().update_container(name, |r| {
            if superseded(record, r) {
                stale = true;
                return;
            }
            r.last_checked = Some(now);
            r.latest_tag = latest;
            if !keep_error {
                r.status = status;
                r.status_detail = detail;
            }
        })?;
        if stale {
            debug!(container = %name, "record changed during the registry lookup, result dropped");
            return Ok(None);
        }
        Ok(update)
    }
}

/// An update or rollback touched the record while its tags were being fetched.
fn superseded(observed: &ContainerRecord, stored: &ContainerRecord) -> bool {
    stored.current_tag != observed.current_tag
        || matches!(
            stored.status,
            ContainerStatus::Updating | ContainerStatus::RollingBack
        )
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use dockup_registry::{RegistryError, RegistryResult};
    use dockup_rollout::{NoopNotifier, OrchestratorConfig};
    use dockup_runtime::{ContainerSpec, MemoryRuntime};
    use dockup_state::{SettingsPatch, StateStore};
    use tokio::sync::Notify;

    use super::*;

    /// Tag lists keyed by repository path; unknown paths fail.
    #[derive(Default)]
    pub(crate) struct StaticTags(pub Mutex<HashMap<String, Vec<String>>>);

    impl StaticTags {
        pub(crate) fn with(pairs: &[(&str, &[&str])]) -> Self {
            let map = pairs
                .iter()
                .map(|(path, tags)| {
                    (path.to_string(), tags.iter().map(|t| t.to_string()).collect())
                })
                .collect();
            Self(Mutex::new(map))
        }
    }

    #[async_trait]
    impl TagSource for StaticTags {
        async fn list_tags(&self, image: &ImageRef) -> RegistryResult<Vec<String>> {
            self.0
                .lock()
                .unwrap()
                .get(&image.path())
                .cloned()
                .ok_or_else(|| RegistryError::Network(format!("{} unreachable", image.path())))
        }
    }

    #[derive(Default)]
    pub(crate) struct Lines(pub Mutex<Vec<String>>);

    impl StepLog for Lines {
        fn step(&self, message: &str) {
            self.0.lock().unwrap().push(message.to_string());
        }
    }

    pub(crate) fn monitored(name: &str, image: &str) -> ContainerSpec {
        ContainerSpec {
            name: name.to_string(),
            image: image.to_string(),
            labels: HashMap::from([("dockup.enable".to_string(), "true".to_string())]),
            ..Default::default()
        }
    }

    fn checker(rt: MemoryRuntime, tags: StaticTags) -> Checker {
        checker_with(rt, Arc::new(tags))
    }

    fn checker_with(rt: MemoryRuntime, tags: Arc<dyn TagSource>) -> Checker {
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::new(rt),
            StateStore::open_in_memory().unwrap(),
            Arc::new(NoopNotifier),
            OrchestratorConfig::default(),
        ));
        Checker::new(orchestrator, tags)
    }

    /// Holds `list_tags` open until released.
    struct HeldTags {
        tags: Vec<String>,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl TagSource for HeldTags {
        async fn list_tags(&self, _image: &ImageRef) -> RegistryResult<Vec<String>> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(self.tags.clone())
        }
    }

    fn record(checker: &Checker, name: &str) -> ContainerRecord {
        checker
            .orchestrator()
            .store()
            .get_container(name)
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn finds_updates_and_isolates_failures() {
        let rt = MemoryRuntime::new();
        rt.add_container(monitored("radarr", "lscr.io/linuxserver/radarr:5.2.1"));
        rt.add_container(monitored("immich", "ghcr.io/immich-app/immich-server:v1.2.0"));
        rt.add_container(monitored("broken", "ghcr.io/acme/broken:1.0.0"));
        rt.add_container(ContainerSpec {
            name: "db".to_string(),
            image: "postgres:16".to_string(),
            ..Default::default()
        });
        let tags = StaticTags::with(&[
            ("linuxserver/radarr", &["5.2.1", "5.3.0", "5.4.0-beta1", "latest"]),
            ("immich-app/immich-server", &["v1.2.0", "v1.1.0"]),
        ]);
        let checker = checker(rt, tags);
        let lines = Lines::default();

        let summary = checker.check_all(&lines).await.unwrap();

        assert_eq!(summary.checked, 3);
        assert_eq!(summary.failed, 1);
        assert_eq!(
            summary.updates,
            vec![AvailableUpdate {
                container: "radarr".to_string(),
                current_tag: "5.2.1".to_string(),
                latest_tag: "5.3.0".to_string(),
                newly_found: true,
            }]
        );

        let radarr = record(&checker, "radarr");
        assert_eq!(radarr.status, ContainerStatus::UpdateAvailable);
        assert_eq!(radarr.latest_tag.as_deref(), Some("5.3.0"));
        assert!(radarr.last_checked.is_some());

        assert_eq!(record(&checker, "immich").status, ContainerStatus::UpToDate);

        let broken = record(&checker, "broken");
        assert!(broken.status_detail.unwrap().contains("unreachable"));

        assert!(checker.orchestrator().store().get_container("db").unwrap().is_none());
        assert!(checker.status().last_check.is_some());
    }

    #[tokio::test]
    async fn second_check_does_not_report_known_update_as_new() {
        let rt = MemoryRuntime::new();
        rt.add_container(monitored("web", "nginx:1.25.0"));
        let checker = checker(rt, StaticTags::with(&[("library/nginx", &["1.25.0", "1.26.0"])]));

        let first = checker.check_all(&Lines::default()).await.unwrap();
        assert!(first.updates[0].newly_found);
        let second = checker.check_all(&Lines::default()).await.unwrap();
        assert!(!second.updates[0].newly_found);
    }

    #[tokio::test]
    async fn prerelease_setting_is_read_per_check() {
        let rt = MemoryRuntime::new();
        rt.add_container(monitored("web", "nginx:1.25.0"));
        let checker = checker(rt, StaticTags::with(&[("library/nginx", &["1.25.0", "1.26.0-rc1"])]));

        assert!(checker.check_all(&Lines::default()).await.unwrap().updates.is_empty());

        let defaults = checker.orchestrator().config().defaults.clone();
        checker
            .orchestrator()
            .store()
            .update_settings(
                &SettingsPatch {
                    allow_prerelease: Some(true),
                    ..Default::default()
                },
                &defaults,
            )
            .unwrap();
        let summary = checker.check_all(&Lines::default()).await.unwrap();
        assert_eq!(summary.updates[0].latest_tag, "1.26.0-rc1");
    }

    #[tokio::test]
    async fn unparseable_tag_suppresses_suggestions() {
        let rt = MemoryRuntime::new();
        rt.add_container(monitored("web", "nginx:mainline-alpine"));
        let checker = checker(rt, StaticTags::with(&[("library/nginx", &["1.27.0"])]));
        let lines = Lines::default();

        let summary = checker.check_all(&lines).await.unwrap();

        assert!(summary.updates.is_empty());
        assert_eq!(summary.failed, 0);
        let web = record(&checker, "web");
        assert_eq!(web.status, ContainerStatus::Unknown);
        assert!(web.status_detail.unwrap().contains("not a version"));
        assert!(lines.0.lock().unwrap().iter().any(|l| l.contains("not a version")));
    }

    #[tokio::test]
    async fn removed_label_marks_record_unmonitored() {
        let rt = MemoryRuntime::new();
        rt.add_container(monitored("web", "nginx:1.25.0"));
        let checker = checker(rt, StaticTags::with(&[("library/nginx", &["1.25.0"])]));
        checker.check_all(&Lines::default()).await.unwrap();
        assert!(record(&checker, "web").monitored);

        checker.orchestrator().runtime().remove("web").await.unwrap();
        checker.check_all(&Lines::default()).await.unwrap();
        assert!(!record(&checker, "web").monitored);
    }

    #[tokio::test]
    async fn error_status_survives_a_check() {
        let rt = MemoryRuntime::new();
        rt.add_container(monitored("web", "nginx:1.25.0"));
        let checker = checker(rt, StaticTags::with(&[("library/nginx", &["1.25.0", "1.26.0"])]));
        checker.check_all(&Lines::default()).await.unwrap();
        checker
            .orchestrator()
            .store()
            .update_container("web", |r| r.status = ContainerStatus::Error)
            .unwrap();

        checker.check_all(&Lines::default()).await.unwrap();
        let web = record(&checker, "web");
        assert_eq!(web.status, ContainerStatus::Error);
        assert_eq!(web.latest_tag.as_deref(), Some("1.26.0"));
    }

    #[tokio::test(start_paused = true)]
    async fn update_during_lookup_is_not_overwritten() {
        let rt = MemoryRuntime::new();
        rt.add_container(monitored("web", "nginx:1.25.0"));
        let tags = Arc::new(HeldTags {
            tags: vec!["1.25.0".to_string(), "1.26.0".to_string()],
            entered: Notify::new(),
            release: Notify::new(),
        });
        let checker = checker_with(rt, tags.clone());
        let orch = checker.orchestrator().clone();

        let lines = Lines::default();
        let check = checker.check_all(&lines);
        let update = async {
            tags.entered.notified().await;
            let guard = orch.begin("web").unwrap();
            orch.update(&guard, "1.26.0", &Lines::default()).await.unwrap();
            drop(guard);
            tags.release.notify_one();
        };
        let (summary, ()) = tokio::join!(check, update);
        let summary = summary.unwrap();

        assert!(summary.updates.is_empty());
        let web = record(&checker, "web");
        assert_eq!(web.current_tag, "1.26.0");
        assert_eq!(web.latest_tag, None);
        assert_ne!(web.status, ContainerStatus::UpdateAvailable);
    }
}
