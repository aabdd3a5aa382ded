//! Periodic update checks.
//!
//! One timer, re-armed after every tick with the interval in force at that
//! moment, so a settings change applies from the next tick on.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::checker::Checker;
use crate::jobs::JobRunner;

pub struct Scheduler {
    runner: JobRunner,
}

impl Scheduler {
    pub fn new(runner: JobRunner) -> Self {
        Self { runner }
    }

    fn checker(&self) -> &Arc<Checker> {
        self.runner.checker()
    }

    /// Interval in force now, falling back to the configured default.
    fn interval_secs(&self) -> u64 {
        match self.checker().settings() {
            Ok(settings) => settings.check_interval,
            Err(e) => {
                let fallback = self.checker().orchestrator().config().defaults.check_interval;
                warn!(error = %e, fallback, "settings unavailable, using default interval");
                fallback
            }
        }
    }

    async fn tick(&self) {
        match self.runner.submit_check().await {
            Ok(id) => info!(job = %id, "scheduled update check started"),
            Err(e) => error!(error = %e, "could not start scheduled check"),
        }
    }

    /// Run an initial check, then one per interval until `shutdown` flips.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval_secs(), "scheduler started");
        self.tick().await;

        loop {
            let secs = self.interval_secs();
            let next = Utc::now() + chrono::Duration::seconds(secs as i64);
            self.checker().set_schedule(next, secs);

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(secs)) => self.tick().await,
                _ = shutdown.changed() => {
                    info!("scheduler shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use dockup_rollout::{NoopNotifier, Orchestrator, OrchestratorConfig};
    use dockup_runtime::MemoryRuntime;
    use dockup_state::{JobKind, SettingsPatch, StateStore};

    use super::*;
    use crate::checker::tests::{StaticTags, monitored};

    fn runner(store: StateStore) -> JobRunner {
        let rt = MemoryRuntime::new();
        rt.add_container(monitored("web", "nginx:1.25.0"));
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::new(rt),
            store,
            Arc::new(NoopNotifier),
            OrchestratorConfig::default(),
        ));
        let tags = StaticTags::with(&[("library/nginx", &["1.25.0", "1.26.0"])]);
        JobRunner::new(Arc::new(Checker::new(orchestrator, Arc::new(tags))))
    }

    fn check_jobs(store: &StateStore) -> usize {
        store
            .list_jobs()
            .unwrap()
            .iter()
            .filter(|j| j.kind == JobKind::Check)
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn checks_at_start_and_every_interval() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .update_settings(
                &SettingsPatch {
                    check_interval: Some(600),
                    ..Default::default()
                },
                &Default::default(),
            )
            .unwrap();
        let runner = runner(store.clone());
        let checker = runner.checker().clone();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(Scheduler::new(runner).run(rx));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(check_jobs(&store), 1);
        let status = checker.status();
        assert_eq!(status.interval, 600);
        assert!(status.next_check.is_some());
        assert!(status.last_check.is_some());

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(check_jobs(&store), 2);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn interval_change_applies_on_next_tick() {
        let store = StateStore::open_in_memory().unwrap();
        let runner = runner(store.clone());
        let checker = runner.checker().clone();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(Scheduler::new(runner).run(rx));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(checker.status().interval, 21600);

        store
            .update_settings(
                &SettingsPatch {
                    check_interval: Some(120),
                    ..Default::default()
                },
                &Default::default(),
            )
            .unwrap();
        tokio::time::sleep(Duration::from_secs(21600)).await;
        assert_eq!(checker.status().interval, 120);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(check_jobs(&store), 3);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
