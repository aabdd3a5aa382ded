//! Daemon lifecycle: everything that lives between start and stop.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use dockup_api::{ApiState, build_router};
use dockup_registry::{ChangelogResolver, RegistryClient, TagSource};
use dockup_rollout::{NoopNotifier, Notifier, NtfyNotifier, Orchestrator, OrchestratorConfig};
use dockup_runtime::{ContainerRuntime, DockerRuntime};
use dockup_scheduler::{Checker, JobRunner, Scheduler};
use dockup_state::StateStore;

use crate::config::Config;

/// The outside world the daemon talks to.
pub struct Collaborators {
    pub runtime: Arc<dyn ContainerRuntime>,
    pub tags: Arc<dyn TagSource>,
    pub notifier: Arc<dyn Notifier>,
}

impl Collaborators {
    /// Docker, the public registries and, if configured, ntfy.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let runtime = DockerRuntime::connect().context("connecting to docker")?;
        let tags = RegistryClient::new(config.github_token.clone().filter(|t| !t.is_empty()))
            .context("building registry client")?;
        let notifier: Arc<dyn Notifier> = match config.ntfy() {
            Some(ntfy) => {
                info!(endpoint = %ntfy.endpoint, topic = %ntfy.topic, "ntfy notifications enabled");
                Arc::new(NtfyNotifier::new(ntfy).context("building ntfy client")?)
            }
            None => {
                info!("no ntfy endpoint, notifications disabled");
                Arc::new(NoopNotifier)
            }
        };
        Ok(Self {
            runtime: Arc::new(runtime),
            tags: Arc::new(tags),
            notifier,
        })
    }
}

/// A running dockup instance.
pub struct Daemon {
    store: StateStore,
    runner: JobRunner,
    changelogs: ChangelogResolver,
    shutdown: watch::Sender<bool>,
    scheduler: JoinHandle<()>,
}

impl Daemon {
    /// Open the store at `db_path`, creating its directory if needed.
    pub fn open_store(db_path: &Path) -> anyhow::Result<StateStore> {
        if let Some(dir) = db_path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        let store = StateStore::open(db_path)
            .with_context(|| format!("opening {}", db_path.display()))?;
        info!(path = %db_path.display(), "state store opened");
        Ok(store)
    }

    /// Recover from the previous run and start the check timer.
    pub fn start(
        store: StateStore,
        collaborators: Collaborators,
        config: OrchestratorConfig,
        changelogs: ChangelogResolver,
    ) -> anyhow::Result<Self> {
        let interrupted = store.fail_interrupted_jobs()?;
        if interrupted > 0 {
            warn!(count = interrupted, "jobs interrupted by the last shutdown marked failed");
        }
        let settings = store.effective_settings(&config.defaults)?;
        info!(
            check_interval = settings.check_interval,
            history_limit = settings.history_limit,
            allow_prerelease = settings.allow_prerelease,
            auto_update = settings.auto_update,
            "effective settings"
        );

        let orchestrator = Arc::new(Orchestrator::new(
            collaborators.runtime,
            store.clone(),
            collaborators.notifier,
            config,
        ));
        let checker = Arc::new(Checker::new(orchestrator, collaborators.tags));
        let runner = JobRunner::new(checker);

        let (shutdown, shutdown_rx) = watch::channel(false);
        let scheduler = tokio::spawn(Scheduler::new(runner.clone()).run(shutdown_rx));

        Ok(Self {
            store,
            runner,
            changelogs,
            shutdown,
            scheduler,
        })
    }

    pub fn runner(&self) -> &JobRunner {
        &self.runner
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn router(&self) -> Router {
        build_router(ApiState::new(self.runner.clone(), self.changelogs.clone()))
    }

    /// Cancel the timer, persist unfinished jobs and close the store.
    pub async fn stop(self) -> anyhow::Result<()> {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.scheduler.await {
            warn!(error = %e, "scheduler task ended abnormally");
        }
        let flushed = self.runner.flush().await;
        if flushed > 0 {
            warn!(count = flushed, "unfinished jobs persisted at shutdown");
        }
        drop(self.runner);
        drop(self.store);
        info!("state store closed");
        Ok(())
    }
}
