//! Update controller: drives one container through the apply state machine.
//!
//! ```text
//! Idle → Pulling → Recreating → AwaitingHealth → Committed
//!          │           │              │
//!          ▼           ▼              ▼
//!        Failed   Failed (original  RevertRecreating → RevertAwaitingHealth → Reverted
//!                  restored)                │                   │
//!                                           ▼                   ▼
//!                                         Failed              Failed
//! ```
//!
//! A failed pull leaves the running container untouched. A failed recreate
//! restores the captured original. A failed health gate reverts to the
//! prior tag without re-pulling it. Only `Committed` and `Reverted` write
//! history, so the stored `current_tag` always names a container that was
//! last seen healthy.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use dockup_health::{GateConfig, HealthGate, HealthVerdict};
use dockup_registry::split_reference;
use dockup_runtime::{ContainerRuntime, ContainerSnapshot, ContainerSpec, RuntimeError};
use dockup_state::{
    ContainerRecord, ContainerStatus, HistoryEntry, Outcome, Settings, StateStore,
};

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::files::{self, ComposeEdit};
use crate::lock::{OperationGuard, OperationLocks};
use crate::notify::{Notification, Notifier, Priority, deliver};
use crate::strategy::{ResolvedStrategy, Strategy, StrategyConfig, resolve};

/// Receives the human-readable steps of an operation as they happen.
pub trait StepLog: Send + Sync {
    fn step(&self, message: &str);
}

/// Phase of an update or rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationPhase {
    Idle,
    Pulling,
    Recreating,
    AwaitingHealth,
    Committed,
    RevertRecreating,
    RevertAwaitingHealth,
    Reverted,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Update,
    Rollback,
}

/// How a completed operation ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum OperationOutcome {
    /// The target tag is running and healthy.
    Committed,
    /// The target failed its health gate; the prior tag is running again.
    Reverted { reason: String },
}

/// Summary of a finished operation.
#[derive(Debug, Clone, Serialize)]
pub struct OperationReport {
    pub container: String,
    pub kind: OperationKind,
    pub from_tag: String,
    pub to_tag: String,
    pub outcome: OperationOutcome,
    /// Every phase entered, in order.
    pub phases: Vec<OperationPhase>,
}

impl OperationReport {
    pub fn committed(&self) -> bool {
        self.outcome == OperationOutcome::Committed
    }
}

/// Orchestrator settings.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub strategy: StrategyConfig,
    pub gate: GateConfig,
    /// Distinct tags per container whose images are kept locally.
    pub image_retention: usize,
    /// Settings used where no override is stored.
    pub defaults: Settings,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyConfig::default(),
            gate: GateConfig::default(),
            image_retention: 2,
            defaults: Settings::default(),
        }
    }
}

/// In-flight operation state.
struct Operation<'a> {
    container: String,
    kind: OperationKind,
    repository: String,
    from_tag: String,
    to_tag: String,
    strategy: Strategy,
    /// Configuration of the container before the operation touched it.
    original: ContainerSpec,
    phases: Vec<OperationPhase>,
    log: &'a dyn StepLog,
}

impl Operation<'_> {
    fn enter(&mut self, phase: OperationPhase) {
        let from = self.phases.last().copied().unwrap_or(OperationPhase::Idle);
        debug!(container = %self.container, ?from, to = ?phase, "phase transition");
        self.phases.push(phase);
    }

    fn step(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        info!(container = %self.container, "{message}");
        self.log.step(message);
    }

    fn image(&self, tag: &str) -> String {
        format!("{}:{tag}", self.repository)
    }

    fn report(self, outcome: OperationOutcome) -> OperationReport {
        OperationReport {
            container: self.container,
            kind: self.kind,
            from_tag: self.from_tag,
            to_tag: self.to_tag,
            outcome,
            phases: self.phases,
        }
    }
}

/// Applies updates and rollbacks, one operation per container at a time.
pub struct Orchestrator {
    runtime: Arc<dyn ContainerRuntime>,
    store: StateStore,
    notifier: Arc<dyn Notifier>,
    gate: HealthGate,
    config: OrchestratorConfig,
    locks: OperationLocks,
}

impl Orchestrator {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        store: StateStore,
        notifier: Arc<dyn Notifier>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            runtime,
            store,
            notifier,
            gate: HealthGate::new(config.gate),
            config,
            locks: OperationLocks::new(),
        }
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.notifier
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Claim exclusive use of `container`. Fails immediately if another
    /// update or rollback holds it.
    pub fn begin(&self, container: &str) -> OrchestratorResult<OperationGuard> {
        self.locks.try_acquire(container)
    }

    pub fn is_busy(&self, container: &str) -> bool {
        self.locks.is_active(container)
    }

    /// Strategy of a live container, or `None` if it is not monitored.
    pub fn resolve(&self, snapshot: &ContainerSnapshot) -> Option<ResolvedStrategy> {
        resolve(&snapshot.name, &snapshot.labels, &self.config.strategy)
    }

    /// Move the guarded container to `tag`.
    pub async fn update(
        &self,
        guard: &OperationGuard,
        tag: &str,
        log: &dyn StepLog,
    ) -> OrchestratorResult<OperationReport> {
        let snapshot = self.inspect(guard.container()).await?;
        let op = self.prepare(snapshot, tag, OperationKind::Update, log)?;
        self.execute(op).await
    }

    /// Move the guarded container back to `tag`, or to the version before
    /// the current one when `tag` is `None`. Runs the same pull, recreate,
    /// and health gate pipeline as an update.
    pub async fn rollback(
        &self,
        guard: &OperationGuard,
        tag: Option<&str>,
        log: &dyn StepLog,
    ) -> OrchestratorResult<OperationReport> {
        let snapshot = self.inspect(guard.container()).await?;
        let target = match tag {
            Some(tag) => tag.to_string(),
            None => {
                let (_, current, _) = split_reference(&snapshot.image);
                self.rollback_target(&snapshot.name, current.unwrap_or("latest"))?
            }
        };
        let op = self.prepare(snapshot, &target, OperationKind::Rollback, log)?;
        self.execute(op).await
    }

    /// The tag recorded just before `current_tag` in the container's history.
    pub fn rollback_target(&self, container: &str, current_tag: &str) -> OrchestratorResult<String> {
        let history = self.store.list_history(container)?;
        let current_at = history.iter().position(|e| e.tag == current_tag);
        let older = match current_at {
            Some(i) => &history[i + 1..],
            None => &history[..],
        };
        if let Some(entry) = older.iter().find(|e| e.tag != current_tag) {
            return Ok(entry.tag.clone());
        }
        // History trimmed down to the current version: use what it replaced.
        history
            .iter()
            .filter(|e| e.tag == current_tag && e.outcome == Outcome::Success)
            .find_map(|e| e.replaced_tag.clone())
            .filter(|t| t != current_tag)
            .ok_or_else(|| OrchestratorError::NoPreviousVersion(container.to_string()))
    }

    async fn inspect(&self, name: &str) -> OrchestratorResult<ContainerSnapshot> {
        match self.runtime.inspect(name).await {
            Ok(snapshot) => Ok(snapshot),
            Err(RuntimeError::NotFound(_)) => {
                Err(OrchestratorError::ContainerNotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn prepare<'a>(
        &self,
        snapshot: ContainerSnapshot,
        target: &str,
        kind: OperationKind,
        log: &'a dyn StepLog,
    ) -> OrchestratorResult<Operation<'a>> {
        let resolved = self
            .resolve(&snapshot)
            .ok_or_else(|| OrchestratorError::NotMonitored(snapshot.name.clone()))?;
        let (repository, current, _) = split_reference(&snapshot.image);
        let current = current.unwrap_or("latest");
        if current == target {
            return Err(OrchestratorError::AlreadyAtTag {
                container: snapshot.name,
                tag: target.to_string(),
            });
        }

        if self.store.get_container(&snapshot.name)?.is_none() {
            let mut record = ContainerRecord::observed(&snapshot.name, repository, current);
            record.strategy = resolved.strategy.kind();
            record.params = resolved.params();
            record.digest = snapshot.digest.clone();
            self.store.put_container(&record)?;
        }

        Ok(Operation {
            container: snapshot.name,
            kind,
            repository: repository.to_string(),
            from_tag: current.to_string(),
            to_tag: target.to_string(),
            strategy: resolved.strategy,
            original: snapshot.spec,
            phases: Vec::new(),
            log,
        })
    }

    async fn execute(&self, mut op: Operation<'_>) -> OrchestratorResult<OperationReport> {
        let busy = match op.kind {
            OperationKind::Update => ContainerStatus::Updating,
            OperationKind::Rollback => ContainerStatus::RollingBack,
        };
        let prior = self
            .store
            .get_container(&op.container)?
            .map(|r| r.status)
            .unwrap_or_default();
        self.set_status(&op.container, busy, None)?;
        info!(
            container = %op.container,
            kind = ?op.kind,
            from = %op.from_tag,
            to = %op.to_tag,
            "operation started"
        );

        let container = op.container.clone();
        let result = self.drive(&mut op).await;
        match &result {
            Ok(_) => {}
            Err(e) if e.needs_intervention() => {
                self.set_status(&container, ContainerStatus::Error, Some(e.to_string()))?;
            }
            Err(e) => {
                warn!(container = %container, error = %e, "operation failed");
                self.set_status(&container, prior, Some(e.to_string()))?;
            }
        }
        result.map(|outcome| op.report(outcome))
    }

    async fn drive(&self, op: &mut Operation<'_>) -> OrchestratorResult<OperationOutcome> {
        op.enter(OperationPhase::Pulling);
        let target_image = op.image(&op.to_tag);
        op.step(format!("Pulling {target_image}"));
        if let Err(e) = self.runtime.pull(&target_image).await {
            op.enter(OperationPhase::Failed);
            op.step(format!("Pull failed: {e}"));
            return Err(OrchestratorError::Pull {
                image: target_image,
                message: e.to_string(),
            });
        }

        op.enter(OperationPhase::Recreating);
        self.edit_files(op, &op.to_tag);
        op.step(format!("Recreating {} with {target_image}", op.container));
        let replacement = op.original.with_image(&target_image);
        if let Err(e) = self.replace(&replacement).await {
            op.step(format!("Recreate failed: {e}; restoring original container"));
            self.edit_files(op, &op.from_tag);
            if let Err(restore) = self.restore(op).await {
                let err = OrchestratorError::RecoveryFailed {
                    container: op.container.clone(),
                    message: format!("{e}; restore: {restore}"),
                };
                return Err(self.intervention(op, err).await);
            }
            op.enter(OperationPhase::Failed);
            op.step(format!("Original container restored on {}", op.from_tag));
            return Err(OrchestratorError::Recreate {
                container: op.container.clone(),
                message: e.to_string(),
            });
        }

        op.enter(OperationPhase::AwaitingHealth);
        op.step(format!(
            "Waiting for {} to become healthy (timeout {}s)",
            op.container,
            self.gate.config().timeout.as_secs()
        ));
        let verdict = self.gate.wait(self.runtime.as_ref(), &op.container).await;
        if verdict.is_healthy() {
            return self.commit(op).await;
        }

        let reason = describe(&verdict);
        op.step(format!("Health check failed: {reason}; reverting to {}", op.from_tag));
        self.revert(op, reason).await
    }

    async fn commit(&self, op: &mut Operation<'_>) -> OrchestratorResult<OperationOutcome> {
        op.enter(OperationPhase::Committed);
        let digest = self.digest_of(&op.image(&op.to_tag)).await;
        let outcome = match op.kind {
            OperationKind::Update => Outcome::Success,
            OperationKind::Rollback => Outcome::RolledBack,
        };
        let entry = HistoryEntry::new(
            &op.container,
            &op.to_tag,
            digest.clone(),
            outcome,
            Some(op.from_tag.clone()),
        );
        self.record(&entry)?;

        let tag = op.to_tag.clone();
        self.store.update_container(&op.container, |record| {
            record.current_tag = tag.clone();
            record.digest = digest;
            if record.latest_tag.as_deref() == Some(tag.as_str()) {
                record.latest_tag = None;
            }
            record.status = settled_status(record);
            record.status_detail = None;
        })?;
        op.step(format!("{} is healthy on {}", op.container, op.to_tag));

        let notification = match op.kind {
            OperationKind::Update => Notification::new(
                format!("Updated: {}", op.container),
                format!("{}: {} -> {}", op.container, op.from_tag, op.to_tag),
            )
            .tag("white_check_mark"),
            OperationKind::Rollback => Notification::new(
                format!("Rolled back: {}", op.container),
                format!("{}: {} -> {}", op.container, op.from_tag, op.to_tag),
            )
            .tag("rewind"),
        };
        deliver(self.notifier.as_ref(), &notification).await;

        self.prune_images(op).await;
        Ok(OperationOutcome::Committed)
    }

    async fn revert(
        &self,
        op: &mut Operation<'_>,
        reason: String,
    ) -> OrchestratorResult<OperationOutcome> {
        op.enter(OperationPhase::RevertRecreating);
        self.edit_files(op, &op.from_tag);
        if let Err(e) = self.restore(op).await {
            let err = OrchestratorError::RevertFailed {
                container: op.container.clone(),
                message: format!("could not recreate {}: {e}", op.from_tag),
            };
            return Err(self.intervention(op, err).await);
        }

        op.enter(OperationPhase::RevertAwaitingHealth);
        let verdict = self.gate.wait(self.runtime.as_ref(), &op.container).await;
        if !verdict.is_healthy() {
            let err = OrchestratorError::RevertFailed {
                container: op.container.clone(),
                message: format!("{} is not healthy: {}", op.from_tag, describe(&verdict)),
            };
            return Err(self.intervention(op, err).await);
        }

        op.enter(OperationPhase::Reverted);
        let digest = self.digest_of(&op.image(&op.from_tag)).await;
        let entry = HistoryEntry::new(
            &op.container,
            &op.from_tag,
            digest.clone(),
            Outcome::RolledBack,
            Some(op.to_tag.clone()),
        );
        self.record(&entry)?;

        let detail = format!("update to {} rolled back: {reason}", op.to_tag);
        let tag = op.from_tag.clone();
        self.store.update_container(&op.container, |record| {
            record.current_tag = tag;
            record.digest = digest;
            record.status = settled_status(record);
            record.status_detail = Some(detail);
        })?;
        op.step(format!("Reverted {} to {}", op.container, op.from_tag));

        let notification = Notification::new(
            format!("Update Failed: {}", op.container),
            format!(
                "{}: {} failed its health check ({reason}); rolled back to {}",
                op.container, op.to_tag, op.from_tag
            ),
        )
        .priority(Priority::High)
        .tag("warning");
        deliver(self.notifier.as_ref(), &notification).await;

        Ok(OperationOutcome::Reverted { reason })
    }

    /// Log, notify, and hand back a terminal error that needs an operator.
    async fn intervention(&self, op: &mut Operation<'_>, err: OrchestratorError) -> OrchestratorError {
        op.enter(OperationPhase::Failed);
        error!(container = %op.container, error = %err, "MANUAL INTERVENTION REQUIRED");
        op.log.step(&err.to_string());
        let notification = Notification::new(
            format!("Manual intervention required: {}", op.container),
            err.to_string(),
        )
        .priority(Priority::Max)
        .tag("rotating_light");
        deliver(self.notifier.as_ref(), &notification).await;
        err
    }

    /// Stop and remove the running container, then create and start `spec`.
    async fn replace(&self, spec: &ContainerSpec) -> Result<(), RuntimeError> {
        self.runtime.stop(&spec.name).await?;
        self.runtime.remove(&spec.name).await?;
        self.runtime.create(spec).await?;
        self.runtime.start(&spec.name).await
    }

    /// Bring back the original container from its captured spec. The
    /// original image is still local, so nothing is pulled.
    async fn restore(&self, op: &Operation<'_>) -> Result<(), RuntimeError> {
        match self.runtime.remove(&op.container).await {
            Ok(()) | Err(RuntimeError::NotFound(_)) => {}
            Err(e) => warn!(container = %op.container, error = %e, "could not remove failed container"),
        }
        self.runtime.create(&op.original).await?;
        self.runtime.start(&op.container).await
    }

    /// Point the strategy's files at `tag`. Failures are logged, not fatal.
    fn edit_files(&self, op: &Operation<'_>, tag: &str) {
        if let Some((file, service)) = op.strategy.compose() {
            match files::set_compose_tag(file, service, tag) {
                Ok(ComposeEdit::Updated { .. }) => {
                    op.step(format!("Set {service} to {tag} in {}", file.display()));
                }
                Ok(ComposeEdit::Interpolated) => {
                    op.step(format!(
                        "{} interpolates the image of {service}; left unchanged",
                        file.display()
                    ));
                }
                Err(e) => {
                    warn!(container = %op.container, error = %e, "compose edit failed");
                    op.step(format!("Compose edit skipped: {e}"));
                }
            }
        }
        if let Some(var) = op.strategy.env_var() {
            let env_file = &self.config.strategy.env_file;
            match files::set_env_var(env_file, var, tag) {
                Ok(_) => op.step(format!("Set {var}={tag} in {}", env_file.display())),
                Err(e) => {
                    warn!(container = %op.container, error = %e, "env edit failed");
                    op.step(format!("Env edit skipped: {e}"));
                }
            }
        }
    }

    fn record(&self, entry: &HistoryEntry) -> OrchestratorResult<()> {
        let limit = self
            .store
            .effective_settings(&self.config.defaults)?
            .history_limit;
        let trimmed = self.store.record_history(entry, limit)?;
        debug!(container = %entry.container, tag = %entry.tag, trimmed, "history recorded");
        Ok(())
    }

    fn set_status(
        &self,
        name: &str,
        status: ContainerStatus,
        detail: Option<String>,
    ) -> OrchestratorResult<()> {
        self.store.update_container(name, |record| {
            record.status = status;
            record.status_detail = detail;
        })?;
        Ok(())
    }

    async fn digest_of(&self, image: &str) -> Option<String> {
        self.runtime.image_digest(image).await.unwrap_or_else(|e| {
            debug!(%image, error = %e, "digest unavailable");
            None
        })
    }

    /// Remove local images of tags that fell out of the retention window.
    /// The window counts distinct tags, newest first, across applied and
    /// replaced tags of the container's history.
    async fn prune_images(&self, op: &Operation<'_>) {
        let history = match self.store.list_history(&op.container) {
            Ok(history) => history,
            Err(e) => {
                warn!(container = %op.container, error = %e, "image pruning skipped");
                return;
            }
        };
        let mut tags: Vec<&str> = Vec::new();
        for entry in &history {
            for tag in std::iter::once(entry.tag.as_str()).chain(entry.replaced_tag.as_deref()) {
                if !tags.contains(&tag) {
                    tags.push(tag);
                }
            }
        }

        let keep = self.config.image_retention.max(2);
        for tag in tags.into_iter().skip(keep) {
            let image = op.image(tag);
            match self.runtime.remove_image(&image).await {
                Ok(()) => op.step(format!("Removed old image {image}")),
                Err(RuntimeError::NotFound(_)) => {}
                Err(e) => debug!(%image, error = %e, "old image kept"),
            }
        }
    }
}

fn settled_status(record: &ContainerRecord) -> ContainerStatus {
    if record.has_update() {
        ContainerStatus::UpdateAvailable
    } else {
        ContainerStatus::UpToDate
    }
}

fn describe(verdict: &HealthVerdict) -> String {
    match verdict {
        HealthVerdict::Healthy => "healthy".to_string(),
        HealthVerdict::Unhealthy { reason } => reason.clone(),
        HealthVerdict::TimedOut { last } => format!("timed out waiting for health (last: {last:?})"),
    }
}
