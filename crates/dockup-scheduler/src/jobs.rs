//! Asynchronous jobs with pollable, append-only logs.
//!
//! Submitting returns a job id at once; the work runs on its own task.
//! Update and rollback jobs claim the container lock before the id is
//! handed out, so a concurrent trigger for the same container is rejected
//! immediately instead of queuing.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tokio::sync::{RwLock, watch};
use tracing::{error, info, warn};

use dockup_rollout::{
    Notification, OperationGuard, OperationOutcome, OrchestratorError, StepLog, deliver,
};
use dockup_state::{JobId, JobKind, JobRecord, JobStatus, LogLine, Outcome};

use crate::checker::{AvailableUpdate, Checker};
use crate::error::{SchedulerError, SchedulerResult};

/// Jobs kept in memory and in the store.
pub const MAX_JOBS: usize = 200;

/// One job: its record behind a lock, plus a status channel for waiters.
struct Job {
    record: Mutex<JobRecord>,
    status: watch::Sender<JobStatus>,
}

impl Job {
    fn new(kind: JobKind, container: Option<&str>, target_tag: Option<&str>) -> Self {
        let record = JobRecord {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            container: container.map(str::to_string),
            target_tag: target_tag.map(str::to_string),
            status: JobStatus::Pending,
            log: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
        };
        let (status, _) = watch::channel(JobStatus::Pending);
        Self {
            record: Mutex::new(record),
            status,
        }
    }

    fn lock(&self) -> MutexGuard<'_, JobRecord> {
        self.record.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn id(&self) -> JobId {
        self.lock().id.clone()
    }

    fn snapshot(&self) -> JobRecord {
        self.lock().clone()
    }

    /// Append a timestamped line. Terminal jobs no longer grow.
    fn append(&self, message: &str) {
        let mut record = self.lock();
        if record.status.is_terminal() {
            return;
        }
        info!(job = %record.id, "{message}");
        record.log.push(LogLine {
            at: Utc::now(),
            message: message.to_string(),
        });
    }

    fn start(&self) -> JobRecord {
        let mut record = self.lock();
        if record.status == JobStatus::Pending {
            record.status = JobStatus::Running;
            record.started_at = Some(Utc::now());
            self.status.send_replace(JobStatus::Running);
        }
        record.clone()
    }

    /// Move to a terminal status. The first terminal status wins.
    fn finish(&self, error: Option<String>) -> JobRecord {
        let mut record = self.lock();
        if record.status.is_terminal() {
            return record.clone();
        }
        let now = Utc::now();
        let status = match &error {
            None => JobStatus::Succeeded,
            Some(message) => {
                warn!(job = %record.id, error = %message, "job failed");
                record.log.push(LogLine {
                    at: now,
                    message: format!("Failed: {message}"),
                });
                JobStatus::Failed
            }
        };
        record.status = status;
        record.finished_at = Some(now);
        record.error = error;
        self.status.send_replace(status);
        record.clone()
    }
}

impl StepLog for Job {
    fn step(&self, message: &str) {
        self.append(message);
    }
}

#[derive(Default)]
struct JobTable {
    by_id: HashMap<JobId, Arc<Job>>,
    /// Ids in submission order, oldest first.
    order: VecDeque<JobId>,
}

struct RunnerInner {
    checker: Arc<Checker>,
    jobs: RwLock<JobTable>,
}

/// Runs check, update, and rollback jobs.
#[derive(Clone)]
pub struct JobRunner {
    inner: Arc<RunnerInner>,
}

impl JobRunner {
    pub fn new(checker: Arc<Checker>) -> Self {
        Self {
            inner: Arc::new(RunnerInner {
                checker,
                jobs: RwLock::new(JobTable::default()),
            }),
        }
    }

    pub fn checker(&self) -> &Arc<Checker> {
        &self.inner.checker
    }

    /// Start a registry check of all monitored containers.
    pub async fn submit_check(&self) -> SchedulerResult<JobId> {
        let job = self.register(Job::new(JobKind::Check, None, None)).await;
        let runner = self.clone();
        let task_job = job.clone();
        tokio::spawn(async move { runner.run_check(task_job).await });
        Ok(job.id())
    }

    /// Start an update of `container` to `tag`.
    pub async fn submit_update(&self, container: &str, tag: &str) -> SchedulerResult<JobId> {
        let guard = self.orchestrator().begin(container)?;
        let job = self
            .register(Job::new(JobKind::Update, Some(container), Some(tag)))
            .await;
        let runner = self.clone();
        let task_job = job.clone();
        let tag = tag.to_string();
        tokio::spawn(async move { runner.run_update(task_job, guard, tag).await });
        Ok(job.id())
    }

    /// Start a rollback of `container`, to `tag` or to its previous version.
    pub async fn submit_rollback(
        &self,
        container: &str,
        tag: Option<&str>,
    ) -> SchedulerResult<JobId> {
        let guard = self.orchestrator().begin(container)?;
        let job = self
            .register(Job::new(JobKind::Rollback, Some(container), tag))
            .await;
        let runner = self.clone();
        let task_job = job.clone();
        let tag = tag.map(str::to_string);
        tokio::spawn(async move { runner.run_rollback(task_job, guard, tag).await });
        Ok(job.id())
    }

    /// Current snapshot of a job, from memory or, after a restart, the store.
    pub async fn get(&self, id: &str) -> SchedulerResult<JobRecord> {
        if let Some(job) = self.inner.jobs.read().await.by_id.get(id) {
            return Ok(job.snapshot());
        }
        self.orchestrator()
            .store()
            .get_job(id)?
            .ok_or_else(|| SchedulerError::JobNotFound(id.to_string()))
    }

    /// Wait until a job reaches a terminal status.
    pub async fn wait(&self, id: &str) -> SchedulerResult<JobRecord> {
        let job = self.inner.jobs.read().await.by_id.get(id).cloned();
        let Some(job) = job else {
            return self.get(id).await;
        };
        let mut status = job.status.subscribe();
        // The sender lives in `job`, so the channel cannot close here.
        let _ = status.wait_for(|s| s.is_terminal()).await;
        Ok(job.snapshot())
    }

    /// Persist the current snapshot of every unfinished job. Called on
    /// shutdown so their logs so far survive; the next start marks them
    /// failed.
    pub async fn flush(&self) -> usize {
        let jobs: Vec<Arc<Job>> = self.inner.jobs.read().await.by_id.values().cloned().collect();
        let mut flushed = 0;
        for job in jobs {
            let record = job.snapshot();
            if !record.status.is_terminal() {
                self.persist(&record);
                flushed += 1;
            }
        }
        flushed
    }

    fn orchestrator(&self) -> &dockup_rollout::Orchestrator {
        self.inner.checker.orchestrator()
    }

    async fn register(&self, job: Job) -> Arc<Job> {
        let job = Arc::new(job);
        let record = job.snapshot();
        self.persist(&record);
        info!(job = %record.id, kind = ?record.kind, container = ?record.container, "job submitted");

        let mut guard = self.inner.jobs.write().await;
        let table = &mut *guard;
        table.order.push_back(record.id.clone());
        table.by_id.insert(record.id, job.clone());

        // Evict the oldest finished jobs beyond the cap.
        let mut excess = table.by_id.len().saturating_sub(MAX_JOBS);
        let mut kept = VecDeque::with_capacity(table.order.len());
        while let Some(id) = table.order.pop_front() {
            let finished = table
                .by_id
                .get(&id)
                .is_some_and(|j| j.lock().status.is_terminal());
            if excess > 0 && finished {
                table.by_id.remove(&id);
                excess -= 1;
            } else {
                kept.push_back(id);
            }
        }
        table.order = kept;
        job
    }

    fn persist(&self, record: &JobRecord) {
        let store = self.orchestrator().store();
        if let Err(e) = store.put_job(record) {
            warn!(job = %record.id, error = %e, "could not persist job");
            return;
        }
        if record.status.is_terminal() {
            if let Err(e) = store.trim_jobs(MAX_JOBS) {
                warn!(error = %e, "could not trim stored jobs");
            }
        }
    }

    fn finish(&self, job: &Job, error: Option<String>) {
        let record = job.finish(error);
        info!(job = %record.id, status = ?record.status, "job finished");
        self.persist(&record);
    }

    async fn run_check(&self, job: Arc<Job>) {
        self.persist(&job.start());
        let checker = &self.inner.checker;

        let summary = match checker.check_all(job.as_ref()).await {
            Ok(summary) => summary,
            Err(e) => {
                error!(error = %e, "update check failed");
                self.finish(&job, Some(e.to_string()));
                return;
            }
        };
        job.append(&format!(
            "Checked {} container(s): {} update(s) available, {} lookup failure(s)",
            summary.checked,
            summary.updates.len(),
            summary.failed
        ));

        match checker.settings() {
            Ok(settings) if settings.auto_update => self.queue_updates(&job, &summary.updates).await,
            Ok(_) => self.announce(&summary.updates).await,
            Err(e) => job.append(&format!("Settings unavailable, no follow-up: {e}")),
        }
        self.finish(&job, None);
    }

    /// Auto-update: one update job per available update.
    async fn queue_updates(&self, job: &Job, updates: &[AvailableUpdate]) {
        for update in updates {
            if self.recently_reverted(&update.container, &update.latest_tag) {
                job.append(&format!(
                    "{}: {} was rolled back before, not retried automatically",
                    update.container, update.latest_tag
                ));
                continue;
            }
            match self.submit_update(&update.container, &update.latest_tag).await {
                Ok(id) => job.append(&format!(
                    "{}: queued update to {} (job {id})",
                    update.container, update.latest_tag
                )),
                Err(e) => job.append(&format!("{}: not queued: {e}", update.container)),
            }
        }
    }

    /// Whether the newest history entry is a revert away from `tag`.
    fn recently_reverted(&self, container: &str, tag: &str) -> bool {
        match self.orchestrator().store().list_history(container) {
            Ok(history) => history.first().is_some_and(|entry| {
                entry.outcome == Outcome::RolledBack && entry.replaced_tag.as_deref() == Some(tag)
            }),
            Err(e) => {
                warn!(container = %container, error = %e, "history unavailable");
                false
            }
        }
    }

    /// Summary notification of updates not reported before.
    async fn announce(&self, updates: &[AvailableUpdate]) {
        let fresh: Vec<&AvailableUpdate> = updates.iter().filter(|u| u.newly_found).collect();
        if fresh.is_empty() {
            return;
        }
        let body = fresh
            .iter()
            .map(|u| format!("- {}: {} -> {}", u.container, u.current_tag, u.latest_tag))
            .collect::<Vec<_>>()
            .join("\n");
        let notification =
            Notification::new(format!("{} update(s) available", fresh.len()), body).tag("package");
        deliver(self.orchestrator().notifier().as_ref(), &notification).await;
    }

    async fn run_update(&self, job: Arc<Job>, guard: OperationGuard, tag: String) {
        self.persist(&job.start());
        let result = self.orchestrator().update(&guard, &tag, job.as_ref()).await;
        drop(guard);
        self.conclude(&job, result);
    }

    async fn run_rollback(&self, job: Arc<Job>, guard: OperationGuard, tag: Option<String>) {
        self.persist(&job.start());
        let result = self
            .orchestrator()
            .rollback(&guard, tag.as_deref(), job.as_ref())
            .await;
        drop(guard);
        self.conclude(&job, result);
    }

    fn conclude(
        &self,
        job: &Job,
        result: Result<dockup_rollout::OperationReport, OrchestratorError>,
    ) {
        let error = match result {
            Ok(report) => match report.outcome {
                OperationOutcome::Committed => {
                    job.append(&format!(
                        "{} is now on {} (was {})",
                        report.container, report.to_tag, report.from_tag
                    ));
                    None
                }
                OperationOutcome::Reverted { reason } => Some(format!(
                    "{} failed its health check and was rolled back to {}: {reason}",
                    report.to_tag, report.from_tag
                )),
            },
            Err(e) => {
                if e.needs_intervention() {
                    error!(error = %e, "operation needs manual intervention");
                    job.append(&e.to_string());
                }
                Some(e.to_string())
            }
        };
        self.finish(job, error);
    }
}
