//! dockup-scheduler: periodic update checks and asynchronous jobs.
//!
//! ```text
//! Scheduler (timer, interval re-read every tick)
//!   └── JobRunner
//!       ├── check jobs    → Checker (registry lookups, status updates)
//!       │                   └── auto-update → update jobs
//!       └── update / rollback jobs → Orchestrator
//! ```
//!
//! Every job has a pollable, append-only log and is persisted at each
//! status change so finished jobs outlive a restart.

pub mod checker;
pub mod error;
pub mod jobs;
pub mod scheduler;

pub use checker::{AvailableUpdate, CheckStatus, CheckSummary, Checker};
pub use error::{SchedulerError, SchedulerResult};
pub use jobs::{JobRunner, MAX_JOBS};
pub use scheduler::Scheduler;
