//! dockup-rollout: applying and rolling back container updates.
//!
//! # Components
//!
//! - **`strategy`**: derives how a container is updated from its labels
//! - **`files`**: in-place compose and env file edits
//! - **`controller`**: the pull, recreate, health-gate, commit/revert state machine
//! - **`lock`**: one operation per container at a time
//! - **`notify`**: ntfy delivery of update results

pub mod controller;
pub mod error;
pub mod files;
pub mod lock;
pub mod notify;
pub mod strategy;

pub use controller::{
    OperationKind, OperationOutcome, OperationPhase, OperationReport, Orchestrator,
    OrchestratorConfig, StepLog,
};
pub use error::{FileEditError, NotifyError, OrchestratorError, OrchestratorResult};
pub use files::{ComposeEdit, set_compose_tag, set_env_var};
pub use lock::{OperationGuard, OperationLocks};
pub use notify::{NoopNotifier, Notification, Notifier, NtfyConfig, NtfyNotifier, Priority, deliver};
pub use strategy::{ResolvedStrategy, Strategy, StrategyConfig, StrategySource, resolve};
