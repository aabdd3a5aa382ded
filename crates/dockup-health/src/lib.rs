//! dockup-health: post-update health gating.
//!
//! After a container is recreated, the orchestrator asks the
//! [`HealthGate`] whether the new container may be committed. The gate
//! polls the runtime at a fixed interval and always returns within the
//! configured timeout.
//!
//! # Decision table
//!
//! ```text
//! runtime reports      gate does
//! ─────────────────    ──────────────────────────────────────────────
//! healthy              → Healthy
//! unhealthy            → Unhealthy
//! starting             → keep polling
//! not running once     → keep polling (restart policies may revive it)
//! not running twice    → Unhealthy
//! no health check      → wait the grace period, then Healthy if still
//!                        running, Unhealthy if it exited
//! deadline reached     → TimedOut
//! ```

pub mod checker;

pub use checker::{GateConfig, HealthGate, HealthVerdict};
