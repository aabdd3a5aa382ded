//! Health gate polling logic.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Consecutive `NotRunning` polls before the container counts as exited.
const NOT_RUNNING_POLLS: u32 = 2;

use dockup_runtime::{ContainerRuntime, HealthState, RuntimeError};

/// Outcome of gating one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum HealthVerdict {
    Healthy,
    /// The container reported unhealthy, exited, or disappeared.
    Unhealthy { reason: String },
    /// No decisive signal before the deadline.
    TimedOut { last: HealthState },
}

impl HealthVerdict {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

/// Polling parameters.
#[derive(Debug, Clone, Copy)]
pub struct GateConfig {
    pub poll_interval: Duration,
    pub timeout: Duration,
    /// How long a container without a health check must stay up.
    pub grace: Duration,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            timeout: Duration::from_secs(60),
            grace: Duration::from_secs(5),
        }
    }
}

impl GateConfig {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }
}

/// Bounded health poller.
#[derive(Debug, Clone, Copy, Default)]
pub struct HealthGate {
    config: GateConfig,
}

impl HealthGate {
    pub fn new(config: GateConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    /// Poll `name` until a verdict is reached. Never exceeds the timeout
    /// by more than one poll interval.
    pub async fn wait(&self, runtime: &dyn ContainerRuntime, name: &str) -> HealthVerdict {
        let deadline = Instant::now() + self.config.timeout;
        let mut last = HealthState::Starting;
        let mut stopped = 0;

        loop {
            let state = match runtime.health(name).await {
                Ok(state) => state,
                Err(RuntimeError::NotFound(_)) => {
                    return HealthVerdict::Unhealthy {
                        reason: format!("container {name} no longer exists"),
                    };
                }
                Err(e) => {
                    warn!(container = %name, error = %e, "health probe failed");
                    last
                }
            };
            debug!(container = %name, ?state, "health probe");
            last = state;

            match state {
                HealthState::Healthy => return HealthVerdict::Healthy,
                HealthState::Unhealthy => {
                    return HealthVerdict::Unhealthy {
                        reason: "health check reported unhealthy".to_string(),
                    };
                }
                HealthState::NoHealthcheck => return self.grace(runtime, name, deadline).await,
                HealthState::NotRunning => {
                    stopped += 1;
                    if stopped >= NOT_RUNNING_POLLS {
                        return HealthVerdict::Unhealthy {
                            reason: "container is not running".to_string(),
                        };
                    }
                }
                HealthState::Starting => stopped = 0,
            }

            let now = Instant::now();
            if now >= deadline {
                return HealthVerdict::TimedOut { last };
            }
            tokio::time::sleep(self.config.poll_interval.min(deadline - now)).await;
        }
    }

    /// No health check declared: healthy if still running after the grace period.
    async fn grace(
        &self,
        runtime: &dyn ContainerRuntime,
        name: &str,
        deadline: Instant,
    ) -> HealthVerdict {
        let remaining = deadline.saturating_duration_since(Instant::now());
        tokio::time::sleep(self.config.grace.min(remaining)).await;

        match runtime.health(name).await {
            Ok(HealthState::NotRunning) => HealthVerdict::Unhealthy {
                reason: "container exited during grace period".to_string(),
            },
            Ok(HealthState::Unhealthy) => HealthVerdict::Unhealthy {
                reason: "health check reported unhealthy".to_string(),
            },
            Ok(_) => HealthVerdict::Healthy,
            Err(e) => HealthVerdict::Unhealthy {
                reason: e.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dockup_runtime::{ContainerSpec, MemoryRuntime};

    fn runtime_with(image: &str, script: Vec<HealthState>) -> MemoryRuntime {
        let rt = MemoryRuntime::new();
        rt.add_container(ContainerSpec {
            name: "app".to_string(),
            image: image.to_string(),
            ..Default::default()
        });
        if !script.is_empty() {
            rt.set_health(image, script);
        }
        rt
    }

    fn gate(timeout_secs: u64) -> HealthGate {
        HealthGate::new(GateConfig::with_timeout(Duration::from_secs(timeout_secs)))
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_after_starting() {
        let rt = runtime_with(
            "app:2",
            vec![HealthState::Starting, HealthState::Starting, HealthState::Healthy],
        );
        let started = Instant::now();
        assert_eq!(gate(60).wait(&rt, "app").await, HealthVerdict::Healthy);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(4) && elapsed < Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_unhealthy_stops_polling() {
        let rt = runtime_with("app:2", vec![HealthState::Starting, HealthState::Unhealthy]);
        let verdict = gate(60).wait(&rt, "app").await;
        assert!(matches!(verdict, HealthVerdict::Unhealthy { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_within_bound() {
        let rt = runtime_with("app:2", vec![HealthState::Starting]);
        let started = Instant::now();
        let verdict = gate(10).wait(&rt, "app").await;
        assert_eq!(
            verdict,
            HealthVerdict::TimedOut {
                last: HealthState::Starting
            }
        );
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(10) && elapsed < Duration::from_secs(11));
    }

    #[tokio::test(start_paused = true)]
    async fn exited_container_fails_fast() {
        let rt = runtime_with("app:2", vec![HealthState::NotRunning]);
        let started = Instant::now();
        assert_eq!(
            gate(60).wait(&rt, "app").await,
            HealthVerdict::Unhealthy {
                reason: "container is not running".to_string()
            }
        );
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn single_not_running_poll_is_tolerated() {
        let rt = runtime_with("app:2", vec![HealthState::NotRunning, HealthState::Healthy]);
        assert_eq!(gate(60).wait(&rt, "app").await, HealthVerdict::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn no_healthcheck_is_healthy_after_grace() {
        let rt = runtime_with("app:2", Vec::new());
        let started = Instant::now();
        assert_eq!(gate(60).wait(&rt, "app").await, HealthVerdict::Healthy);
        assert!(started.elapsed() >= GateConfig::default().grace);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_container_is_unhealthy() {
        let rt = MemoryRuntime::new();
        let verdict = gate(60).wait(&rt, "ghost").await;
        assert!(matches!(verdict, HealthVerdict::Unhealthy { .. }));
    }

    #[test]
    fn verdict_serializes_with_tag() {
        let json = serde_json::to_value(HealthVerdict::TimedOut {
            last: HealthState::Starting,
        })
        .unwrap();
        assert_eq!(json["verdict"], "timed_out");
        assert_eq!(json["last"], "starting");
    }
}
