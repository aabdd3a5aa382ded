//! Per-container operation exclusion.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{OrchestratorError, OrchestratorResult};

/// Set of containers with an update or rollback in flight.
#[derive(Debug, Clone, Default)]
pub struct OperationLocks {
    active: Arc<Mutex<HashSet<String>>>,
}

impl OperationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claim `container`, failing at once if another operation holds it.
    pub fn try_acquire(&self, container: &str) -> OrchestratorResult<OperationGuard> {
        if !self.lock().insert(container.to_string()) {
            return Err(OrchestratorError::OperationInProgress(container.to_string()));
        }
        Ok(OperationGuard {
            container: container.to_string(),
            locks: self.clone(),
        })
    }

    pub fn is_active(&self, container: &str) -> bool {
        self.lock().contains(container)
    }
}

/// Held for the duration of one operation; releases the container on drop.
#[derive(Debug)]
pub struct OperationGuard {
    container: String,
    locks: OperationLocks,
}

impl OperationGuard {
    pub fn container(&self) -> &str {
        &self.container
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.locks.lock().remove(&self.container);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_is_rejected_until_release() {
        let locks = OperationLocks::new();
        let guard = locks.try_acquire("radarr").unwrap();
        assert!(locks.is_active("radarr"));
        assert!(matches!(
            locks.try_acquire("radarr"),
            Err(OrchestratorError::OperationInProgress(name)) if name == "radarr"
        ));

        // Other containers are independent.
        let other = locks.try_acquire("sonarr").unwrap();
        assert_eq!(other.container(), "sonarr");

        drop(guard);
        assert!(!locks.is_active("radarr"));
        assert!(locks.try_acquire("radarr").is_ok());
    }
}
