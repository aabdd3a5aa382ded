//! Runtime-neutral container descriptions.

use std::collections::{BTreeMap, HashMap};

use bollard::models::HostConfig;
use serde::Serialize;

/// Everything needed to recreate a container: captured from a running
/// one, then replayed with only the image changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    /// Full image reference (`repo:tag`).
    pub image: String,
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
    pub cmd: Option<Vec<String>>,
    pub entrypoint: Option<Vec<String>>,
    pub working_dir: Option<String>,
    pub user: Option<String>,
    /// Only set when it differs from the engine-assigned default.
    pub hostname: Option<String>,
    pub tty: bool,
    pub open_stdin: bool,
    pub exposed_ports: Option<HashMap<String, HashMap<(), ()>>>,
    /// Mounts, port bindings, restart policy, capabilities, devices,
    /// privileged mode and the primary network.
    pub host_config: HostConfig,
    /// Aliases on the primary network (compose service names and the like).
    pub primary_aliases: Vec<String>,
    /// Additional networks beyond the primary one, with their aliases.
    pub networks: BTreeMap<String, Vec<String>>,
}

impl ContainerSpec {
    /// Same configuration, different image.
    pub fn with_image(&self, image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..self.clone()
        }
    }
}

/// A container as observed on the host.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSnapshot {
    pub id: String,
    pub name: String,
    /// Image reference the container was created from.
    pub image: String,
    /// Content digest of the running image, when the engine knows one.
    pub digest: Option<String>,
    pub labels: HashMap<String, String>,
    pub running: bool,
    pub spec: ContainerSpec,
}

/// Health of a started container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Starting,
    Healthy,
    Unhealthy,
    /// Running, but the image declares no health check.
    NoHealthcheck,
    NotRunning,
}

/// Docker assigns the short container id as hostname unless one is given.
pub(crate) fn is_short_id(value: &str) -> bool {
    value.len() == 12 && value.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}
