//! In-process [`ContainerRuntime`] with scripted health and failure injection.
//!
//! Every call is appended to an operation log (`"pull nginx:1.26"`,
//! `"create web"`, ...) so tests can assert on the exact sequence the
//! orchestrator drove.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::ContainerRuntime;
use crate::error::{RuntimeError, RuntimeResult};
use crate::types::{ContainerSnapshot, ContainerSpec, HealthState};

#[derive(Debug, Clone)]
struct MemContainer {
    id: String,
    spec: ContainerSpec,
    running: bool,
    /// Health probes served so far, for scripted sequences.
    probes: usize,
}

#[derive(Default)]
struct Inner {
    containers: HashMap<String, MemContainer>,
    images: HashSet<String>,
    digests: HashMap<String, String>,
    /// Health sequence per image; the last state repeats.
    health: HashMap<String, Vec<HealthState>>,
    fail_pull: HashSet<String>,
    fail_create: HashSet<String>,
    fail_start: HashSet<String>,
    ops: Vec<String>,
    next_id: u64,
}

/// Test double for the container engine.
#[derive(Default)]
pub struct MemoryRuntime {
    inner: Mutex<Inner>,
}

impl MemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Seed a running container (its image counts as present locally).
    pub fn add_container(&self, spec: ContainerSpec) {
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = format!("{:064x}", inner.next_id);
        inner.images.insert(spec.image.clone());
        inner.containers.insert(
            spec.name.clone(),
            MemContainer {
                id,
                spec,
                running: true,
                probes: 0,
            },
        );
    }

    /// Script the health states reported for containers running `image`.
    pub fn set_health(&self, image: &str, states: Vec<HealthState>) {
        self.lock().health.insert(image.to_string(), states);
    }

    pub fn set_digest(&self, image: &str, digest: &str) {
        self.lock()
            .digests
            .insert(image.to_string(), digest.to_string());
    }

    pub fn fail_pull(&self, image: &str) {
        self.lock().fail_pull.insert(image.to_string());
    }

    pub fn fail_create(&self, image: &str) {
        self.lock().fail_create.insert(image.to_string());
    }

    pub fn fail_start(&self, image: &str) {
        self.lock().fail_start.insert(image.to_string());
    }

    /// Clear all injected failures.
    pub fn heal(&self) {
        let mut inner = self.lock();
        inner.fail_pull.clear();
        inner.fail_create.clear();
        inner.fail_start.clear();
    }

    /// Image the named container currently runs, if it exists.
    pub fn running_image(&self, name: &str) -> Option<String> {
        self.lock()
            .containers
            .get(name)
            .filter(|c| c.running)
            .map(|c| c.spec.image.clone())
    }

    /// Full spec of the named container.
    pub fn spec_of(&self, name: &str) -> Option<ContainerSpec> {
        self.lock().containers.get(name).map(|c| c.spec.clone())
    }

    pub fn has_image(&self, image: &str) -> bool {
        self.lock().images.contains(image)
    }

    /// Operations performed so far, in order.
    pub fn ops(&self) -> Vec<String> {
        self.lock().ops.clone()
    }

    fn snapshot(inner: &Inner, c: &MemContainer) -> ContainerSnapshot {
        ContainerSnapshot {
            id: c.id.clone(),
            name: c.spec.name.clone(),
            image: c.spec.image.clone(),
            digest: inner.digests.get(&c.spec.image).cloned(),
            labels: c.spec.labels.clone(),
            running: c.running,
            spec: c.spec.clone(),
        }
    }
}

#[async_trait]
impl ContainerRuntime for MemoryRuntime {
    async fn list_containers(&self) -> RuntimeResult<Vec<ContainerSnapshot>> {
        let inner = self.lock();
        let mut all: Vec<ContainerSnapshot> = inner
            .containers
            .values()
            .map(|c| Self::snapshot(&inner, c))
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(all)
    }

    async fn inspect(&self, name: &str) -> RuntimeResult<ContainerSnapshot> {
        let inner = self.lock();
        inner
            .containers
            .get(name)
            .map(|c| Self::snapshot(&inner, c))
            .ok_or_else(|| RuntimeError::NotFound(name.to_string()))
    }

    async fn pull(&self, image: &str) -> RuntimeResult<()> {
        let mut inner = self.lock();
        inner.ops.push(format!("pull {image}"));
        if inner.fail_pull.contains(image) {
            return Err(RuntimeError::Pull(format!("{image}: manifest unknown")));
        }
        inner.images.insert(image.to_string());
        Ok(())
    }

    async fn image_digest(&self, image: &str) -> RuntimeResult<Option<String>> {
        Ok(self.lock().digests.get(image).cloned())
    }

    async fn stop(&self, name: &str) -> RuntimeResult<()> {
        let mut inner = self.lock();
        inner.ops.push(format!("stop {name}"));
        match inner.containers.get_mut(name) {
            Some(c) => {
                c.running = false;
                Ok(())
            }
            None => Err(RuntimeError::NotFound(name.to_string())),
        }
    }

    async fn remove(&self, name: &str) -> RuntimeResult<()> {
        let mut inner = self.lock();
        inner.ops.push(format!("remove {name}"));
        inner
            .containers
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| RuntimeError::NotFound(name.to_string()))
    }

    async fn create(&self, spec: &ContainerSpec) -> RuntimeResult<String> {
        let mut inner = self.lock();
        inner.ops.push(format!("create {} {}", spec.name, spec.image));
        if inner.fail_create.contains(&spec.image) {
            return Err(RuntimeError::Create(format!("{}: injected failure", spec.image)));
        }
        if !inner.images.contains(&spec.image) {
            return Err(RuntimeError::NotFound(spec.image.clone()));
        }
        if inner.containers.contains_key(&spec.name) {
            return Err(RuntimeError::Create(format!("name {} already in use", spec.name)));
        }
        inner.next_id += 1;
        let id = format!("{:064x}", inner.next_id);
        inner.containers.insert(
            spec.name.clone(),
            MemContainer {
                id: id.clone(),
                spec: spec.clone(),
                running: false,
                probes: 0,
            },
        );
        Ok(id)
    }

    async fn start(&self, name: &str) -> RuntimeResult<()> {
        let mut inner = self.lock();
        inner.ops.push(format!("start {name}"));
        let image = match inner.containers.get(name) {
            Some(c) => c.spec.image.clone(),
            None => return Err(RuntimeError::NotFound(name.to_string())),
        };
        if inner.fail_start.contains(&image) {
            return Err(RuntimeError::Start(format!("{name}: injected failure")));
        }
        if let Some(c) = inner.containers.get_mut(name) {
            c.running = true;
            c.probes = 0;
        }
        Ok(())
    }

    async fn health(&self, name: &str) -> RuntimeResult<HealthState> {
        let mut inner = self.lock();
        let (image, running, probe) = match inner.containers.get_mut(name) {
            Some(c) => {
                let probe = c.probes;
                c.probes += 1;
                (c.spec.image.clone(), c.running, probe)
            }
            None => return Err(RuntimeError::NotFound(name.to_string())),
        };
        if !running {
            return Ok(HealthState::NotRunning);
        }
        let state = match inner.health.get(&image) {
            Some(script) if !script.is_empty() => {
                let at = probe.min(script.len() - 1);
                script[at]
            }
            _ => HealthState::NoHealthcheck,
        };
        Ok(state)
    }

    async fn remove_image(&self, image: &str) -> RuntimeResult<()> {
        let mut inner = self.lock();
        inner.ops.push(format!("rmi {image}"));
        let in_use = inner.containers.values().any(|c| c.spec.image == image);
        if in_use {
            return Err(RuntimeError::Remove(format!("{image} is in use")));
        }
        if inner.images.remove(image) {
            Ok(())
        } else {
            Err(RuntimeError::NotFound(image.to_string()))
        }
    }
}
