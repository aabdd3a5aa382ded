//! dockup-runtime: the container runtime boundary.
//!
//! The orchestrator talks to the host's container engine only through the
//! [`ContainerRuntime`] trait: pull, stop, remove, create, start, inspect,
//! and health. Two implementations are provided:
//!
//! - [`DockerRuntime`]: the Docker Engine API via bollard
//! - [`MemoryRuntime`]: an in-process engine with scripted health and
//!   failure injection, used by tests across the workspace
//!
//! # Architecture
//!
//! ```text
//! ContainerRuntime (trait)
//!   ├── DockerRuntime  ── bollard::Docker (unix socket / DOCKER_HOST)
//!   └── MemoryRuntime  ── Mutex<HashMap<name, container>>
//! ```

pub mod docker;
pub mod error;
pub mod memory;
pub mod types;

use async_trait::async_trait;

pub use docker::DockerRuntime;
pub use error::{RuntimeError, RuntimeResult};
pub use memory::MemoryRuntime;
pub use types::{ContainerSnapshot, ContainerSpec, HealthState};

/// Primitive operations on the host container engine.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// All containers on the host, running or not.
    async fn list_containers(&self) -> RuntimeResult<Vec<ContainerSnapshot>>;

    /// Inspect one container, capturing its full configuration.
    async fn inspect(&self, name: &str) -> RuntimeResult<ContainerSnapshot>;

    /// Pull an image reference (`repo:tag`).
    async fn pull(&self, image: &str) -> RuntimeResult<()>;

    /// Content digest of a local image.
    async fn image_digest(&self, image: &str) -> RuntimeResult<Option<String>>;

    async fn stop(&self, name: &str) -> RuntimeResult<()>;

    async fn remove(&self, name: &str) -> RuntimeResult<()>;

    /// Create (but do not start) a container. Returns its id.
    async fn create(&self, spec: &ContainerSpec) -> RuntimeResult<String>;

    async fn start(&self, name: &str) -> RuntimeResult<()>;

    async fn health(&self, name: &str) -> RuntimeResult<HealthState>;

    /// Delete a local image that is no longer needed.
    async fn remove_image(&self, image: &str) -> RuntimeResult<()>;
}
