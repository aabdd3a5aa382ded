//! Docker Engine implementation of [`ContainerRuntime`].

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
    NetworkingConfig, RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerInspectResponse, EndpointSettings, HealthStatusEnum};
use bollard::network::ConnectNetworkOptions;
use futures_util::TryStreamExt;
use tracing::{debug, info, warn};

use crate::ContainerRuntime;
use crate::error::{RuntimeError, RuntimeResult};
use crate::types::{ContainerSnapshot, ContainerSpec, HealthState, is_short_id};

/// Seconds the engine waits for a graceful stop before killing.
const STOP_TIMEOUT_SECS: i64 = 30;

pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect using `DOCKER_HOST` or the local socket.
    pub fn connect() -> RuntimeResult<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| RuntimeError::Connect(e.to_string()))?;
        Ok(Self { docker })
    }

    pub fn from_client(docker: Docker) -> Self {
        Self { docker }
    }

    async fn inspect_raw(&self, name: &str) -> RuntimeResult<ContainerInspectResponse> {
        self.docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
            .map_err(|e| RuntimeError::from_docker(e, name, RuntimeError::Inspect))
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_containers(&self) -> RuntimeResult<Vec<ContainerSnapshot>> {
        let options = ListContainersOptions::<String> {
            all: true,
            ..Default::default()
        };
        let summaries = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| RuntimeError::Inspect(e.to_string()))?;

        let mut snapshots = Vec::with_capacity(summaries.len());
        for summary in summaries {
            let Some(id) = summary.id else { continue };
            match self.inspect(&id).await {
                Ok(snapshot) => snapshots.push(snapshot),
                // Removed between list and inspect.
                Err(RuntimeError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(snapshots)
    }

    async fn inspect(&self, name: &str) -> RuntimeResult<ContainerSnapshot> {
        let response = self.inspect_raw(name).await?;
        let mut snapshot = snapshot_from_inspect(&response);
        if let Some(image_id) = response.image.as_deref() {
            snapshot.digest = self.image_digest(image_id).await.unwrap_or_else(|e| {
                debug!(container = %snapshot.name, error = %e, "image digest unavailable");
                None
            });
        }
        Ok(snapshot)
    }

    async fn pull(&self, image: &str) -> RuntimeResult<()> {
        info!(%image, "pulling image");
        let options = CreateImageOptions::<String> {
            from_image: image.to_string(),
            ..Default::default()
        };
        self.docker
            .create_image(Some(options), None, None)
            .try_collect::<Vec<_>>()
            .await
            .map_err(|e| RuntimeError::from_docker(e, image, RuntimeError::Pull))?;
        Ok(())
    }

    async fn image_digest(&self, image: &str) -> RuntimeResult<Option<String>> {
        let inspect = self
            .docker
            .inspect_image(image)
            .await
            .map_err(|e| RuntimeError::from_docker(e, image, RuntimeError::Inspect))?;
        Ok(inspect
            .repo_digests
            .unwrap_or_default()
            .into_iter()
            .find_map(|d| d.split_once('@').map(|(_, digest)| digest.to_string())))
    }

    async fn stop(&self, name: &str) -> RuntimeResult<()> {
        let options = StopContainerOptions {
            t: STOP_TIMEOUT_SECS,
        };
        match self.docker.stop_container(name, Some(options)).await {
            Ok(()) => Ok(()),
            // Already stopped.
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(RuntimeError::from_docker(e, name, RuntimeError::Stop)),
        }
    }

    async fn remove(&self, name: &str) -> RuntimeResult<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.docker
            .remove_container(name, Some(options))
            .await
            .map_err(|e| RuntimeError::from_docker(e, name, RuntimeError::Remove))
    }

    async fn create(&self, spec: &ContainerSpec) -> RuntimeResult<String> {
        // The primary network is joined at create time, so its aliases
        // have to travel with the create request.
        let networking_config = spec
            .host_config
            .network_mode
            .clone()
            .filter(|_| !spec.primary_aliases.is_empty())
            .map(|network| NetworkingConfig {
                endpoints_config: HashMap::from([(
                    network,
                    EndpointSettings {
                        aliases: Some(spec.primary_aliases.clone()),
                        ..Default::default()
                    },
                )]),
            });
        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(spec.env.clone()),
            labels: Some(spec.labels.clone()),
            cmd: spec.cmd.clone(),
            entrypoint: spec.entrypoint.clone(),
            working_dir: spec.working_dir.clone(),
            user: spec.user.clone(),
            hostname: spec.hostname.clone(),
            tty: Some(spec.tty),
            open_stdin: Some(spec.open_stdin),
            exposed_ports: spec.exposed_ports.clone(),
            host_config: Some(spec.host_config.clone()),
            networking_config,
            ..Default::default()
        };
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };
        let created = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| RuntimeError::from_docker(e, &spec.image, RuntimeError::Create))?;

        for (network, aliases) in &spec.networks {
            let options = ConnectNetworkOptions {
                container: spec.name.clone(),
                endpoint_config: EndpointSettings {
                    aliases: (!aliases.is_empty()).then(|| aliases.clone()),
                    ..Default::default()
                },
            };
            if let Err(e) = self.docker.connect_network(network, options).await {
                warn!(container = %spec.name, %network, error = %e, "could not attach network");
            }
        }
        debug!(container = %spec.name, id = %created.id, "container created");
        Ok(created.id)
    }

    async fn start(&self, name: &str) -> RuntimeResult<()> {
        self.docker
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| RuntimeError::from_docker(e, name, RuntimeError::Start))
    }

    async fn health(&self, name: &str) -> RuntimeResult<HealthState> {
        let response = self.inspect_raw(name).await?;
        let state = response.state.unwrap_or_default();
        if !state.running.unwrap_or(false) {
            return Ok(HealthState::NotRunning);
        }
        let status = state.health.and_then(|h| h.status);
        Ok(match status {
            Some(HealthStatusEnum::HEALTHY) => HealthState::Healthy,
            Some(HealthStatusEnum::UNHEALTHY) => HealthState::Unhealthy,
            Some(HealthStatusEnum::STARTING) => HealthState::Starting,
            _ => HealthState::NoHealthcheck,
        })
    }

    async fn remove_image(&self, image: &str) -> RuntimeResult<()> {
        self.docker
            .remove_image(image, None, None)
            .await
            .map_err(|e| RuntimeError::from_docker(e, image, RuntimeError::Remove))?;
        Ok(())
    }
}

/// Capture the recreate-relevant configuration of an inspected container.
fn snapshot_from_inspect(response: &ContainerInspectResponse) -> ContainerSnapshot {
    let id = response.id.clone().unwrap_or_default();
    let name = response
        .name
        .as_deref()
        .unwrap_or_default()
        .trim_start_matches('/')
        .to_string();
    let config = response.config.clone().unwrap_or_default();
    let host_config = response.host_config.clone().unwrap_or_default();
    let image = config.image.clone().unwrap_or_default();
    let labels = config.labels.clone().unwrap_or_default();

    let primary = host_config
        .network_mode
        .clone()
        .unwrap_or_else(|| "bridge".to_string());
    let mut networks: BTreeMap<String, Vec<String>> = response
        .network_settings
        .as_ref()
        .and_then(|ns| ns.networks.clone())
        .unwrap_or_default()
        .into_iter()
        .map(|(network, endpoint)| {
            let aliases = endpoint
                .aliases
                .unwrap_or_default()
                .into_iter()
                .filter(|a| !is_short_id(a))
                .collect();
            (network, aliases)
        })
        .collect();
    let primary_aliases = networks.remove(&primary).unwrap_or_default();

    let hostname = config
        .hostname
        .clone()
        .filter(|h| !h.is_empty() && !id.starts_with(h.as_str()));

    let spec = ContainerSpec {
        name: name.clone(),
        image: image.clone(),
        env: config.env.clone().unwrap_or_default(),
        labels: labels.clone(),
        cmd: config.cmd.clone(),
        entrypoint: config.entrypoint.clone(),
        working_dir: config.working_dir.clone().filter(|w| !w.is_empty()),
        user: config.user.clone().filter(|u| !u.is_empty()),
        hostname,
        tty: config.tty.unwrap_or(false),
        open_stdin: config.open_stdin.unwrap_or(false),
        exposed_ports: config.exposed_ports.clone(),
        host_config,
        primary_aliases,
        networks,
    };

    ContainerSnapshot {
        id,
        name,
        image,
        digest: None,
        labels,
        running: response
            .state
            .as_ref()
            .and_then(|s| s.running)
            .unwrap_or(false),
        spec,
    }
}
