//! Image reference parsing.

use std::fmt;

use serde::Serialize;

use crate::error::{RegistryError, RegistryResult};

/// Where an image's tags are listed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Registry {
    DockerHub,
    Ghcr,
}

/// A repository on a known registry, without tag or digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageRef {
    pub registry: Registry,
    pub namespace: String,
    pub repository: String,
}

impl ImageRef {
    /// Resolve a reference (`[host/]path[:tag][@digest]`) to its registry.
    ///
    /// - `ghcr.io/<org>/<repo>` → GHCR
    /// - `lscr.io/linuxserver/<repo>` → Docker Hub `linuxserver/<repo>`
    /// - `docker.io/` and `index.docker.io/` prefixes are dropped
    /// - `<org>/<repo>` → Docker Hub; deeper paths use the last two segments
    /// - `<repo>` → Docker Hub `library/<repo>`
    pub fn parse(reference: &str) -> RegistryResult<Self> {
        let (path, _, _) = split_reference(reference.trim());
        if path.is_empty() {
            return Err(RegistryError::Reference(reference.to_string()));
        }

        if let Some(rest) = path.strip_prefix("ghcr.io/") {
            let mut parts = rest.split('/');
            return match (parts.next(), parts.next()) {
                (Some(org), Some(repo)) if !org.is_empty() && !repo.is_empty() => {
                    Ok(Self::new(Registry::Ghcr, org, repo))
                }
                _ => Err(RegistryError::Reference(reference.to_string())),
            };
        }

        if let Some(repo) = path.strip_prefix("lscr.io/linuxserver/") {
            let repo = repo.rsplit('/').next().unwrap_or(repo);
            return Ok(Self::new(Registry::DockerHub, "linuxserver", repo));
        }

        let path = ["docker.io/", "index.docker.io/"]
            .iter()
            .find_map(|prefix| path.strip_prefix(prefix))
            .unwrap_or(path);

        let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
        match parts.as_slice() {
            [] => Err(RegistryError::Reference(reference.to_string())),
            [repo] => Ok(Self::new(Registry::DockerHub, "library", repo)),
            [.., org, repo] => Ok(Self::new(Registry::DockerHub, org, repo)),
        }
    }

    fn new(registry: Registry, namespace: &str, repository: &str) -> Self {
        Self {
            registry,
            namespace: namespace.to_string(),
            repository: repository.to_string(),
        }
    }

    /// `namespace/repository`, as used in registry API paths.
    pub fn path(&self) -> String {
        format!("{}/{}", self.namespace, self.repository)
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.registry {
            Registry::DockerHub => write!(f, "docker.io/{}", self.path()),
            Registry::Ghcr => write!(f, "ghcr.io/{}", self.path()),
        }
    }
}

/// Split `repo[:tag][@digest]` into its parts.
///
/// A `:` only starts a tag when it follows the last `/`, so registry
/// ports (`host:5000/repo`) stay part of the repository.
pub fn split_reference(reference: &str) -> (&str, Option<&str>, Option<&str>) {
    let (name, digest) = match reference.split_once('@') {
        Some((name, digest)) => (name, Some(digest)),
        None => (reference, None),
    };
    let slash = name.rfind('/').map_or(0, |i| i + 1);
    match name[slash..].rfind(':') {
        Some(i) => {
            let at = slash + i;
            (&name[..at], Some(&name[at + 1..]), digest)
        }
        None => (name, None, digest),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ghcr() {
        let r = ImageRef::parse("ghcr.io/immich-app/immich-server:v1.2.3").unwrap();
        assert_eq!(r.registry, Registry::Ghcr);
        assert_eq!(r.path(), "immich-app/immich-server");
    }

    #[test]
    fn lscr_maps_to_docker_hub() {
        let r = ImageRef::parse("lscr.io/linuxserver/radarr:5.2.1").unwrap();
        assert_eq!(r.registry, Registry::DockerHub);
        assert_eq!(r.path(), "linuxserver/radarr");
    }

    #[test]
    fn docker_hub_forms() {
        assert_eq!(ImageRef::parse("nginx").unwrap().path(), "library/nginx");
        assert_eq!(ImageRef::parse("nginx:1.25").unwrap().path(), "library/nginx");
        assert_eq!(
            ImageRef::parse("jellyfin/jellyfin:10.8").unwrap().path(),
            "jellyfin/jellyfin"
        );
        assert_eq!(
            ImageRef::parse("docker.io/portainer/portainer-ce").unwrap().path(),
            "portainer/portainer-ce"
        );
        assert_eq!(
            ImageRef::parse("index.docker.io/library/redis:7").unwrap().path(),
            "library/redis"
        );
        assert_eq!(
            ImageRef::parse("registry.example.com/team/sub/app:1").unwrap().path(),
            "sub/app"
        );
    }

    #[test]
    fn rejects_incomplete_references() {
        assert!(ImageRef::parse("").is_err());
        assert!(ImageRef::parse("ghcr.io/onlyorg").is_err());
    }

    #[test]
    fn split_keeps_registry_port() {
        assert_eq!(
            split_reference("host:5000/app:1.0@sha256:abc"),
            ("host:5000/app", Some("1.0"), Some("sha256:abc"))
        );
        assert_eq!(split_reference("host:5000/app"), ("host:5000/app", None, None));
        assert_eq!(split_reference("nginx:latest"), ("nginx", Some("latest"), None));
    }
}
