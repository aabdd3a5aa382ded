//! dockup-registry: version discovery for dockup.
//!
//! Turns an image reference into the registry that hosts it, lists the
//! tags published there, and decides whether one of them is a newer
//! eligible version than the tag currently running.
//!
//! - [`ImageRef`] parses `ghcr.io/org/repo`, `lscr.io/linuxserver/repo`,
//!   `org/repo`, `docker.io/org/repo`, and bare `repo` references.
//! - [`RegistryClient`] lists tags from Docker Hub or GHCR (package API
//!   first, Registry v2 fallback), behind the [`TagSource`] trait.
//! - [`pick_update`] applies the version ordering and prerelease policy.
//! - [`ChangelogResolver`] finds a release-notes URL for an image.

pub mod changelog;
pub mod client;
pub mod error;
pub mod reference;
pub mod version;

pub use changelog::ChangelogResolver;
pub use client::{RegistryClient, RegistryEndpoints, TagSource};
pub use error::{RegistryError, RegistryResult, VersionError};
pub use reference::{ImageRef, Registry, split_reference};
pub use version::{Qualifier, Version, pick_update};
