//! dockupd: the dockup daemon.
//!
//! Assembles the state store, container runtime, registry client, notifier,
//! scheduler and HTTP API into one process.

pub mod config;
pub mod daemon;

pub use config::{Config, LogFormat};
pub use daemon::{Collaborators, Daemon};
