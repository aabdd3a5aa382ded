//! Update strategies: runtime-only, compose edit, env edit, or both.
//!
//! Strategies are derived from a container's labels on every operation;
//! nothing is cached between configuration reloads.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Serialize;

use dockup_state::{StrategyKind, StrategyParams};

/// How an update is applied to a container.
///
/// Every variant pulls and recreates through the container runtime; the
/// file-editing variants additionally keep a compose file and/or env file
/// in step with the running tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Strategy {
    Api,
    Compose {
        file: PathBuf,
        service: String,
    },
    Env {
        var: String,
    },
    ComposeAndEnv {
        file: PathBuf,
        service: String,
        var: String,
    },
}

impl Strategy {
    pub fn kind(&self) -> StrategyKind {
        match self {
            Self::Api => StrategyKind::Api,
            Self::Compose { .. } => StrategyKind::Compose,
            Self::Env { .. } => StrategyKind::Env,
            Self::ComposeAndEnv { .. } => StrategyKind::ComposeAndEnv,
        }
    }

    /// Compose file and service to edit, if any.
    pub fn compose(&self) -> Option<(&Path, &str)> {
        match self {
            Self::Compose { file, service } | Self::ComposeAndEnv { file, service, .. } => {
                Some((file.as_path(), service.as_str()))
            }
            _ => None,
        }
    }

    /// Env variable to edit, if any.
    pub fn env_var(&self) -> Option<&str> {
        match self {
            Self::Env { var } | Self::ComposeAndEnv { var, .. } => Some(var),
            _ => None,
        }
    }
}

/// Where a resolved strategy came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategySource {
    Labels,
    Legacy,
}

/// Resolver output for one monitored container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedStrategy {
    pub strategy: Strategy,
    pub source: StrategySource,
    /// Changelog URL override from labels.
    pub changelog: Option<String>,
}

impl ResolvedStrategy {
    /// Parameters as persisted on the container row.
    pub fn params(&self) -> StrategyParams {
        let (compose_file, compose_service) = match self.strategy.compose() {
            Some((file, service)) => (
                Some(file.display().to_string()),
                Some(service.to_string()),
            ),
            None => (None, None),
        };
        StrategyParams {
            compose_file,
            compose_service,
            env_var: self.strategy.env_var().map(str::to_string),
            changelog: self.changelog.clone(),
        }
    }
}

/// Inputs of strategy resolution besides the labels themselves.
#[derive(Debug, Clone)]
pub struct StrategyConfig {
    /// Label namespace, e.g. `dockup.`.
    pub label_prefix: String,
    /// Legacy bulk mapping: container name → env variable.
    pub legacy_env_vars: HashMap<String, String>,
    /// Env file edited by env strategies.
    pub env_file: PathBuf,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            label_prefix: "dockup.".to_string(),
            legacy_env_vars: HashMap::new(),
            env_file: PathBuf::from("/env/.env"),
        }
    }
}

impl StrategyConfig {
    fn label<'a>(&self, labels: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
        labels
            .get(&format!("{}{}", self.label_prefix, key))
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }
}

/// Derive the update strategy of a container, or `None` if it is not monitored.
///
/// Precedence:
/// 1. an explicit `<prefix>enable` label decides monitoring; only `true`
///    (any case) enables, anything else excludes the container even when
///    the legacy mapping names it
/// 2. without the label, a legacy mapping entry enables an env strategy
/// 3. `compose_file` adds compose editing, service defaulting to the
///    container name; `env_var` (falling back to the legacy mapping) adds
///    env editing; neither means runtime-only
pub fn resolve(
    container: &str,
    labels: &HashMap<String, String>,
    config: &StrategyConfig,
) -> Option<ResolvedStrategy> {
    let legacy_var = config.legacy_env_vars.get(container).cloned();

    let Some(enable) = config.label(labels, "enable") else {
        return legacy_var.map(|var| ResolvedStrategy {
            strategy: Strategy::Env { var },
            source: StrategySource::Legacy,
            changelog: None,
        });
    };
    if !enable.eq_ignore_ascii_case("true") {
        return None;
    }

    let compose_file = config.label(labels, "compose_file").map(PathBuf::from);
    let service = config
        .label(labels, "compose_service")
        .unwrap_or(container)
        .to_string();
    let env_var = config
        .label(labels, "env_var")
        .map(str::to_string)
        .or(legacy_var);

    let strategy = match (compose_file, env_var) {
        (Some(file), Some(var)) => Strategy::ComposeAndEnv { file, service, var },
        (Some(file), None) => Strategy::Compose { file, service },
        (None, Some(var)) => Strategy::Env { var },
        (None, None) => Strategy::Api,
    };

    Some(ResolvedStrategy {
        strategy,
        source: StrategySource::Labels,
        changelog: config.label(labels, "changelog").map(str::to_string),
    })
}
