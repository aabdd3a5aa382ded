//! Daemon configuration: command-line flags, each backed by an
//! environment variable.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, ValueEnum};

use dockup_health::GateConfig;
use dockup_rollout::{NtfyConfig, OrchestratorConfig, StrategyConfig};
use dockup_state::Settings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Parser)]
#[command(name = "dockupd", about = "dockup: container update daemon", version)]
pub struct Config {
    /// Port for the HTTP API.
    #[arg(long, env = "PORT", default_value_t = 5000)]
    pub port: u16,

    /// redb database holding history, settings and jobs.
    #[arg(long, env = "DB_PATH", default_value = "/data/versions.redb")]
    pub db_path: PathBuf,

    /// Env file edited by env-strategy containers.
    #[arg(long, env = "ENV_FILE_PATH", default_value = "/env/.env")]
    pub env_file: PathBuf,

    /// Seconds between update checks.
    #[arg(long, env = "CHECK_INTERVAL", default_value_t = 21_600)]
    pub check_interval: u64,

    /// Seconds to wait for a recreated container to become healthy.
    #[arg(long, env = "HEALTH_CHECK_TIMEOUT", default_value_t = 60)]
    pub health_timeout: u64,

    /// History entries kept per container.
    #[arg(long, env = "HISTORY_LIMIT", default_value_t = 5)]
    pub history_limit: u32,

    #[arg(long, env = "ALLOW_PRERELEASE", default_value_t = false, action = clap::ArgAction::Set)]
    pub allow_prerelease: bool,

    /// Apply updates found by scheduled checks without asking.
    #[arg(long, env = "AUTO_UPDATE", default_value_t = false, action = clap::ArgAction::Set)]
    pub auto_update: bool,

    /// Prefix of the per-container labels.
    #[arg(long, env = "LABEL_PREFIX", default_value = "dockup.")]
    pub label_prefix: String,

    /// Legacy mapping of container name to env variable: `name=VAR,name2=VAR2`.
    #[arg(long, env = "VERSION_VARS", default_value = "")]
    pub version_vars: String,

    /// Changelog URLs by image fragment: `fragment=url|fragment2=url2`.
    #[arg(long, env = "CHANGELOG_URLS", default_value = "")]
    pub changelog_urls: String,

    #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
    pub github_token: Option<String>,

    /// ntfy server; notifications are off without it.
    #[arg(long, env = "NTFY_ENDPOINT")]
    pub ntfy_endpoint: Option<String>,

    #[arg(long, env = "NTFY_TOPIC", default_value = "DockerUpdate")]
    pub ntfy_topic: String,

    #[arg(long, env = "NTFY_TOKEN", hide_env_values = true)]
    pub ntfy_token: Option<String>,

    /// Opened when a notification is tapped.
    #[arg(long, env = "NTFY_CLICK_URL")]
    pub ntfy_click_url: Option<String>,

    /// `DEBUG`, `INFO`, `WARNING` or `ERROR`. `RUST_LOG` wins when set.
    #[arg(long, env = "LOG_LEVEL", default_value = "INFO")]
    pub log_level: String,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Distinct tags per container whose images stay on disk.
    #[arg(long, env = "IMAGE_RETENTION", default_value_t = 2)]
    pub image_retention: usize,
}

impl Config {
    /// Settings used wherever no override is stored.
    pub fn defaults(&self) -> anyhow::Result<Settings> {
        let settings = Settings {
            check_interval: self.check_interval,
            history_limit: self.history_limit,
            allow_prerelease: self.allow_prerelease,
            auto_update: self.auto_update,
        };
        settings.validate().context("invalid settings defaults")?;
        Ok(settings)
    }

    pub fn orchestrator(&self) -> anyhow::Result<OrchestratorConfig> {
        Ok(OrchestratorConfig {
            strategy: StrategyConfig {
                label_prefix: self.label_prefix.clone(),
                legacy_env_vars: parse_version_vars(&self.version_vars)?,
                env_file: self.env_file.clone(),
            },
            gate: GateConfig::with_timeout(Duration::from_secs(self.health_timeout)),
            image_retention: self.image_retention,
            defaults: self.defaults()?,
        })
    }

    pub fn changelog_urls(&self) -> anyhow::Result<Vec<(String, String)>> {
        parse_changelog_urls(&self.changelog_urls)
    }

    pub fn ntfy(&self) -> Option<NtfyConfig> {
        let endpoint = self.ntfy_endpoint.as_deref().filter(|e| !e.trim().is_empty())?;
        Some(NtfyConfig {
            endpoint: endpoint.trim().to_string(),
            topic: self.ntfy_topic.clone(),
            token: self.ntfy_token.clone(),
            click_url: self.ntfy_click_url.clone(),
        })
    }

    /// Filter directive for `LOG_LEVEL`.
    pub fn log_directive(&self) -> String {
        let level = match self.log_level.trim().to_ascii_uppercase().as_str() {
            "DEBUG" => "debug",
            "WARNING" | "WARN" => "warn",
            "ERROR" => "error",
            _ => "info",
        };
        if level == "info" {
            "info,dockupd=debug".to_string()
        } else {
            level.to_string()
        }
    }
}

/// `name=VAR,name2=VAR2` into a map. Blank input is an empty map.
pub fn parse_version_vars(raw: &str) -> anyhow::Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let Some((name, var)) = pair.split_once('=') else {
            bail!("VERSION_VARS entry {pair:?} is not name=VAR");
        };
        let (name, var) = (name.trim(), var.trim());
        if name.is_empty() || var.is_empty() {
            bail!("VERSION_VARS entry {pair:?} is not name=VAR");
        }
        vars.insert(name.to_string(), var.to_string());
    }
    Ok(vars)
}

/// `fragment=url|fragment2=url2` into ordered pairs.
pub fn parse_changelog_urls(raw: &str) -> anyhow::Result<Vec<(String, String)>> {
    let mut urls = Vec::new();
    for pair in raw.split('|').map(str::trim).filter(|p| !p.is_empty()) {
        // URLs may contain '=', the fragment may not.
        let Some((fragment, url)) = pair.split_once('=') else {
            bail!("CHANGELOG_URLS entry {pair:?} is not fragment=url");
        };
        let (fragment, url) = (fragment.trim(), url.trim());
        if fragment.is_empty() || url.is_empty() {
            bail!("CHANGELOG_URLS entry {pair:?} is not fragment=url");
        }
        urls.push((fragment.to_string(), url.to_string()));
    }
    Ok(urls)
}
