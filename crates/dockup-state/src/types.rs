//! Domain types for the dockup state store.
//!
//! These types represent the persisted state of monitored containers, their
//! version history, settings overrides, and jobs. All types are serializable
//! to/from JSON for storage in redb tables and for the HTTP surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{StateError, StateResult};

/// Current version of the export/import document format.
pub const HISTORY_FORMAT_VERSION: u32 = 1;

/// Unique identifier for a job.
pub type JobId = String;

// ── Containers ─────────────────────────────────────────────────────

/// Lifecycle status of a monitored container.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ContainerStatus {
    #[default]
    Unknown,
    UpToDate,
    UpdateAvailable,
    Updating,
    RollingBack,
    Error,
}

/// Which update strategy a container resolved to.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Pull + recreate through the container runtime only.
    #[default]
    Api,
    Compose,
    Env,
    ComposeAndEnv,
}

/// Strategy parameters declared for a container.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StrategyParams {
    pub compose_file: Option<String>,
    pub compose_service: Option<String>,
    pub env_var: Option<String>,
    pub changelog: Option<String>,
}

/// Persisted snapshot of a monitored container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContainerRecord {
    pub name: String,
    /// Image repository without tag (`lscr.io/linuxserver/radarr`).
    pub image: String,
    /// Tag of the last known-good running image.
    pub current_tag: String,
    pub digest: Option<String>,
    pub monitored: bool,
    pub strategy: StrategyKind,
    pub params: StrategyParams,
    pub last_checked: Option<DateTime<Utc>>,
    /// Newest eligible tag seen in the registry, if newer than current.
    pub latest_tag: Option<String>,
    pub status: ContainerStatus,
    /// Human-readable reason for `Error` or suppressed update checks.
    pub status_detail: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ContainerRecord {
    /// Create a record on first observation of a container.
    pub fn observed(name: &str, image: &str, tag: &str) -> Self {
        Self {
            name: name.to_string(),
            image: image.to_string(),
            current_tag: tag.to_string(),
            digest: None,
            monitored: true,
            strategy: StrategyKind::Api,
            params: StrategyParams::default(),
            last_checked: None,
            latest_tag: None,
            status: ContainerStatus::Unknown,
            status_detail: None,
            updated_at: Utc::now(),
        }
    }

    /// Whether a newer tag than the running one is known.
    pub fn has_update(&self) -> bool {
        self.latest_tag
            .as_deref()
            .is_some_and(|latest| latest != self.current_tag)
    }
}

// ── History ────────────────────────────────────────────────────────

/// How an operation that produced a history entry ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    RolledBack,
}

/// One applied version of a container. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryEntry {
    pub container: String,
    /// Tag that was running once the operation finished.
    pub tag: String,
    pub digest: Option<String>,
    pub applied_at: DateTime<Utc>,
    pub outcome: Outcome,
    /// Tag this entry replaced (for `RolledBack`: the tag that failed).
    pub replaced_tag: Option<String>,
}

impl HistoryEntry {
    pub fn new(
        container: &str,
        tag: &str,
        digest: Option<String>,
        outcome: Outcome,
        replaced_tag: Option<String>,
    ) -> Self {
        Self {
            container: container.to_string(),
            tag: tag.to_string(),
            digest,
            applied_at: Utc::now(),
            outcome,
            replaced_tag,
        }
    }

    /// Import identity: `(container, tag, digest)`.
    pub fn same_identity(&self, other: &HistoryEntry) -> bool {
        self.container == other.container && self.tag == other.tag && self.digest == other.digest
    }

    /// Key prefix shared by all entries of a container.
    pub fn key_prefix(container: &str) -> String {
        format!("{container}/")
    }

    /// Table key for this entry with the given disambiguating sequence.
    pub fn table_key(&self, seq: u32) -> String {
        let millis = self.applied_at.timestamp_millis().max(0);
        format!("{}/{millis:016}/{seq:04}", self.container)
    }

    fn validate(&self) -> StateResult<()> {
        if !is_valid_container_name(&self.container) {
            return Err(StateError::MalformedImport(format!(
                "invalid container name {:?}",
                self.container
            )));
        }
        if self.tag.is_empty() || self.tag.chars().any(char::is_whitespace) {
            return Err(StateError::MalformedImport(format!(
                "invalid tag {:?} for {}",
                self.tag, self.container
            )));
        }
        Ok(())
    }
}

/// Container names as the Docker engine accepts them.
pub fn is_valid_container_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphanumeric() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

// ── Settings ───────────────────────────────────────────────────────

/// Runtime-adjustable settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Settings {
    /// Seconds between scheduled checks.
    pub check_interval: u64,
    /// Maximum history entries kept per container.
    pub history_limit: u32,
    pub allow_prerelease: bool,
    pub auto_update: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            check_interval: 21_600,
            history_limit: 5,
            allow_prerelease: false,
            auto_update: false,
        }
    }
}

/// Smallest accepted check interval, in seconds.
pub const MIN_CHECK_INTERVAL: u64 = 60;

impl Settings {
    pub fn validate(&self) -> StateResult<()> {
        if self.check_interval < MIN_CHECK_INTERVAL {
            return Err(StateError::InvalidSettings(format!(
                "check_interval must be at least {MIN_CHECK_INTERVAL} seconds"
            )));
        }
        if self.history_limit == 0 {
            return Err(StateError::InvalidSettings(
                "history_limit must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Persisted per-field overrides layered over environment defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SettingsOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_interval: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history_limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_prerelease: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_update: Option<bool>,
}

impl SettingsOverride {
    /// Effective settings: override if present, else the default, per field.
    pub fn apply(&self, defaults: &Settings) -> Settings {
        Settings {
            check_interval: self.check_interval.unwrap_or(defaults.check_interval),
            history_limit: self.history_limit.unwrap_or(defaults.history_limit),
            allow_prerelease: self.allow_prerelease.unwrap_or(defaults.allow_prerelease),
            auto_update: self.auto_update.unwrap_or(defaults.auto_update),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// A settings field, used to clear an override.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SettingField {
    CheckInterval,
    HistoryLimit,
    AllowPrerelease,
    AutoUpdate,
}

/// Partial settings update accepted by the settings boundary.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SettingsPatch {
    #[serde(default)]
    pub check_interval: Option<u64>,
    #[serde(default)]
    pub history_limit: Option<u32>,
    #[serde(default)]
    pub allow_prerelease: Option<bool>,
    #[serde(default)]
    pub auto_update: Option<bool>,
    /// Fields whose override is cleared (applied before the set fields).
    #[serde(default)]
    pub reset: Vec<SettingField>,
}

impl SettingsPatch {
    /// Apply this patch to an override row, producing the new row.
    pub fn merge_into(&self, current: &SettingsOverride) -> SettingsOverride {
        let mut next = current.clone();
        for field in &self.reset {
            match field {
                SettingField::CheckInterval => next.check_interval = None,
                SettingField::HistoryLimit => next.history_limit = None,
                SettingField::AllowPrerelease => next.allow_prerelease = None,
                SettingField::AutoUpdate => next.auto_update = None,
            }
        }
        if let Some(v) = self.check_interval {
            next.check_interval = Some(v);
        }
        if let Some(v) = self.history_limit {
            next.history_limit = Some(v);
        }
        if let Some(v) = self.allow_prerelease {
            next.allow_prerelease = Some(v);
        }
        if let Some(v) = self.auto_update {
            next.auto_update = Some(v);
        }
        next
    }
}

// ── Export / import ────────────────────────────────────────────────

/// Full structured dump of history and settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct HistoryDocument {
    pub format_version: u32,
    pub exported_at: DateTime<Utc>,
    /// Effective settings at export time.
    pub settings: Settings,
    /// Raw persisted overrides at export time.
    #[serde(default)]
    pub overrides: SettingsOverride,
    pub history: Vec<HistoryEntry>,
}

impl HistoryDocument {
    /// Parse and validate an import document. Any defect rejects the whole document.
    pub fn from_slice(bytes: &[u8]) -> StateResult<Self> {
        let doc: HistoryDocument = serde_json::from_slice(bytes)
            .map_err(|e| StateError::MalformedImport(e.to_string()))?;
        doc.validate()?;
        Ok(doc)
    }

    pub fn validate(&self) -> StateResult<()> {
        if self.format_version != HISTORY_FORMAT_VERSION {
            return Err(StateError::MalformedImport(format!(
                "unsupported format_version {}",
                self.format_version
            )));
        }
        for entry in &self.history {
            entry.validate()?;
        }
        Ok(())
    }
}

// ── Jobs ───────────────────────────────────────────────────────────

/// What a job does.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Check,
    Update,
    Rollback,
}

/// Job lifecycle. `Succeeded` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// One timestamped step of a job log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogLine {
    pub at: DateTime<Utc>,
    pub message: String,
}

/// Snapshot of a job, as persisted and as served to pollers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobRecord {
    pub id: JobId,
    pub kind: JobKind,
    pub container: Option<String>,
    pub target_tag: Option<String>,
    pub status: JobStatus,
    pub log: Vec<LogLine>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_wins_per_field() {
        let defaults = Settings::default();
        let overrides = SettingsOverride {
            history_limit: Some(9),
            auto_update: Some(true),
            ..Default::default()
        };
        let effective = overrides.apply(&defaults);
        assert_eq!(effective.history_limit, 9);
        assert!(effective.auto_update);
        assert_eq!(effective.check_interval, defaults.check_interval);
        assert_eq!(effective.allow_prerelease, defaults.allow_prerelease);
    }

    #[test]
    fn override_false_is_not_absent() {
        let defaults = Settings {
            auto_update: true,
            ..Default::default()
        };
        let overrides = SettingsOverride {
            auto_update: Some(false),
            ..Default::default()
        };
        assert!(!overrides.apply(&defaults).auto_update);
    }

    #[test]
    fn patch_resets_then_sets() {
        let current = SettingsOverride {
            check_interval: Some(600),
            history_limit: Some(3),
            ..Default::default()
        };
        let patch = SettingsPatch {
            reset: vec![SettingField::CheckInterval, SettingField::HistoryLimit],
            history_limit: Some(7),
            ..Default::default()
        };
        let next = patch.merge_into(&current);
        assert_eq!(next.check_interval, None);
        assert_eq!(next.history_limit, Some(7));
    }

    #[test]
    fn settings_validation() {
        assert!(Settings::default().validate().is_ok());
        let too_fast = Settings {
            check_interval: 5,
            ..Default::default()
        };
        assert!(too_fast.validate().is_err());
        let no_history = Settings {
            history_limit: 0,
            ..Default::default()
        };
        assert!(no_history.validate().is_err());
    }

    #[test]
    fn container_names() {
        assert!(is_valid_container_name("radarr"));
        assert!(is_valid_container_name("my_app-2.web"));
        assert!(!is_valid_container_name(""));
        assert!(!is_valid_container_name("-lead"));
        assert!(!is_valid_container_name("has/slash"));
    }

    #[test]
    fn history_keys_sort_chronologically() {
        let mut a = HistoryEntry::new("app", "1.0", None, Outcome::Success, None);
        let mut b = a.clone();
        a.applied_at = DateTime::from_timestamp(1_000, 0).unwrap();
        b.applied_at = DateTime::from_timestamp(20_000, 0).unwrap();
        assert!(a.table_key(0) < b.table_key(0));
        assert!(a.table_key(0) < a.table_key(1));
        assert!(a.table_key(0).starts_with(&HistoryEntry::key_prefix("app")));
    }

    #[test]
    fn import_document_rejects_bad_entry() {
        let doc = serde_json::json!({
            "format_version": 1,
            "exported_at": "2026-01-01T00:00:00Z",
            "settings": Settings::default(),
            "history": [
                {"container": "ok", "tag": "1.0", "digest": null,
                 "applied_at": "2026-01-01T00:00:00Z", "outcome": "success", "replaced_tag": null},
                {"container": "bad/name", "tag": "1.0", "digest": null,
                 "applied_at": "2026-01-01T00:00:00Z", "outcome": "success", "replaced_tag": null}
            ]
        });
        let bytes = serde_json::to_vec(&doc).unwrap();
        let err = HistoryDocument::from_slice(&bytes).unwrap_err();
        assert!(matches!(err, StateError::MalformedImport(_)));
    }

    #[test]
    fn import_document_rejects_unknown_version() {
        let doc = serde_json::json!({
            "format_version": 99,
            "exported_at": "2026-01-01T00:00:00Z",
            "settings": Settings::default(),
            "history": []
        });
        let bytes = serde_json::to_vec(&doc).unwrap();
        assert!(HistoryDocument::from_slice(&bytes).is_err());
        assert!(HistoryDocument::from_slice(b"not json").is_err());
    }

    #[test]
    fn has_update_requires_different_tag() {
        let mut record = ContainerRecord::observed("app", "nginx", "1.25");
        assert!(!record.has_update());
        record.latest_tag = Some("1.25".to_string());
        assert!(!record.has_update());
        record.latest_tag = Some("1.26".to_string());
        assert!(record.has_update());
    }
}
