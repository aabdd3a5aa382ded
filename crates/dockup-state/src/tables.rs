//! redb table definitions for the dockup state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Container snapshots keyed by container name.
pub const CONTAINERS: TableDefinition<&str, &[u8]> = TableDefinition::new("containers");

/// Version history keyed by `{container}/{applied_at_ms:016}/{seq:04}`.
pub const HISTORY: TableDefinition<&str, &[u8]> = TableDefinition::new("history");

/// Settings overrides. A single row under [`SETTINGS_KEY`].
pub const SETTINGS: TableDefinition<&str, &[u8]> = TableDefinition::new("settings");

/// Job records keyed by job id.
pub const JOBS: TableDefinition<&str, &[u8]> = TableDefinition::new("jobs");

/// Row key of the settings override document.
pub const SETTINGS_KEY: &str = "overrides";
