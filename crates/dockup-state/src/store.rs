//! StateStore: redb-backed state persistence for dockup.
//!
//! Provides typed operations over containers, version history, settings
//! overrides, and jobs. All values are JSON-serialized into redb's
//! `&[u8]` value columns. The store supports both on-disk and in-memory
//! backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Result of a merge import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub inserted: usize,
    pub skipped: usize,
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

fn encode<T: Serialize>(value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(map_err!(Serialize))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(CONTAINERS).map_err(map_err!(Table))?;
        txn.open_table(HISTORY).map_err(map_err!(Table))?;
        txn.open_table(SETTINGS).map_err(map_err!(Table))?;
        txn.open_table(JOBS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Containers ─────────────────────────────────────────────────

    /// Insert or replace a container snapshot.
    pub fn put_container(&self, record: &ContainerRecord) -> StateResult<()> {
        let value = encode(record)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(CONTAINERS).map_err(map_err!(Table))?;
            table
                .insert(record.name.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(container = %record.name, "container stored");
        Ok(())
    }

    /// Get a container snapshot by name.
    pub fn get_container(&self, name: &str) -> StateResult<Option<ContainerRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CONTAINERS).map_err(map_err!(Table))?;
        match table.get(name).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    /// List all container snapshots, monitored or not.
    pub fn list_containers(&self) -> StateResult<Vec<ContainerRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CONTAINERS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(decode(value.value())?);
        }
        Ok(results)
    }

    /// Read-modify-write a container snapshot in one transaction.
    ///
    /// Returns the updated record, or `None` if no row exists for `name`.
    pub fn update_container<F>(&self, name: &str, mutate: F) -> StateResult<Option<ContainerRecord>>
    where
        F: FnOnce(&mut ContainerRecord),
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let updated = {
            let mut table = txn.open_table(CONTAINERS).map_err(map_err!(Table))?;
            let existing = table
                .get(name)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_vec());
            match existing {
                Some(bytes) => {
                    let mut record: ContainerRecord = decode(&bytes)?;
                    mutate(&mut record);
                    record.updated_at = chrono::Utc::now();
                    let value = encode(&record)?;
                    table
                        .insert(name, value.as_slice())
                        .map_err(map_err!(Write))?;
                    Some(record)
                }
                None => None,
            }
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(updated)
    }

    // ── History ────────────────────────────────────────────────────

    /// Record a history entry, then trim the container's oldest entries
    /// beyond `limit`. Both happen in one write transaction.
    ///
    /// Returns the number of trimmed entries.
    pub fn record_history(&self, entry: &HistoryEntry, limit: u32) -> StateResult<usize> {
        let limit = limit.max(1) as usize;
        let value = encode(entry)?;
        let prefix = HistoryEntry::key_prefix(&entry.container);

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let trimmed;
        {
            let mut table = txn.open_table(HISTORY).map_err(map_err!(Table))?;
            let key = free_history_key(&table, entry)?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;

            // Keys sort chronologically, so the first ones are the oldest.
            let keys = prefixed_keys(&table, &prefix)?;
            let excess = keys.len().saturating_sub(limit);
            for key in &keys[..excess] {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
            trimmed = excess;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(container = %entry.container, tag = %entry.tag, trimmed, "history recorded");
        Ok(trimmed)
    }

    /// History of one container, newest first.
    pub fn list_history(&self, container: &str) -> StateResult<Vec<HistoryEntry>> {
        let prefix = HistoryEntry::key_prefix(container);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(HISTORY).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                results.push(decode(value.value())?);
            }
        }
        results.reverse();
        Ok(results)
    }

    /// Every history entry of every container, newest first per container.
    pub fn list_all_history(&self) -> StateResult<Vec<HistoryEntry>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(HISTORY).map_err(map_err!(Table))?;
        let mut results: Vec<HistoryEntry> = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(decode(value.value())?);
        }
        // Stable sort keeps key order (chronological) inside a container.
        results.reverse();
        results.sort_by(|a, b| a.container.cmp(&b.container));
        Ok(results)
    }

    /// Delete all history of a container. Returns the number removed.
    pub fn purge_history(&self, container: &str) -> StateResult<usize> {
        let prefix = HistoryEntry::key_prefix(container);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let count;
        {
            let mut table = txn.open_table(HISTORY).map_err(map_err!(Table))?;
            let keys = prefixed_keys(&table, &prefix)?;
            for key in &keys {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
            count = keys.len();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        info!(%container, count, "history purged");
        Ok(count)
    }

    /// Full dump of history and settings.
    pub fn export(&self, defaults: &Settings) -> StateResult<HistoryDocument> {
        let overrides = self.settings_override()?;
        Ok(HistoryDocument {
            format_version: HISTORY_FORMAT_VERSION,
            exported_at: chrono::Utc::now(),
            settings: overrides.apply(defaults),
            overrides,
            history: self.list_all_history()?,
        })
    }

    /// Merge-import a document: inserts only entries whose
    /// `(container, tag, digest)` is not stored yet. Does not trim.
    ///
    /// The document is validated first and the whole import is one
    /// transaction, so a defect anywhere rejects everything.
    pub fn import(&self, doc: &HistoryDocument) -> StateResult<ImportSummary> {
        doc.validate()?;

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut summary = ImportSummary::default();
        {
            let mut table = txn.open_table(HISTORY).map_err(map_err!(Table))?;
            let mut known: Vec<HistoryEntry> = Vec::new();
            for entry in table.iter().map_err(map_err!(Read))? {
                let (_, value) = entry.map_err(map_err!(Read))?;
                known.push(decode(value.value())?);
            }

            for entry in &doc.history {
                if known.iter().any(|k| k.same_identity(entry)) {
                    summary.skipped += 1;
                    continue;
                }
                let key = free_history_key(&table, entry)?;
                let value = encode(entry)?;
                table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
                known.push(entry.clone());
                summary.inserted += 1;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        info!(inserted = summary.inserted, skipped = summary.skipped, "history imported");
        Ok(summary)
    }

    // ── Settings ───────────────────────────────────────────────────

    /// The raw persisted override row (empty when never written).
    pub fn settings_override(&self) -> StateResult<SettingsOverride> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SETTINGS).map_err(map_err!(Table))?;
        match table.get(SETTINGS_KEY).map_err(map_err!(Read))? {
            Some(guard) => decode(guard.value()),
            None => Ok(SettingsOverride::default()),
        }
    }

    /// Effective settings: persisted override per field, else the default.
    pub fn effective_settings(&self, defaults: &Settings) -> StateResult<Settings> {
        Ok(self.settings_override()?.apply(defaults))
    }

    /// Apply a settings patch atomically. The resulting effective settings
    /// are validated before anything is written.
    pub fn update_settings(
        &self,
        patch: &SettingsPatch,
        defaults: &Settings,
    ) -> StateResult<SettingsOverride> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let next = {
            let mut table = txn.open_table(SETTINGS).map_err(map_err!(Table))?;
            let current = match table.get(SETTINGS_KEY).map_err(map_err!(Read))? {
                Some(guard) => decode(guard.value())?,
                None => SettingsOverride::default(),
            };
            let next = patch.merge_into(&current);
            next.apply(defaults).validate()?;
            if next.is_empty() {
                table.remove(SETTINGS_KEY).map_err(map_err!(Write))?;
            } else {
                let value = encode(&next)?;
                table
                    .insert(SETTINGS_KEY, value.as_slice())
                    .map_err(map_err!(Write))?;
            }
            next
        };
        // An early return above drops `txn`, which aborts it.
        txn.commit().map_err(map_err!(Transaction))?;
        info!(?next, "settings overrides updated");
        Ok(next)
    }

    // ── Jobs ───────────────────────────────────────────────────────

    /// Insert or update a job record.
    pub fn put_job(&self, job: &JobRecord) -> StateResult<()> {
        let value = encode(job)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(JOBS).map_err(map_err!(Table))?;
            table
                .insert(job.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get a job record by id.
    pub fn get_job(&self, id: &str) -> StateResult<Option<JobRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(JOBS).map_err(map_err!(Table))?;
        match table.get(id).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    /// List all job records, newest first.
    pub fn list_jobs(&self) -> StateResult<Vec<JobRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(JOBS).map_err(map_err!(Table))?;
        let mut results: Vec<JobRecord> = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(decode(value.value())?);
        }
        results.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(results)
    }

    /// Evict the oldest finished jobs beyond `keep`. Returns the number removed.
    pub fn trim_jobs(&self, keep: usize) -> StateResult<usize> {
        let jobs = self.list_jobs()?;
        let evict: Vec<String> = jobs
            .iter()
            .filter(|j| j.status.is_terminal())
            .skip(keep)
            .map(|j| j.id.clone())
            .collect();
        if evict.is_empty() {
            return Ok(0);
        }
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(JOBS).map_err(map_err!(Table))?;
            for id in &evict {
                table.remove(id.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(count = evict.len(), "old jobs evicted");
        Ok(evict.len())
    }

    /// Mark jobs that never reached a terminal state (previous process
    /// stopped mid-flight) as failed. Returns how many were marked.
    pub fn fail_interrupted_jobs(&self) -> StateResult<usize> {
        let now = chrono::Utc::now();
        let mut count = 0;
        for mut job in self.list_jobs()? {
            if job.status.is_terminal() {
                continue;
            }
            job.status = JobStatus::Failed;
            job.finished_at = Some(now);
            job.error = Some("interrupted by shutdown".to_string());
            job.log.push(LogLine {
                at: now,
                message: "interrupted by shutdown".to_string(),
            });
            self.put_job(&job)?;
            count += 1;
        }
        Ok(count)
    }
}

/// All keys of `table` starting with `prefix`, in key order.
fn prefixed_keys<T>(table: &T, prefix: &str) -> StateResult<Vec<String>>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    let mut keys = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (key, _) = entry.map_err(map_err!(Read))?;
        let key = key.value();
        if key.starts_with(prefix) {
            keys.push(key.to_string());
        }
    }
    Ok(keys)
}

/// First unused key for `entry` (entries sharing a millisecond get a higher seq).
fn free_history_key<T>(table: &T, entry: &HistoryEntry) -> StateResult<String>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    let mut seq = 0;
    loop {
        let key = entry.table_key(seq);
        if table.get(key.as_str()).map_err(map_err!(Read))?.is_none() {
            return Ok(key);
        }
        seq += 1;
    }
}
