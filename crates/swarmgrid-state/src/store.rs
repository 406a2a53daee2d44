//! WorkerRegistry: redb-backed persistence of worker records.
//!
//! Every public mutation runs inside a single write transaction: the
//! current record is read, transformed and written back before commit.
//! A failed step drops the transaction, which aborts it, so callers never
//! observe a partial write. The registry supports both on-disk and
//! in-memory backends (the latter for testing).

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::{debug, info};

use crate::error::{StateError, StateResult};
use crate::tables::WORKERS;
use crate::types::*;

/// Convert any `Display` error into `StateError::Storage`, tagged with the
/// step that failed.
macro_rules! storage_err {
    ($step:literal) => {
        |e| StateError::Storage(format!(concat!($step, ": {}"), e))
    };
}

type WorkersTable<'txn> = redb::Table<'txn, &'static str, &'static [u8]>;

/// Thread-safe worker registry backed by redb.
#[derive(Clone)]
pub struct WorkerRegistry {
    db: Arc<Database>,
}

impl WorkerRegistry {
    /// Open (or create) a persistent registry at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(storage_err!("open"))?;
        let registry = Self { db: Arc::new(db) };
        registry.ensure_tables()?;
        debug!(?path, "worker registry opened");
        Ok(registry)
    }

    /// Create an ephemeral in-memory registry (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(storage_err!("open"))?;
        let registry = Self { db: Arc::new(db) };
        registry.ensure_tables()?;
        debug!("in-memory worker registry opened");
        Ok(registry)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(storage_err!("begin write"))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(WORKERS).map_err(storage_err!("open table"))?;
        txn.commit().map_err(storage_err!("commit"))?;
        Ok(())
    }

    /// Run `f` against the workers table inside one write transaction.
    ///
    /// The transaction only commits when `f` succeeds.
    fn write<T>(&self, f: impl FnOnce(&mut WorkersTable<'_>) -> StateResult<T>) -> StateResult<T> {
        let txn = self.db.begin_write().map_err(storage_err!("begin write"))?;
        let out = {
            let mut table = txn.open_table(WORKERS).map_err(storage_err!("open table"))?;
            f(&mut table)?
        };
        txn.commit().map_err(storage_err!("commit"))?;
        Ok(out)
    }

    // ── Writes ─────────────────────────────────────────────────────

    /// Insert or refresh the record for `identity`, stamped with the current time.
    pub fn upsert(
        &self,
        identity: &WorkerIdentity,
        inventory: &ResourceInventory,
    ) -> StateResult<WorkerRecord> {
        self.upsert_at(identity, inventory, epoch_secs(), None)
    }

    /// Insert or refresh the record for `identity`.
    ///
    /// A new identity is created `active`. An existing one has its
    /// inventory replaced (last writer wins), `last_seen` raised to
    /// `max(existing, seen_at)` and any non-active status returned to
    /// `active`.
    pub fn upsert_at(
        &self,
        identity: &WorkerIdentity,
        inventory: &ResourceInventory,
        seen_at: u64,
        external_addr: Option<String>,
    ) -> StateResult<WorkerRecord> {
        let key = identity.table_key();
        let record = self.write(|table| {
            let record = match read_record(&*table, &key)? {
                Some(mut existing) => {
                    if existing.status != WorkerStatus::Active {
                        info!(worker = %identity, from = %existing.status, "worker reactivated");
                    }
                    existing.inventory = inventory.clone();
                    existing.status = WorkerStatus::Active;
                    existing.last_seen = existing.last_seen.max(seen_at);
                    if external_addr.is_some() {
                        existing.external_addr = external_addr;
                    }
                    existing
                }
                None => {
                    info!(worker = %identity, gpus = inventory.gpus.len(), "registering new worker");
                    WorkerRecord {
                        identity: identity.clone(),
                        inventory: inventory.clone(),
                        status: WorkerStatus::Active,
                        last_seen: seen_at,
                        external_addr,
                    }
                }
            };
            write_record(table, &record)?;
            Ok(record)
        })?;
        debug!(%key, "worker stored");
        Ok(record)
    }

    /// Transition every `active` record of `hostname` to `stale`.
    ///
    /// Records that are already `stale`, `down` or `removed` are left
    /// alone. Fails with `NotFound` when the hostname has no record.
    pub fn mark_stale(&self, hostname: &str) -> StateResult<()> {
        let changed = self.write(|table| {
            let records = scan_hostname(&*table, hostname)?;
            if records.is_empty() {
                return Err(StateError::NotFound(format!("hostname {hostname}")));
            }
            let mut changed = 0usize;
            for mut record in records {
                if record.status == WorkerStatus::Active {
                    record.status = WorkerStatus::Stale;
                    write_record(table, &record)?;
                    changed += 1;
                }
            }
            Ok(changed)
        })?;
        if changed > 0 {
            info!(%hostname, records = changed, "worker marked stale");
        }
        Ok(())
    }

    /// Remove every record of `hostname`. Unknown hostnames are a no-op.
    ///
    /// Returns the number of records whose status changed.
    pub fn remove(&self, hostname: &str) -> StateResult<usize> {
        let changed = self.write(|table| {
            let mut changed = 0usize;
            for mut record in scan_hostname(&*table, hostname)? {
                if record.status != WorkerStatus::Removed {
                    record.status = WorkerStatus::Removed;
                    write_record(table, &record)?;
                    changed += 1;
                }
            }
            Ok(changed)
        })?;
        if changed > 0 {
            info!(%hostname, records = changed, "worker removed");
        }
        Ok(changed)
    }

    /// Remove the single record of `identity`. Idempotent.
    ///
    /// Returns `true` if the record existed and was not already removed.
    pub fn remove_node(&self, identity: &WorkerIdentity) -> StateResult<bool> {
        let key = identity.table_key();
        let changed = self.write(|table| match read_record(&*table, &key)? {
            Some(mut record) if record.status != WorkerStatus::Removed => {
                record.status = WorkerStatus::Removed;
                write_record(table, &record)?;
                Ok(true)
            }
            _ => Ok(false),
        })?;
        if changed {
            info!(worker = %identity, "worker node removed");
        }
        Ok(changed)
    }

    /// Record that the orchestrator reports `identity` down.
    ///
    /// `active`/`stale` → `down`. Returns whether the status changed.
    pub fn mark_down(&self, identity: &WorkerIdentity) -> StateResult<bool> {
        self.transition(
            identity,
            &[WorkerStatus::Active, WorkerStatus::Stale],
            WorkerStatus::Down,
        )
    }

    /// Record that a previously down node is ready again.
    ///
    /// `down` → `active`. Returns whether the status changed.
    pub fn mark_ready(&self, identity: &WorkerIdentity) -> StateResult<bool> {
        self.transition(identity, &[WorkerStatus::Down], WorkerStatus::Active)
    }

    fn transition(
        &self,
        identity: &WorkerIdentity,
        from: &[WorkerStatus],
        to: WorkerStatus,
    ) -> StateResult<bool> {
        let key = identity.table_key();
        let changed = self.write(|table| {
            let Some(mut record) = read_record(&*table, &key)? else {
                return Err(StateError::NotFound(format!("worker {identity}")));
            };
            if !from.contains(&record.status) {
                return Ok(false);
            }
            record.status = to;
            write_record(table, &record)?;
            Ok(true)
        })?;
        if changed {
            info!(worker = %identity, status = %to, "worker status changed");
        }
        Ok(changed)
    }

    // ── Reads ──────────────────────────────────────────────────────

    /// Get the record of a single identity.
    pub fn get(&self, identity: &WorkerIdentity) -> StateResult<Option<WorkerRecord>> {
        let txn = self.db.begin_read().map_err(storage_err!("begin read"))?;
        let table = txn.open_table(WORKERS).map_err(storage_err!("open table"))?;
        read_record(&table, &identity.table_key())
    }

    /// All records of a hostname (any status), ordered by node id.
    pub fn records_for_hostname(&self, hostname: &str) -> StateResult<Vec<WorkerRecord>> {
        let txn = self.db.begin_read().map_err(storage_err!("begin read"))?;
        let table = txn.open_table(WORKERS).map_err(storage_err!("open table"))?;
        scan_hostname(&table, hostname)
    }

    /// Snapshot of every `active` record, ordered by hostname then node id.
    pub fn list_active(&self) -> StateResult<Vec<WorkerRecord>> {
        Ok(self
            .list_all()?
            .into_iter()
            .filter(|r| r.status == WorkerStatus::Active)
            .collect())
    }

    /// Snapshot of every record, including removed ones.
    pub fn list_all(&self) -> StateResult<Vec<WorkerRecord>> {
        let txn = self.db.begin_read().map_err(storage_err!("begin read"))?;
        let table = txn.open_table(WORKERS).map_err(storage_err!("open table"))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(storage_err!("read"))? {
            let (_, value) = entry.map_err(storage_err!("read"))?;
            results.push(decode(value.value())?);
        }
        results.sort_by(|a, b| a.identity.cmp(&b.identity));
        Ok(results)
    }

    /// Number of `active` records per hostname.
    ///
    /// A count above one means the hostname rejoined under a new node id
    /// while its old record is still active. Down, stale and removed
    /// records are not live replicas and do not count.
    pub fn count_by_hostname(&self) -> StateResult<BTreeMap<String, usize>> {
        let mut counts = BTreeMap::new();
        for record in self.list_all()? {
            if record.status == WorkerStatus::Active {
                *counts.entry(record.identity.hostname).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }
}

fn decode(bytes: &[u8]) -> StateResult<WorkerRecord> {
    serde_json::from_slice(bytes).map_err(storage_err!("deserialize"))
}

fn read_record<T>(table: &T, key: &str) -> StateResult<Option<WorkerRecord>>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    match table.get(key).map_err(storage_err!("read"))? {
        Some(guard) => Ok(Some(decode(guard.value())?)),
        None => Ok(None),
    }
}

fn scan_hostname<T>(table: &T, hostname: &str) -> StateResult<Vec<WorkerRecord>>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    let prefix = hostname_prefix(hostname);
    let mut results = Vec::new();
    for entry in table.iter().map_err(storage_err!("read"))? {
        let (key, value) = entry.map_err(storage_err!("read"))?;
        if key.value().starts_with(&prefix) {
            results.push(decode(value.value())?);
        }
    }
    results.sort_by(|a, b| a.identity.node_id.cmp(&b.identity.node_id));
    Ok(results)
}

fn write_record(table: &mut WorkersTable<'_>, record: &WorkerRecord) -> StateResult<()> {
    let key = record.table_key();
    let value = serde_json::to_vec(record).map_err(storage_err!("serialize"))?;
    table
        .insert(key.as_str(), value.as_slice())
        .map_err(storage_err!("write"))?;
    Ok(())
}

/// Current Unix time in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
