use crate::capture::ChangeCapture;
use crate::gateway::{DbGateway, Record};
use common::config::DEFAULT_CHUNK_SIZE;
use common::utils::{now_timestamp, quote_ident, EPOCH_TIMESTAMP};
use common::{
    is_reserved_table, ChangeBatch, Error, IntegrityProbe, IntegrityReport, Operation, Result,
    SyncOutcome, SyncStatus, TableIntegrity, TrackingEntry,
};
use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::{OptionalExtension, Transaction};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const SEED_BATCH_SIZE: i64 = 1000;
/// Sample size for the drift probe during an incremental convergence scan.
const INCREMENTAL_SAMPLE: usize = 5;
/// Sample size for the drift probe during a forced full sync.
const FORCE_SAMPLE: usize = 20;

/// Reference-data tables copied first during a seed; relation-style names
/// are copied last. Ordering is a heuristic for foreign-key friendliness,
/// not a correctness requirement (enforcement is off during the seed).
const SEED_TABLE_NAMES: &[&str] = &["categories", "types", "status", "settings", "lookups"];
const RELATION_SUFFIXES: &[&str] = &["_relation", "_mapping", "_map", "_link"];

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Directory for point-in-time snapshot copies during initial seeds.
    pub temp_dir: PathBuf,
    /// Byte bound per streaming-copy step.
    pub chunk_size: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            temp_dir: std::env::temp_dir().join("db-sync"),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// Replication engine for one slave.
///
/// Owns the slave's gateway plus its own master gateway; the per-instance
/// lock forbids two concurrent syncs of the same slave (the scheduler and
/// the realtime dispatcher may both be running).
pub struct SyncEngine {
    master: Arc<DbGateway>,
    slave: DbGateway,
    capture: ChangeCapture,
    ignored_tables: HashSet<String>,
    options: EngineOptions,
    sync_lock: Mutex<()>,
}

impl SyncEngine {
    pub fn new(
        master_db_path: impl AsRef<Path>,
        slave_db_path: impl AsRef<Path>,
        ignored_tables: Vec<String>,
        options: EngineOptions,
    ) -> Result<Self> {
        let master = Arc::new(DbGateway::open(master_db_path.as_ref())?);
        let capture = ChangeCapture::new(master.clone());
        capture.install()?;

        let slave = DbGateway::open(slave_db_path.as_ref())?;

        let engine = Self {
            master,
            slave,
            capture,
            ignored_tables: ignored_tables.into_iter().collect(),
            options,
            sync_lock: Mutex::new(()),
        };
        engine.ensure_sync_config()?;
        Ok(engine)
    }

    fn ensure_sync_config(&self) -> Result<()> {
        self.slave.execute_batch(
            "CREATE TABLE IF NOT EXISTS _sync_config (
                 id INTEGER PRIMARY KEY,
                 last_sync_timestamp TEXT NOT NULL,
                 master_db_path TEXT NOT NULL
             );",
        )?;
        let rows = self
            .slave
            .query("SELECT id FROM _sync_config WHERE id = 1", &[])?;
        if rows.is_empty() {
            self.slave.execute(
                "INSERT INTO _sync_config (id, last_sync_timestamp, master_db_path) VALUES (1, ?1, ?2)",
                &[
                    Value::Text(EPOCH_TIMESTAMP.to_string()),
                    Value::Text(self.master.path().display().to_string()),
                ],
            )?;
        }
        Ok(())
    }

    /// The periodic catch-up watermark stored on the slave.
    pub fn last_sync_timestamp(&self) -> Result<String> {
        let rows = self.slave.query(
            "SELECT last_sync_timestamp FROM _sync_config WHERE id = 1",
            &[],
        )?;
        Ok(rows
            .first()
            .and_then(|r| match r.get("last_sync_timestamp") {
                Some(Value::Text(s)) => Some(s.clone()),
                _ => None,
            })
            .unwrap_or_else(|| EPOCH_TIMESTAMP.to_string()))
    }

    pub fn update_last_sync_timestamp(&self) -> Result<()> {
        self.slave.execute(
            "UPDATE _sync_config SET last_sync_timestamp = ?1 WHERE id = 1",
            &[Value::Text(now_timestamp())],
        )?;
        Ok(())
    }

    /// Master tables eligible for replication to this slave.
    fn replicated_tables(&self) -> Result<Vec<String>> {
        Ok(self
            .master
            .tables()?
            .into_iter()
            .filter(|t| !self.ignored_tables.contains(t))
            .collect())
    }

    /// Missing slave tables are created from the master's DDL; remaining
    /// tables must carry identical column sets (order is irrelevant).
    pub fn verify_schema_compatibility(&self) -> Result<bool> {
        let required = self.replicated_tables()?;
        let slave_tables: HashSet<String> = self.slave.tables()?.into_iter().collect();

        for table in &required {
            if !slave_tables.contains(table) {
                warn!("Table {} missing on slave, creating from master schema", table);
                match self.master.schema_ddl(table) {
                    Ok(ddl) => {
                        if let Err(e) = self.slave.execute(&ddl, &[]) {
                            error!("Failed to create table {} on slave: {}", table, e);
                        }
                    }
                    Err(e) => error!("No master schema for table {}: {}", table, e),
                }
            }
        }

        for table in &required {
            let master_columns: HashSet<String> = self.master.columns(table)?.into_iter().collect();
            let slave_columns: HashSet<String> = self.slave.columns(table)?.into_iter().collect();
            if master_columns != slave_columns {
                warn!("Column sets differ for table {}", table);
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Incremental sync: tracked changes since the slave watermark, falling
    /// back to a convergence scan when tracking is empty.
    pub fn sync_databases(&self) -> SyncOutcome {
        let Some(_guard) = self.sync_lock.try_lock() else {
            return SyncOutcome::running();
        };
        let start = Instant::now();

        match self.sync_databases_inner() {
            Ok(count) => {
                let message = if count > 0 {
                    format!("Sync complete: {count} changes")
                } else {
                    "No changes since last sync".to_string()
                };
                SyncOutcome::success(message, count, start.elapsed().as_secs_f64())
            }
            Err(e) => {
                error!("Sync failed for slave {}: {}", self.slave.path().display(), e);
                SyncOutcome::error(format!("Sync failed: {e}"), start.elapsed().as_secs_f64())
            }
        }
    }

    fn sync_databases_inner(&self) -> Result<u64> {
        if !self.verify_schema_compatibility()? {
            return Err(Error::SchemaMismatch(
                "master and slave column sets differ".to_string(),
            ));
        }

        let last_sync = self.last_sync_timestamp()?;
        let mut changes = self
            .capture
            .changes_since(&last_sync, &self.ignored_tables)?;
        if changes.is_empty() {
            debug!("No tracked changes, scanning tables for drift");
            changes = self.convergence_scan(INCREMENTAL_SAMPLE)?;
        }

        let count = changes.len() as u64;
        if !changes.is_empty() {
            self.apply_changes(&changes)?;
        }
        self.update_last_sync_timestamp()?;
        Ok(count)
    }

    /// Cursor-ignoring reconciliation over all non-ignored tables.
    pub fn force_full_sync(&self) -> SyncOutcome {
        let Some(_guard) = self.sync_lock.try_lock() else {
            return SyncOutcome::running();
        };
        let start = Instant::now();

        let result = (|| -> Result<u64> {
            if !self.verify_schema_compatibility()? {
                return Err(Error::SchemaMismatch(
                    "master and slave column sets differ".to_string(),
                ));
            }
            let changes = self.convergence_scan(FORCE_SAMPLE)?;
            let count = changes.len() as u64;
            if !changes.is_empty() {
                self.apply_changes(&changes)?;
            }
            self.update_last_sync_timestamp()?;
            Ok(count)
        })();

        match result {
            Ok(count) => {
                let message = if count > 0 {
                    format!("Forced sync complete: {count} changes")
                } else {
                    "No differences found".to_string()
                };
                SyncOutcome::success(message, count, start.elapsed().as_secs_f64())
            }
            Err(e) => {
                error!(
                    "Forced sync failed for slave {}: {}",
                    self.slave.path().display(),
                    e
                );
                SyncOutcome::error(format!("Forced sync failed: {e}"), start.elapsed().as_secs_f64())
            }
        }
    }

    /// Diff-based repair: compares row-id sets directly and probes a bounded
    /// random sample of shared rows for silent drift. This is what converges
    /// a slave when triggers were absent or missed a window.
    fn convergence_scan(&self, sample_per_table: usize) -> Result<Vec<TrackingEntry>> {
        let mut changes = Vec::new();

        for table in self.replicated_tables()? {
            if !self.slave.table_exists(&table)? {
                warn!("Table {} does not exist on slave, skipping", table);
                continue;
            }

            let master_ids = row_id_set(&self.master, &table)?;
            let slave_ids = row_id_set(&self.slave, &table)?;

            let missing = master_ids.difference(&slave_ids).count();
            let extra = slave_ids.difference(&master_ids).count();
            if missing > 0 || extra > 0 {
                info!(
                    "Table {}: {} missing rows, {} extra rows on slave",
                    table, missing, extra
                );
            }

            for row_id in master_ids.difference(&slave_ids) {
                changes.push(TrackingEntry::synthetic(&table, *row_id, Operation::Insert));
            }
            for row_id in slave_ids.difference(&master_ids) {
                changes.push(TrackingEntry::synthetic(&table, *row_id, Operation::Delete));
            }

            // Bounded random probe of rows present on both sides.
            let candidates = self.master.query(
                &format!(
                    "SELECT rowid FROM {} ORDER BY RANDOM() LIMIT ?1",
                    quote_ident(&table)
                ),
                &[Value::Integer(sample_per_table as i64)],
            )?;
            for candidate in &candidates {
                let Some(Value::Integer(row_id)) = candidate.values.first() else {
                    continue;
                };
                if !slave_ids.contains(row_id) {
                    continue;
                }
                let master_row = fetch_row(&self.master, &table, *row_id)?;
                let slave_row = fetch_row(&self.slave, &table, *row_id)?;
                if let (Some(master_row), Some(slave_row)) = (master_row, slave_row) {
                    if rows_differ(&master_row, &slave_row) {
                        debug!("Table {}: row {} differs from master", table, row_id);
                        changes.push(TrackingEntry::synthetic(&table, *row_id, Operation::Update));
                    }
                }
            }
        }
        Ok(changes)
    }

    /// Apply tracked or synthesized changes inside one slave transaction.
    ///
    /// Idempotent by construction: rows are re-fetched from the master and
    /// upserted, deletes of absent rows are no-ops, and duplicate changes
    /// for one row collapse to the latest operation.
    fn apply_changes(&self, changes: &[TrackingEntry]) -> Result<()> {
        let collapsed = collapse_changes(changes);

        let applied = self.slave.with_tx(|tx| {
            for ((table, row_id), operation) in &collapsed {
                if self.ignored_tables.contains(table) || is_reserved_table(table) {
                    continue;
                }
                match operation {
                    Operation::Insert | Operation::Update => {
                        let Some(record) = fetch_row(&self.master, table, *row_id)? else {
                            debug!("Row {} of {} no longer on master, skipping", row_id, table);
                            continue;
                        };
                        if row_exists(tx, table, *row_id)? {
                            update_record(tx, table, *row_id, &record)?;
                        } else {
                            insert_record(tx, table, &record, true)?;
                        }
                    }
                    Operation::Delete => {
                        tx.execute(
                            &format!("DELETE FROM {} WHERE rowid = ?1", quote_ident(table)),
                            [row_id],
                        )?;
                    }
                }
            }
            Ok(collapsed.len())
        });
        let applied = applied.map_err(|e| {
            if e.is_transient() {
                e
            } else {
                Error::Apply(e.to_string())
            }
        })?;

        info!("Applied {} changes to slave {}", applied, self.slave.path().display());
        Ok(())
    }

    /// Realtime path: apply one producer batch. Blocks on the per-slave lock
    /// (batches must never be dropped), then runs inside one transaction.
    pub fn apply_batch(&self, batch: &ChangeBatch) -> Result<u64> {
        let _guard = self.sync_lock.lock();

        if !self.verify_schema_compatibility()? {
            return Err(Error::SchemaMismatch(
                "master and slave column sets differ".to_string(),
            ));
        }

        self.slave.with_tx(|tx| {
            let mut applied = 0u64;
            for (table, ops) in &batch.tables {
                if self.ignored_tables.contains(table) || is_reserved_table(table) {
                    continue;
                }
                for row_id in &ops.deletes {
                    tx.execute(
                        &format!("DELETE FROM {} WHERE rowid = ?1", quote_ident(table)),
                        [row_id],
                    )?;
                    applied += 1;
                }
                for row_id in &ops.inserts {
                    if let Some(record) = fetch_row(&self.master, table, *row_id)? {
                        let written = if row_exists(tx, table, *row_id)? {
                            update_record(tx, table, *row_id, &record)?
                        } else {
                            insert_record(tx, table, &record, false)?
                        };
                        if written {
                            applied += 1;
                        }
                    }
                }
                for row_id in &ops.updates {
                    if let Some(record) = fetch_row(&self.master, table, *row_id)? {
                        if row_exists(tx, table, *row_id)? && update_record(tx, table, *row_id, &record)? {
                            applied += 1;
                        }
                    }
                }
            }
            write_cursor(tx, &now_timestamp())?;
            Ok(applied)
        })
    }

    /// Bulk table-by-table copy from a consistent master snapshot.
    pub fn initial_sync(&self) -> SyncOutcome {
        let Some(_guard) = self.sync_lock.try_lock() else {
            return SyncOutcome::running();
        };
        let start = Instant::now();

        match self.initial_sync_inner() {
            Ok(rows) => SyncOutcome::success(
                format!("Initial sync complete: {rows} rows copied"),
                rows,
                start.elapsed().as_secs_f64(),
            ),
            Err(e) => {
                error!(
                    "Initial sync failed for slave {}: {}",
                    self.slave.path().display(),
                    e
                );
                SyncOutcome::error(format!("Initial sync failed: {e}"), start.elapsed().as_secs_f64())
            }
        }
    }

    fn initial_sync_inner(&self) -> Result<u64> {
        std::fs::create_dir_all(&self.options.temp_dir)?;
        let snapshot_path = self
            .options
            .temp_dir
            .join(format!("master-snapshot-{}.db", Uuid::new_v4()));

        // Checkpoint first so the backup sees every committed write.
        self.master.checkpoint()?;
        self.master.backup_to(&snapshot_path, self.options.chunk_size)?;

        let result = self.seed_from_snapshot(&snapshot_path);

        if let Err(e) = std::fs::remove_file(&snapshot_path) {
            warn!("Failed to remove snapshot {}: {}", snapshot_path.display(), e);
        }
        result
    }

    fn seed_from_snapshot(&self, snapshot_path: &Path) -> Result<u64> {
        if !self.verify_schema_compatibility()? {
            return Err(Error::SchemaMismatch(
                "master and slave column sets differ".to_string(),
            ));
        }

        let source = DbGateway::open_read_only(snapshot_path)?;
        let tables = order_tables_for_seed(&self.replicated_tables()?);
        let slave_tables: HashSet<String> = self.slave.tables()?.into_iter().collect();

        // Enforcement is restored after the copy; ordering inside is only a
        // heuristic.
        self.slave.set_foreign_keys(false)?;
        let result = self.slave.with_tx(|tx| {
            let mut copied = 0u64;
            for table in &tables {
                if !slave_tables.contains(table) {
                    warn!("Table {} does not exist on slave, skipping", table);
                    continue;
                }
                tx.execute(&format!("DELETE FROM {}", quote_ident(table)), [])?;
                copied += copy_table(tx, &source, table)?;
            }
            write_cursor(tx, &now_timestamp())?;
            Ok(copied)
        });
        self.slave.set_foreign_keys(true)?;
        result
    }

    /// Per-table row counts on both sides plus the store's integrity probe.
    pub fn verify_integrity(&self) -> Result<IntegrityReport> {
        let master_probe = integrity_probe(&self.master);
        let slave_probe = integrity_probe(&self.slave);

        let mut details = BTreeMap::new();
        let mut rows_count = 0i64;
        let mut inconsistencies = 0i64;

        let tables = self.master.tables()?;
        for table in &tables {
            let master_count = self.master.row_count(table)?;
            let slave_count = if self.slave.table_exists(table)? {
                self.slave.row_count(table)?
            } else {
                0
            };
            let difference = master_count - slave_count;
            rows_count += master_count;
            inconsistencies += difference.abs();
            details.insert(
                table.clone(),
                TableIntegrity {
                    master_count,
                    slave_count,
                    difference,
                },
            );
        }

        let status = if master_probe.status == "ok" && slave_probe.status == "ok" {
            SyncStatus::Success
        } else {
            SyncStatus::Error
        };

        Ok(IntegrityReport {
            status,
            master: master_probe,
            slave: slave_probe,
            tables_count: tables.len(),
            rows_count,
            inconsistencies,
            details,
        })
    }
}

fn integrity_probe(db: &DbGateway) -> IntegrityProbe {
    match db.integrity_check() {
        Ok(result) if result == "ok" => IntegrityProbe {
            status: "ok".to_string(),
            message: "ok".to_string(),
        },
        Ok(result) => IntegrityProbe {
            status: "error".to_string(),
            message: result,
        },
        Err(e) => IntegrityProbe {
            status: "error".to_string(),
            message: e.to_string(),
        },
    }
}

/// Collapse duplicate `(table, row_id)` changes to the latest operation,
/// keeping the position of the first occurrence.
fn collapse_changes(changes: &[TrackingEntry]) -> Vec<((String, i64), Operation)> {
    let mut order: Vec<(String, i64)> = Vec::new();
    let mut latest: HashMap<(String, i64), Operation> = HashMap::new();
    for change in changes {
        let key = (change.table_name.clone(), change.row_id);
        if !latest.contains_key(&key) {
            order.push(key.clone());
        }
        latest.insert(key, change.operation);
    }
    order
        .into_iter()
        .map(|key| {
            let operation = latest[&key];
            (key, operation)
        })
        .collect()
}

fn row_id_set(db: &DbGateway, table: &str) -> Result<BTreeSet<i64>> {
    let records = db.query(&format!("SELECT rowid FROM {}", quote_ident(table)), &[])?;
    Ok(records
        .iter()
        .filter_map(|r| match r.values.first() {
            Some(Value::Integer(i)) => Some(*i),
            _ => None,
        })
        .collect())
}

fn fetch_row(db: &DbGateway, table: &str, row_id: i64) -> Result<Option<Record>> {
    let mut rows = db.query(
        &format!("SELECT * FROM {} WHERE rowid = ?1", quote_ident(table)),
        &[Value::Integer(row_id)],
    )?;
    Ok(if rows.is_empty() {
        None
    } else {
        Some(rows.remove(0))
    })
}

fn rows_differ(a: &Record, b: &Record) -> bool {
    for (idx, column) in a.columns.iter().enumerate() {
        if b.get(column) != Some(&a.values[idx]) {
            return true;
        }
    }
    false
}

fn row_exists(tx: &Transaction<'_>, table: &str, row_id: i64) -> Result<bool> {
    let found = tx
        .query_row(
            &format!(
                "SELECT 1 FROM {} WHERE rowid = ?1 LIMIT 1",
                quote_ident(table)
            ),
            [row_id],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

fn write_cursor(tx: &Transaction<'_>, timestamp: &str) -> Result<()> {
    tx.execute(
        "UPDATE _sync_config SET last_sync_timestamp = ?1 WHERE id = 1",
        [timestamp],
    )?;
    Ok(())
}

fn is_constraint_error(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _)
            if f.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// Insert an authoritative master row. Constraint violations are logged and
/// skipped so one bad row never sinks the rest of the batch. Returns whether
/// the row was written.
fn insert_record(tx: &Transaction<'_>, table: &str, record: &Record, replace: bool) -> Result<bool> {
    let column_list = record
        .columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = (1..=record.values.len())
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let verb = if replace { "INSERT OR REPLACE" } else { "INSERT" };
    let sql = format!(
        "{verb} INTO {} ({column_list}) VALUES ({placeholders})",
        quote_ident(table)
    );

    match tx.execute(&sql, rusqlite::params_from_iter(record.values.iter())) {
        Ok(_) => Ok(true),
        Err(e) if is_constraint_error(&e) => {
            warn!("Skipping row in table {}: {}", table, e);
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

fn update_record(tx: &Transaction<'_>, table: &str, row_id: i64, record: &Record) -> Result<bool> {
    let set_clause = record
        .columns
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{} = ?{}", quote_ident(c), i + 1))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "UPDATE {} SET {set_clause} WHERE rowid = ?{}",
        quote_ident(table),
        record.values.len() + 1
    );

    let mut params: Vec<Value> = record.values.clone();
    params.push(Value::Integer(row_id));

    match tx.execute(&sql, rusqlite::params_from_iter(params.iter())) {
        Ok(_) => Ok(true),
        Err(e) if is_constraint_error(&e) => {
            warn!("Skipping update of row {} in table {}: {}", row_id, table, e);
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

fn copy_table(tx: &Transaction<'_>, source: &DbGateway, table: &str) -> Result<u64> {
    let mut offset = 0i64;
    let mut copied = 0u64;
    loop {
        let rows = source.query(
            &format!(
                "SELECT * FROM {} LIMIT ?1 OFFSET ?2",
                quote_ident(table)
            ),
            &[Value::Integer(SEED_BATCH_SIZE), Value::Integer(offset)],
        )?;
        if rows.is_empty() {
            break;
        }
        let fetched = rows.len() as i64;
        for record in &rows {
            if insert_record(tx, table, record, false)? {
                copied += 1;
            }
        }
        if fetched < SEED_BATCH_SIZE {
            break;
        }
        offset += fetched;
    }
    Ok(copied)
}

fn order_tables_for_seed(tables: &[String]) -> Vec<String> {
    let mut seed_like = Vec::new();
    let mut standard = Vec::new();
    let mut relation = Vec::new();
    for table in tables {
        let lower = table.to_lowercase();
        if SEED_TABLE_NAMES.contains(&lower.as_str()) {
            seed_like.push(table.clone());
        } else if lower.contains('_') || RELATION_SUFFIXES.iter().any(|s| lower.ends_with(s)) {
            relation.push(table.clone());
        } else {
            standard.push(table.clone());
        }
    }
    seed_like.into_iter().chain(standard).chain(relation).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn options(dir: &TempDir) -> EngineOptions {
        EngineOptions {
            temp_dir: dir.path().join("tmp"),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Master with `items(id, name)` = [(1,"a"), (2,"b")] and an engine over
    /// an empty slave. Rows predate the engine, so tracking starts empty.
    fn seeded_pair(dir: &TempDir) -> SyncEngine {
        let master = DbGateway::open(dir.path().join("master.db")).unwrap();
        master
            .execute_batch(
                "CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT);
                 INSERT INTO items (id, name) VALUES (1, 'a'), (2, 'b');",
            )
            .unwrap();
        drop(master);

        SyncEngine::new(
            dir.path().join("master.db"),
            dir.path().join("slave.db"),
            vec![],
            options(dir),
        )
        .unwrap()
    }

    fn slave_names(engine: &SyncEngine) -> Vec<(i64, String)> {
        engine
            .slave
            .query("SELECT id, name FROM items ORDER BY id", &[])
            .unwrap()
            .iter()
            .map(|r| {
                let id = match r.get("id") {
                    Some(Value::Integer(i)) => *i,
                    _ => 0,
                };
                let name = match r.get("name") {
                    Some(Value::Text(s)) => s.clone(),
                    _ => String::new(),
                };
                (id, name)
            })
            .collect()
    }

    fn age_tracking(engine: &SyncEngine) {
        engine
            .master
            .execute(
                "UPDATE _sync_tracking SET timestamp = datetime('now', '-120 seconds')",
                &[],
            )
            .unwrap();
    }

    #[test]
    fn test_fresh_seed() {
        let dir = TempDir::new().unwrap();
        let engine = seeded_pair(&dir);

        let outcome = engine.initial_sync();
        assert_eq!(outcome.status, SyncStatus::Success);
        assert_eq!(
            slave_names(&engine),
            vec![(1, "a".to_string()), (2, "b".to_string())]
        );
    }

    #[test]
    fn test_incremental_insert() {
        let dir = TempDir::new().unwrap();
        let engine = seeded_pair(&dir);
        engine.initial_sync();

        engine
            .master
            .execute("INSERT INTO items (id, name) VALUES (3, 'c')", &[])
            .unwrap();

        let outcome = engine.sync_databases();
        assert_eq!(outcome.status, SyncStatus::Success);
        assert_eq!(outcome.changes_count, 1);
        assert_eq!(
            slave_names(&engine),
            vec![
                (1, "a".to_string()),
                (2, "b".to_string()),
                (3, "c".to_string())
            ]
        );
    }

    #[test]
    fn test_update_and_delete() {
        let dir = TempDir::new().unwrap();
        let engine = seeded_pair(&dir);
        engine.initial_sync();

        engine
            .master
            .execute("UPDATE items SET name = 'bb' WHERE id = 2", &[])
            .unwrap();
        engine
            .master
            .execute("DELETE FROM items WHERE id = 1", &[])
            .unwrap();

        let outcome = engine.sync_databases();
        assert_eq!(outcome.status, SyncStatus::Success);
        assert_eq!(slave_names(&engine), vec![(2, "bb".to_string())]);
    }

    #[test]
    fn test_noop_update_applies_nothing() {
        let dir = TempDir::new().unwrap();
        let engine = seeded_pair(&dir);
        engine.initial_sync();

        engine
            .master
            .execute("UPDATE items SET name = name WHERE id = 1", &[])
            .unwrap();

        let outcome = engine.sync_databases();
        assert_eq!(outcome.status, SyncStatus::Success);
        assert_eq!(outcome.changes_count, 0);
    }

    #[test]
    fn test_sync_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let engine = seeded_pair(&dir);
        engine.initial_sync();

        engine
            .master
            .execute("INSERT INTO items (id, name) VALUES (3, 'c')", &[])
            .unwrap();
        let first = engine.sync_databases();
        assert_eq!(first.changes_count, 1);

        // Once the tracking rows age past the watermark backshift, a second
        // sync finds nothing to do.
        age_tracking(&engine);
        let second = engine.sync_databases();
        assert_eq!(second.status, SyncStatus::Success);
        assert_eq!(second.changes_count, 0);
        assert_eq!(slave_names(&engine).len(), 3);
    }

    #[test]
    fn test_convergence_repairs_untracked_insert() {
        let dir = TempDir::new().unwrap();
        let engine = seeded_pair(&dir);
        engine.initial_sync();

        // Simulate a missed window: row lands without its trigger.
        engine
            .master
            .execute("DROP TRIGGER trg_items_insert", &[])
            .unwrap();
        engine
            .master
            .execute("INSERT INTO items (id, name) VALUES (4, 'd')", &[])
            .unwrap();

        let outcome = engine.sync_databases();
        assert_eq!(outcome.status, SyncStatus::Success);
        assert_eq!(outcome.changes_count, 1);
        assert!(slave_names(&engine).contains(&(4, "d".to_string())));
    }

    #[test]
    fn test_convergence_removes_extra_slave_rows() {
        let dir = TempDir::new().unwrap();
        let engine = seeded_pair(&dir);
        engine.initial_sync();

        engine
            .slave
            .execute("INSERT INTO items (id, name) VALUES (99, 'ghost')", &[])
            .unwrap();

        let outcome = engine.sync_databases();
        assert_eq!(outcome.status, SyncStatus::Success);
        assert!(!slave_names(&engine).contains(&(99, "ghost".to_string())));
    }

    #[test]
    fn test_force_full_sync_repairs_drifted_row() {
        let dir = TempDir::new().unwrap();
        let engine = seeded_pair(&dir);
        engine.initial_sync();

        engine
            .slave
            .execute("UPDATE items SET name = 'drifted' WHERE id = 1", &[])
            .unwrap();

        let outcome = engine.force_full_sync();
        assert_eq!(outcome.status, SyncStatus::Success);
        assert!(outcome.changes_count >= 1);
        assert_eq!(
            slave_names(&engine),
            vec![(1, "a".to_string()), (2, "b".to_string())]
        );
    }

    #[test]
    fn test_ignored_table_never_replicated() {
        let dir = TempDir::new().unwrap();
        let master = DbGateway::open(dir.path().join("master.db")).unwrap();
        master
            .execute_batch(
                "CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT);
                 CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT);
                 INSERT INTO items (id, name) VALUES (5, 'e');
                 INSERT INTO notes (id, body) VALUES (1, 'hello');",
            )
            .unwrap();
        drop(master);

        let engine = SyncEngine::new(
            dir.path().join("master.db"),
            dir.path().join("slave.db"),
            vec!["items".to_string()],
            options(&dir),
        )
        .unwrap();

        let outcome = engine.sync_databases();
        assert_eq!(outcome.status, SyncStatus::Success);
        assert!(!engine.slave.table_exists("items").unwrap());
        assert_eq!(engine.slave.row_count("notes").unwrap(), 1);
    }

    #[test]
    fn test_schema_mismatch_aborts_sync() {
        let dir = TempDir::new().unwrap();
        let master = DbGateway::open(dir.path().join("master.db")).unwrap();
        master
            .execute_batch("CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT);")
            .unwrap();
        drop(master);
        let slave = DbGateway::open(dir.path().join("slave.db")).unwrap();
        slave
            .execute_batch("CREATE TABLE items (id INTEGER PRIMARY KEY, label TEXT);")
            .unwrap();
        drop(slave);

        let engine = SyncEngine::new(
            dir.path().join("master.db"),
            dir.path().join("slave.db"),
            vec![],
            options(&dir),
        )
        .unwrap();

        let outcome = engine.sync_databases();
        assert_eq!(outcome.status, SyncStatus::Error);
    }

    #[test]
    fn test_missing_slave_table_created_from_ddl() {
        let dir = TempDir::new().unwrap();
        let engine = seeded_pair(&dir);

        assert!(engine.verify_schema_compatibility().unwrap());
        assert!(engine.slave.table_exists("items").unwrap());
        let master_ddl = engine.master.schema_ddl("items").unwrap();
        let slave_ddl = engine.slave.schema_ddl("items").unwrap();
        assert_eq!(master_ddl, slave_ddl);
    }

    #[test]
    fn test_apply_batch_realtime_path() {
        let dir = TempDir::new().unwrap();
        let engine = seeded_pair(&dir);
        engine.initial_sync();

        engine
            .master
            .execute("INSERT INTO items (id, name) VALUES (3, 'c')", &[])
            .unwrap();
        engine
            .master
            .execute("UPDATE items SET name = 'aa' WHERE id = 1", &[])
            .unwrap();
        engine
            .master
            .execute("DELETE FROM items WHERE id = 2", &[])
            .unwrap();

        let mut batch = ChangeBatch::default();
        let ops = batch.tables.entry("items".to_string()).or_default();
        ops.inserts.push(3);
        ops.updates.push(1);
        ops.deletes.push(2);

        let applied = engine.apply_batch(&batch).unwrap();
        assert_eq!(applied, 3);
        assert_eq!(
            slave_names(&engine),
            vec![(1, "aa".to_string()), (3, "c".to_string())]
        );
    }

    #[test]
    fn test_batch_update_never_inserts() {
        let dir = TempDir::new().unwrap();
        let engine = seeded_pair(&dir);
        engine.initial_sync();

        engine
            .master
            .execute("INSERT INTO items (id, name) VALUES (9, 'z')", &[])
            .unwrap();

        let mut batch = ChangeBatch::default();
        batch
            .tables
            .entry("items".to_string())
            .or_default()
            .updates
            .push(9);

        engine.apply_batch(&batch).unwrap();
        assert!(!slave_names(&engine).contains(&(9, "z".to_string())));
    }

    #[test]
    fn test_verify_integrity_counts() {
        let dir = TempDir::new().unwrap();
        let engine = seeded_pair(&dir);
        engine.initial_sync();

        engine
            .master
            .execute("INSERT INTO items (id, name) VALUES (3, 'c')", &[])
            .unwrap();

        let report = engine.verify_integrity().unwrap();
        assert_eq!(report.status, SyncStatus::Success);
        assert_eq!(report.master.status, "ok");
        let items = &report.details["items"];
        assert_eq!(items.master_count, 3);
        assert_eq!(items.slave_count, 2);
        assert_eq!(items.difference, 1);
        assert_eq!(report.inconsistencies, 1);
    }

    #[test]
    fn test_collapse_keeps_latest_operation() {
        let changes = vec![
            TrackingEntry::synthetic("items", 1, Operation::Insert),
            TrackingEntry::synthetic("items", 2, Operation::Insert),
            TrackingEntry::synthetic("items", 1, Operation::Update),
            TrackingEntry::synthetic("items", 1, Operation::Delete),
        ];
        let collapsed = collapse_changes(&changes);
        assert_eq!(collapsed.len(), 2);
        assert_eq!(collapsed[0], (("items".to_string(), 1), Operation::Delete));
        assert_eq!(collapsed[1], (("items".to_string(), 2), Operation::Insert));
    }

    #[test]
    fn test_seed_table_ordering() {
        let tables = vec![
            "order_items".to_string(),
            "orders".to_string(),
            "categories".to_string(),
        ];
        let ordered = order_tables_for_seed(&tables);
        assert_eq!(ordered, vec!["categories", "orders", "order_items"]);
    }

    #[test]
    fn test_cursor_bootstrap_starts_at_epoch() {
        let dir = TempDir::new().unwrap();
        let engine = seeded_pair(&dir);
        assert_eq!(engine.last_sync_timestamp().unwrap(), EPOCH_TIMESTAMP);
    }
}
