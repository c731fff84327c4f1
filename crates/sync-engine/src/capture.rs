use crate::gateway::{DbGateway, Record};
use common::{Error, Operation, Result, TrackingEntry};
use rusqlite::types::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Current shape of the tracking log.
const TRACKING_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS _sync_tracking (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    table_name TEXT NOT NULL,
    row_id INTEGER NOT NULL,
    operation TEXT NOT NULL,
    changed_columns TEXT,
    old_values TEXT,
    new_values TEXT,
    timestamp DATETIME DEFAULT CURRENT_TIMESTAMP
);
CREATE INDEX IF NOT EXISTS idx_sync_tracking_timestamp
    ON _sync_tracking (timestamp);
CREATE TABLE IF NOT EXISTS _sync_processed_changes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    change_id INTEGER NOT NULL UNIQUE,
    processed_at DATETIME DEFAULT CURRENT_TIMESTAMP
);
";

/// Commit-visibility lag compensation applied to the catch-up watermark.
/// Reprocessing is safe because the applier is idempotent.
const WATERMARK_BACKSHIFT: &str = "-30 seconds";

/// Change-capture substrate on the master database.
///
/// Installs the tracking log plus per-table INSERT/UPDATE/DELETE triggers,
/// and owns the two cursors over it: the unprocessed set consumed by the
/// realtime dispatcher and the timestamp watermark used by the scheduler.
pub struct ChangeCapture {
    db: Arc<DbGateway>,
}

impl ChangeCapture {
    pub fn new(db: Arc<DbGateway>) -> Self {
        Self { db }
    }

    /// Ensure tracking tables, migrate older shapes, and (re)create triggers
    /// for every user table. Trigger failures exclude the affected table
    /// from capture but never fail the install.
    pub fn install(&self) -> Result<()> {
        self.ensure_tables()?;

        let tables = self.db.tables()?;
        for table in &tables {
            let columns = self.db.columns(table)?;
            if columns.is_empty() {
                continue;
            }
            if let Err(e) = self.install_table_triggers(table, &columns) {
                error!("Failed to install triggers for table {}: {}", table, e);
                continue;
            }
            debug!("Triggers installed for table {}", table);
        }

        info!("Change tracking installed for {} tables", tables.len());
        Ok(())
    }

    /// Create the tracking tables and upgrade any legacy shape in place.
    /// Safe to call repeatedly, and on slaves that track only for
    /// diagnostics.
    pub fn ensure_tables(&self) -> Result<()> {
        self.db.execute_batch(TRACKING_SCHEMA)?;
        self.migrate_tracking_table()?;
        Ok(())
    }

    /// Older deployments used `record_id` instead of `row_id` and lacked the
    /// value/column payload columns. A rename needs a copy-rename-swap; the
    /// payload columns are additive ALTERs.
    fn migrate_tracking_table(&self) -> Result<()> {
        let columns = self.db.columns("_sync_tracking")?;

        if !columns.iter().any(|c| c == "row_id") && columns.iter().any(|c| c == "record_id") {
            info!("Migrating _sync_tracking: renaming record_id to row_id");
            self.db.execute_batch(
                "BEGIN;
                 CREATE TABLE _sync_tracking_new (
                     id INTEGER PRIMARY KEY AUTOINCREMENT,
                     table_name TEXT NOT NULL,
                     row_id INTEGER NOT NULL,
                     operation TEXT NOT NULL,
                     changed_columns TEXT,
                     old_values TEXT,
                     new_values TEXT,
                     timestamp DATETIME DEFAULT CURRENT_TIMESTAMP
                 );
                 INSERT INTO _sync_tracking_new (id, table_name, row_id, operation, timestamp)
                     SELECT id, table_name, record_id, operation, timestamp FROM _sync_tracking;
                 DROP TABLE _sync_tracking;
                 ALTER TABLE _sync_tracking_new RENAME TO _sync_tracking;
                 CREATE INDEX IF NOT EXISTS idx_sync_tracking_timestamp
                     ON _sync_tracking (timestamp);
                 COMMIT;",
            )?;
            return Ok(());
        }

        for (name, definition) in [
            ("changed_columns", "changed_columns TEXT"),
            ("old_values", "old_values TEXT"),
            ("new_values", "new_values TEXT"),
        ] {
            if !columns.iter().any(|c| c == name) {
                info!("Migrating _sync_tracking: adding {} column", name);
                self.db.execute(
                    &format!("ALTER TABLE _sync_tracking ADD COLUMN {definition}"),
                    &[],
                )?;
            }
        }
        Ok(())
    }

    fn install_table_triggers(&self, table: &str, columns: &[String]) -> Result<()> {
        let column_list = columns.join(",");
        let new_json = json_object_sql("NEW", columns);
        let old_json = json_object_sql("OLD", columns);

        let insert_trigger = format!(
            "CREATE TRIGGER IF NOT EXISTS trg_{table}_insert AFTER INSERT ON {table}
             BEGIN
                 INSERT INTO _sync_tracking
                     (table_name, row_id, operation, changed_columns, old_values, new_values)
                 VALUES ('{table}', NEW.rowid, 'INSERT', '{column_list}', NULL, {new_json});
             END;"
        );

        // Suppressed entirely when no column materially changed.
        let when_clause = columns
            .iter()
            .map(|c| format!("OLD.{c} IS NOT NEW.{c}"))
            .collect::<Vec<_>>()
            .join(" OR ");
        let changed_arms = columns
            .iter()
            .map(|c| format!("SELECT '{c}' AS column_name FROM (SELECT 1) WHERE OLD.{c} IS NOT NEW.{c}"))
            .collect::<Vec<_>>()
            .join(" UNION ALL ");
        let update_trigger = format!(
            "CREATE TRIGGER IF NOT EXISTS trg_{table}_update AFTER UPDATE ON {table}
             WHEN {when_clause}
             BEGIN
                 INSERT INTO _sync_tracking
                     (table_name, row_id, operation, changed_columns, old_values, new_values)
                 VALUES ('{table}', NEW.rowid, 'UPDATE',
                     (SELECT json_group_array(column_name) FROM ({changed_arms})),
                     {old_json}, {new_json});
             END;"
        );

        let delete_trigger = format!(
            "CREATE TRIGGER IF NOT EXISTS trg_{table}_delete AFTER DELETE ON {table}
             BEGIN
                 INSERT INTO _sync_tracking
                     (table_name, row_id, operation, changed_columns, old_values, new_values)
                 VALUES ('{table}', OLD.rowid, 'DELETE', '{column_list}', {old_json}, NULL);
             END;"
        );

        // Drop first so recreation always reflects the current column set.
        self.db.execute(&format!("DROP TRIGGER IF EXISTS trg_{table}_insert"), &[])?;
        self.db.execute(&format!("DROP TRIGGER IF EXISTS trg_{table}_update"), &[])?;
        self.db.execute(&format!("DROP TRIGGER IF EXISTS trg_{table}_delete"), &[])?;

        for trigger in [&insert_trigger, &update_trigger, &delete_trigger] {
            self.db.execute(trigger, &[]).map_err(|e| Error::TriggerBuild {
                table: table.to_string(),
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }

    /// Tracking rows not yet marked processed, in id order.
    pub fn unprocessed_changes(&self, limit: usize) -> Result<Vec<TrackingEntry>> {
        let records = self.db.query(
            "SELECT id, table_name, row_id, operation, changed_columns, old_values, new_values, timestamp
             FROM _sync_tracking
             WHERE id NOT IN (SELECT change_id FROM _sync_processed_changes)
             ORDER BY id ASC
             LIMIT ?1",
            &[Value::Integer(limit as i64)],
        )?;
        Ok(records.iter().map(tracking_entry_from_record).collect())
    }

    /// Record the processed cursor for a batch of change ids. Duplicates are
    /// ignored, so re-marking after a crash is harmless.
    pub fn mark_processed(&self, change_ids: &[i64]) -> Result<()> {
        if change_ids.is_empty() {
            return Ok(());
        }
        self.db.with_tx(|tx| {
            for id in change_ids {
                tx.execute(
                    "INSERT OR IGNORE INTO _sync_processed_changes (change_id) VALUES (?1)",
                    [id],
                )?;
            }
            Ok(())
        })
    }

    /// Tracking rows newer than the watermark (minus the fixed backshift),
    /// excluding ignored tables, oldest first.
    pub fn changes_since(
        &self,
        timestamp: &str,
        ignored_tables: &HashSet<String>,
    ) -> Result<Vec<TrackingEntry>> {
        let mut sql = String::from(
            "SELECT id, table_name, row_id, operation, changed_columns, old_values, new_values, timestamp
             FROM _sync_tracking
             WHERE datetime(timestamp) > datetime(?1, ?2)",
        );
        let mut params = vec![
            Value::Text(timestamp.to_string()),
            Value::Text(WATERMARK_BACKSHIFT.to_string()),
        ];
        if !ignored_tables.is_empty() {
            let placeholders = (0..ignored_tables.len())
                .map(|i| format!("?{}", i + 3))
                .collect::<Vec<_>>()
                .join(",");
            sql.push_str(&format!(" AND table_name NOT IN ({placeholders})"));
            params.extend(ignored_tables.iter().map(|t| Value::Text(t.clone())));
        }
        sql.push_str(" ORDER BY timestamp ASC");

        let records = self.db.query(&sql, &params)?;
        debug!("Found {} tracked changes since {}", records.len(), timestamp);
        Ok(records.iter().map(tracking_entry_from_record).collect())
    }

    /// Drop tracking rows whose cursor entry is older than the retention
    /// window, then the cursor entries themselves. Returns the number of
    /// tracking rows removed.
    pub fn prune_processed(&self, retention_days: u32) -> Result<usize> {
        let window = format!("-{retention_days} days");
        let removed = self.db.with_tx(|tx| {
            let removed = tx.execute(
                "DELETE FROM _sync_tracking
                 WHERE id IN (SELECT change_id FROM _sync_processed_changes
                              WHERE processed_at < datetime('now', ?1))",
                [&window],
            )?;
            tx.execute(
                "DELETE FROM _sync_processed_changes WHERE processed_at < datetime('now', ?1)",
                [&window],
            )?;
            Ok(removed)
        })?;
        if removed > 0 {
            info!("Pruned {} archived tracking rows", removed);
        }
        Ok(removed)
    }
}

/// JSON object text built inside trigger SQL: numbers and NULL unquoted,
/// strings double-quoted with backslash and quote escaped.
fn json_object_sql(prefix: &str, columns: &[String]) -> String {
    let parts = columns
        .iter()
        .map(|col| {
            format!(
                r#"'"{col}":' || CASE WHEN {prefix}.{col} IS NULL THEN 'null' WHEN typeof({prefix}.{col}) IN ('integer', 'real') THEN {prefix}.{col} ELSE '"' || replace(replace({prefix}.{col}, '\', '\\'), '"', '\"') || '"' END"#
            )
        })
        .collect::<Vec<_>>()
        .join(" || ',' || ");
    format!("'{{' || {parts} || '}}'")
}

fn tracking_entry_from_record(record: &Record) -> TrackingEntry {
    TrackingEntry {
        id: record.i64("id"),
        table_name: record.text("table_name"),
        row_id: record.i64("row_id"),
        operation: Operation::parse(&record.text("operation")),
        changed_columns: json_field(record, "changed_columns"),
        old_values: json_field(record, "old_values"),
        new_values: json_field(record, "new_values"),
        timestamp: record.text("timestamp"),
    }
}

/// Payloads are best-effort: unparseable text survives as a JSON string so a
/// malformed trigger payload never breaks a sync.
fn json_field(record: &Record, name: &str) -> Option<serde_json::Value> {
    match record.get(name) {
        Some(Value::Text(s)) => Some(
            serde_json::from_str(s).unwrap_or_else(|_| serde_json::Value::String(s.clone())),
        ),
        _ => None,
    }
}
