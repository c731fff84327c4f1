use common::utils::now_timestamp;
use common::{Error, Result, SlaveRecord, SlaveStatus, SlaveUpdate, SyncLogEntry, SyncStatus};
use rusqlite::types::Value;
use std::path::Path;
use std::sync::Arc;
use sync_engine::{ChangeCapture, DbGateway, Record};
use tracing::{info, warn};

const REGISTRY_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS slaves (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    db_path TEXT NOT NULL,
    server_address TEXT,
    last_sync DATETIME,
    status TEXT DEFAULT 'inactive',
    created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
    updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
);
CREATE TABLE IF NOT EXISTS ignored_tables (
    id INTEGER PRIMARY KEY,
    slave_id INTEGER,
    table_name TEXT NOT NULL,
    created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
    FOREIGN KEY (slave_id) REFERENCES slaves(id) ON DELETE CASCADE,
    UNIQUE(slave_id, table_name)
);
CREATE TABLE IF NOT EXISTS sync_logs (
    id INTEGER PRIMARY KEY,
    slave_id INTEGER,
    status TEXT NOT NULL,
    message TEXT,
    changes_count INTEGER DEFAULT 0,
    duration REAL,
    created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
    FOREIGN KEY (slave_id) REFERENCES slaves(id) ON DELETE CASCADE
);
";

/// Persistent catalog of slaves plus the append-only sync log, in its own
/// database file.
pub struct SlaveRegistry {
    db: DbGateway,
}

impl SlaveRegistry {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let db = DbGateway::open(path)?;
        db.execute_batch(REGISTRY_SCHEMA)?;
        let registry = Self { db };
        registry.run_migrations()?;
        Ok(registry)
    }

    /// Additive-only migrations for registries created by older versions.
    fn run_migrations(&self) -> Result<()> {
        let columns = self.db.columns("slaves")?;
        for (name, definition) in [
            ("last_sync", "last_sync DATETIME"),
            ("ignored_tables", "ignored_tables TEXT"),
        ] {
            if !columns.iter().any(|c| c == name) {
                info!("Migrating slaves table: adding {} column", name);
                self.db.execute(
                    &format!("ALTER TABLE slaves ADD COLUMN {definition}"),
                    &[],
                )?;
            }
        }
        Ok(())
    }

    /// Register a new slave. The name must be unique; the target file gets
    /// its diagnostic tracking tables prepared on the spot.
    pub fn add_slave(
        &self,
        name: &str,
        db_path: &str,
        server_address: Option<&str>,
        ignored_tables: &[String],
    ) -> Result<i64> {
        if name.trim().is_empty() {
            return Err(Error::Validation("slave name must not be empty".to_string()));
        }

        let now = now_timestamp();
        let inserted = self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO slaves (name, db_path, server_address, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                rusqlite::params![name, db_path, server_address, now],
            )?;
            Ok(conn.last_insert_rowid())
        });
        let slave_id = match inserted {
            Ok(id) => id,
            Err(e) if e.is_constraint_violation() => {
                return Err(Error::Validation(format!(
                    "a slave named '{name}' already exists"
                )))
            }
            Err(e) => return Err(e),
        };

        for table in ignored_tables {
            let table = table.trim();
            if !table.is_empty() {
                self.add_ignored_table(slave_id, table)?;
            }
        }

        // Slaves may track locally for diagnostics; a missing target file is
        // created here, but a broken path only warns so the catalog entry
        // still lands.
        match DbGateway::open(db_path) {
            Ok(gateway) => {
                if let Err(e) = ChangeCapture::new(Arc::new(gateway)).ensure_tables() {
                    warn!("Could not prepare tracking tables on slave {}: {}", name, e);
                }
            }
            Err(e) => warn!("Could not open slave database {}: {}", db_path, e),
        }

        info!("Added slave {} ({})", name, db_path);
        Ok(slave_id)
    }

    pub fn get_slave(&self, slave_id: i64) -> Result<SlaveRecord> {
        let rows = self.db.query(
            "SELECT * FROM slaves WHERE id = ?1",
            &[Value::Integer(slave_id)],
        )?;
        let record = rows
            .first()
            .ok_or_else(|| Error::NotFound(format!("slave {slave_id}")))?;
        let mut slave = slave_from_record(record);
        slave.ignored_tables = self.ignored_tables_for(slave_id)?;
        Ok(slave)
    }

    pub fn list_slaves(&self) -> Result<Vec<SlaveRecord>> {
        let rows = self.db.query("SELECT * FROM slaves ORDER BY name", &[])?;
        let mut slaves = Vec::with_capacity(rows.len());
        for record in &rows {
            let mut slave = slave_from_record(record);
            slave.ignored_tables = self.ignored_tables_for(slave.id)?;
            slaves.push(slave);
        }
        Ok(slaves)
    }

    pub fn update_slave(&self, slave_id: i64, update: &SlaveUpdate) -> Result<()> {
        // Existence check first so a no-op update still answers NotFound.
        self.get_slave(slave_id)?;

        let mut assignments = Vec::new();
        let mut params = Vec::new();
        if let Some(name) = &update.name {
            assignments.push("name");
            params.push(Value::Text(name.clone()));
        }
        if let Some(db_path) = &update.db_path {
            assignments.push("db_path");
            params.push(Value::Text(db_path.clone()));
        }
        if let Some(server_address) = &update.server_address {
            assignments.push("server_address");
            params.push(Value::Text(server_address.clone()));
        }
        if let Some(status) = update.status {
            assignments.push("status");
            params.push(Value::Text(status.as_str().to_string()));
        }

        if !assignments.is_empty() {
            let set_clause = assignments
                .iter()
                .enumerate()
                .map(|(i, column)| format!("{column} = ?{}", i + 1))
                .collect::<Vec<_>>()
                .join(", ");
            params.push(Value::Text(now_timestamp()));
            params.push(Value::Integer(slave_id));
            let sql = format!(
                "UPDATE slaves SET {set_clause}, updated_at = ?{} WHERE id = ?{}",
                params.len() - 1,
                params.len()
            );
            let result = self.db.execute(&sql, &params);
            if let Err(e) = result {
                if e.is_constraint_violation() {
                    return Err(Error::Validation(
                        "a slave with that name already exists".to_string(),
                    ));
                }
                return Err(e);
            }
        }

        if let Some(tables) = &update.ignored_tables {
            self.db.execute(
                "DELETE FROM ignored_tables WHERE slave_id = ?1",
                &[Value::Integer(slave_id)],
            )?;
            for table in tables {
                let table = table.trim();
                if !table.is_empty() {
                    self.add_ignored_table(slave_id, table)?;
                }
            }
        }

        Ok(())
    }

    pub fn delete_slave(&self, slave_id: i64) -> Result<()> {
        let deleted = self.db.execute(
            "DELETE FROM slaves WHERE id = ?1",
            &[Value::Integer(slave_id)],
        )?;
        if deleted == 0 {
            return Err(Error::NotFound(format!("slave {slave_id}")));
        }
        info!("Deleted slave {}", slave_id);
        Ok(())
    }

    /// Write the slave's status; `last_sync` is stamped on transitions into
    /// active/syncing, or taken verbatim when supplied (timestamp
    /// reconciliation path).
    pub fn update_sync_status(
        &self,
        slave_id: i64,
        status: SlaveStatus,
        last_sync: Option<&str>,
    ) -> Result<()> {
        let updated = match last_sync {
            Some(timestamp) => self.db.execute(
                "UPDATE slaves SET status = ?1, last_sync = ?2, updated_at = CURRENT_TIMESTAMP
                 WHERE id = ?3",
                &[
                    Value::Text(status.as_str().to_string()),
                    Value::Text(timestamp.to_string()),
                    Value::Integer(slave_id),
                ],
            )?,
            None if matches!(status, SlaveStatus::Active | SlaveStatus::Syncing) => {
                self.db.execute(
                    "UPDATE slaves SET status = ?1, last_sync = CURRENT_TIMESTAMP,
                         updated_at = CURRENT_TIMESTAMP
                     WHERE id = ?2",
                    &[
                        Value::Text(status.as_str().to_string()),
                        Value::Integer(slave_id),
                    ],
                )?
            }
            None => self.db.execute(
                "UPDATE slaves SET status = ?1, updated_at = CURRENT_TIMESTAMP WHERE id = ?2",
                &[
                    Value::Text(status.as_str().to_string()),
                    Value::Integer(slave_id),
                ],
            )?,
        };
        if updated == 0 {
            return Err(Error::NotFound(format!("slave {slave_id}")));
        }
        Ok(())
    }

    pub fn add_ignored_table(&self, slave_id: i64, table_name: &str) -> Result<()> {
        self.db.execute(
            "INSERT OR IGNORE INTO ignored_tables (slave_id, table_name) VALUES (?1, ?2)",
            &[
                Value::Integer(slave_id),
                Value::Text(table_name.to_string()),
            ],
        )?;
        Ok(())
    }

    pub fn remove_ignored_table(&self, slave_id: i64, table_name: &str) -> Result<()> {
        self.db.execute(
            "DELETE FROM ignored_tables WHERE slave_id = ?1 AND table_name = ?2",
            &[
                Value::Integer(slave_id),
                Value::Text(table_name.to_string()),
            ],
        )?;
        Ok(())
    }

    fn ignored_tables_for(&self, slave_id: i64) -> Result<Vec<String>> {
        let rows = self.db.query(
            "SELECT table_name FROM ignored_tables WHERE slave_id = ?1 ORDER BY table_name",
            &[Value::Integer(slave_id)],
        )?;
        Ok(rows.iter().map(|r| r.text("table_name")).collect())
    }

    pub fn add_sync_log(
        &self,
        slave_id: i64,
        status: SyncStatus,
        message: &str,
        changes_count: u64,
        duration: f64,
    ) -> Result<()> {
        self.db.execute(
            "INSERT INTO sync_logs (slave_id, status, message, changes_count, duration, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            &[
                Value::Integer(slave_id),
                Value::Text(status.as_str().to_string()),
                Value::Text(message.to_string()),
                Value::Integer(changes_count as i64),
                Value::Real(duration),
                Value::Text(now_timestamp()),
            ],
        )?;
        Ok(())
    }

    pub fn get_logs(&self, slave_id: Option<i64>, limit: usize) -> Result<Vec<SyncLogEntry>> {
        let (sql, params) = match slave_id {
            Some(id) => (
                "SELECT l.*, s.name AS slave_name
                 FROM sync_logs l
                 JOIN slaves s ON l.slave_id = s.id
                 WHERE l.slave_id = ?1
                 ORDER BY l.created_at DESC, l.id DESC
                 LIMIT ?2",
                vec![Value::Integer(id), Value::Integer(limit as i64)],
            ),
            None => (
                "SELECT l.*, s.name AS slave_name
                 FROM sync_logs l
                 JOIN slaves s ON l.slave_id = s.id
                 ORDER BY l.created_at DESC, l.id DESC
                 LIMIT ?1",
                vec![Value::Integer(limit as i64)],
            ),
        };
        let rows = self.db.query(sql, &params)?;
        Ok(rows
            .iter()
            .map(|r| SyncLogEntry {
                id: r.i64("id"),
                slave_id: r.i64("slave_id"),
                slave_name: r.text("slave_name"),
                status: r.text("status"),
                message: r.text("message"),
                changes_count: r.i64("changes_count").max(0) as u64,
                duration: r.f64("duration"),
                created_at: r.text("created_at"),
            })
            .collect())
    }
}

fn slave_from_record(record: &Record) -> SlaveRecord {
    SlaveRecord {
        id: record.i64("id"),
        name: record.text("name"),
        db_path: record.text("db_path"),
        server_address: record.opt_text("server_address"),
        status: SlaveStatus::parse(&record.text("status")),
        last_sync: record.opt_text("last_sync"),
        ignored_tables: Vec::new(),
        created_at: record.text("created_at"),
        updated_at: record.text("updated_at"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn registry(dir: &TempDir) -> SlaveRegistry {
        SlaveRegistry::new(dir.path().join("registry.db")).unwrap()
    }

    fn add(reg: &SlaveRegistry, dir: &TempDir, name: &str) -> i64 {
        reg.add_slave(
            name,
            dir.path().join(format!("{name}.db")).to_str().unwrap(),
            Some("10.0.0.1:5000"),
            &[],
        )
        .unwrap()
    }

    #[test]
    fn test_add_and_get_slave() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        let id = add(&reg, &dir, "branch-a");

        let slave = reg.get_slave(id).unwrap();
        assert_eq!(slave.name, "branch-a");
        assert_eq!(slave.status, SlaveStatus::Inactive);
        assert_eq!(slave.server_address.as_deref(), Some("10.0.0.1:5000"));
        assert!(slave.last_sync.is_none());
    }

    #[test]
    fn test_duplicate_name_is_validation_error() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        add(&reg, &dir, "branch-a");

        let result = reg.add_slave(
            "branch-a",
            dir.path().join("other.db").to_str().unwrap(),
            None,
            &[],
        );
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn test_add_prepares_slave_tracking_tables() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        add(&reg, &dir, "branch-a");

        let slave_db = DbGateway::open(dir.path().join("branch-a.db")).unwrap();
        assert!(slave_db.table_exists("_sync_tracking").unwrap());
        assert!(slave_db.table_exists("_sync_processed_changes").unwrap());
    }

    #[test]
    fn test_ignored_tables_roundtrip() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        let id = reg
            .add_slave(
                "branch-a",
                dir.path().join("a.db").to_str().unwrap(),
                None,
                &["logs".to_string(), "  ".to_string(), "cache".to_string()],
            )
            .unwrap();

        let slave = reg.get_slave(id).unwrap();
        assert_eq!(slave.ignored_tables, vec!["cache", "logs"]);

        reg.remove_ignored_table(id, "cache").unwrap();
        assert_eq!(reg.get_slave(id).unwrap().ignored_tables, vec!["logs"]);
    }

    #[test]
    fn test_update_slave_partial() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        let id = add(&reg, &dir, "branch-a");

        reg.update_slave(
            id,
            &SlaveUpdate {
                name: Some("branch-b".to_string()),
                status: Some(SlaveStatus::Active),
                ignored_tables: Some(vec!["logs".to_string()]),
                ..Default::default()
            },
        )
        .unwrap();

        let slave = reg.get_slave(id).unwrap();
        assert_eq!(slave.name, "branch-b");
        assert_eq!(slave.status, SlaveStatus::Active);
        assert_eq!(slave.ignored_tables, vec!["logs"]);
    }

    #[test]
    fn test_update_missing_slave_is_not_found() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        let result = reg.update_slave(99, &SlaveUpdate::default());
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[test]
    fn test_delete_cascades_to_ignored_and_logs() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        let id = reg
            .add_slave(
                "branch-a",
                dir.path().join("a.db").to_str().unwrap(),
                None,
                &["logs".to_string()],
            )
            .unwrap();
        reg.add_sync_log(id, SyncStatus::Success, "ok", 3, 0.5).unwrap();

        reg.delete_slave(id).unwrap();
        assert!(matches!(reg.get_slave(id), Err(Error::NotFound(_))));
        assert!(reg.get_logs(Some(id), 10).unwrap().is_empty());
    }

    #[test]
    fn test_sync_status_stamps_last_sync() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        let id = add(&reg, &dir, "branch-a");

        reg.update_sync_status(id, SlaveStatus::Error, None).unwrap();
        assert!(reg.get_slave(id).unwrap().last_sync.is_none());

        reg.update_sync_status(id, SlaveStatus::Active, None).unwrap();
        assert!(reg.get_slave(id).unwrap().last_sync.is_some());

        reg.update_sync_status(id, SlaveStatus::Active, Some("2024-05-01 12:00:00"))
            .unwrap();
        assert_eq!(
            reg.get_slave(id).unwrap().last_sync.as_deref(),
            Some("2024-05-01 12:00:00")
        );
    }

    #[test]
    fn test_logs_newest_first_with_limit() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        let id = add(&reg, &dir, "branch-a");

        for i in 0..5 {
            reg.add_sync_log(id, SyncStatus::Success, &format!("run {i}"), i, 0.1)
                .unwrap();
        }

        let logs = reg.get_logs(Some(id), 3).unwrap();
        assert_eq!(logs.len(), 3);
        assert_eq!(logs[0].message, "run 4");
        assert_eq!(logs[0].slave_name, "branch-a");
    }

    #[test]
    fn test_legacy_registry_gains_columns() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("legacy.db");
        {
            let db = DbGateway::open(&path).unwrap();
            db.execute_batch(
                "CREATE TABLE slaves (
                     id INTEGER PRIMARY KEY,
                     name TEXT NOT NULL UNIQUE,
                     db_path TEXT NOT NULL,
                     server_address TEXT,
                     status TEXT DEFAULT 'inactive',
                     created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                     updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
                 );",
            )
            .unwrap();
        }

        let reg = SlaveRegistry::new(&path).unwrap();
        let id = add(&reg, &dir, "branch-a");
        reg.update_sync_status(id, SlaveStatus::Active, None).unwrap();
        assert!(reg.get_slave(id).unwrap().last_sync.is_some());
    }
}
