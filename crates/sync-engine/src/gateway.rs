use common::utils::quote_ident;
use common::{is_reserved_table, Error, Result};
use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::{backup, Connection, OpenFlags, Transaction};
use std::path::{Path, PathBuf};
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const STORE_PAGE_SIZE: usize = 4096;

/// A name-indexed result row.
#[derive(Debug, Clone)]
pub struct Record {
    pub columns: Vec<String>,
    pub values: Vec<Value>,
}

impl Record {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c == name)
            .map(|idx| &self.values[idx])
    }

    pub fn i64(&self, name: &str) -> i64 {
        match self.get(name) {
            Some(Value::Integer(i)) => *i,
            _ => 0,
        }
    }

    pub fn f64(&self, name: &str) -> f64 {
        match self.get(name) {
            Some(Value::Real(f)) => *f,
            Some(Value::Integer(i)) => *i as f64,
            _ => 0.0,
        }
    }

    pub fn text(&self, name: &str) -> String {
        self.opt_text(name).unwrap_or_default()
    }

    pub fn opt_text(&self, name: &str) -> Option<String> {
        match self.get(name) {
            Some(Value::Text(s)) => Some(s.clone()),
            _ => None,
        }
    }
}

/// Gateway to one embedded database file.
///
/// Serializes statements on a single connection. A gateway is owned by
/// exactly one replication path; it is never shared across slaves.
pub struct DbGateway {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl DbGateway {
    /// Open (creating if needed) with foreign keys on, WAL journaling and a
    /// busy timeout.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;

        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    /// Open an existing file read-only (snapshot sources).
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open_with_flags(&path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// User tables, excluding store-internal and engine-internal names.
    pub fn tables(&self) -> Result<Vec<String>> {
        Ok(self
            .table_names()?
            .into_iter()
            .filter(|name| !is_reserved_table(name))
            .collect())
    }

    /// Engine-internal and store-internal tables only.
    pub fn system_tables(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut names = Vec::new();
        for name in rows {
            let name = name?;
            if is_reserved_table(&name) {
                names.push(name);
            }
        }
        Ok(names)
    }

    fn table_names(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
             ORDER BY name",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut names = Vec::new();
        for name in rows {
            names.push(name?);
        }
        Ok(names)
    }

    pub fn table_exists(&self, table: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [table],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Column names of a table in declared order.
    pub fn columns(&self, table: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
        let mut columns = Vec::new();
        for column in rows {
            columns.push(column?);
        }
        Ok(columns)
    }

    /// The original CREATE statement, verbatim.
    pub fn schema_ddl(&self, table: &str) -> Result<String> {
        let conn = self.conn.lock();
        let sql: Option<String> = conn
            .query_row(
                "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [table],
                |row| row.get(0),
            )
            .map_err(Error::from)?;
        sql.ok_or_else(|| Error::NotFound(format!("no schema for table {table}")))
    }

    pub fn row_count(&self, table: &str) -> Result<i64> {
        let conn = self.conn.lock();
        let count = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", quote_ident(table)),
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Run a query and collect name-indexed rows.
    pub fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Record>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        let count = columns.len();
        let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(count);
            for idx in 0..count {
                values.push(row.get::<_, Value>(idx)?);
            }
            records.push(Record {
                columns: columns.clone(),
                values,
            });
        }
        Ok(records)
    }

    pub fn execute(&self, sql: &str, params: &[Value]) -> Result<usize> {
        let conn = self.conn.lock();
        Ok(conn.execute(sql, rusqlite::params_from_iter(params.iter()))?)
    }

    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(sql)?;
        Ok(())
    }

    /// Run a list of statements inside one transaction.
    pub fn transaction(&self, statements: &[(String, Vec<Value>)]) -> Result<()> {
        self.with_tx(|tx| {
            for (sql, params) in statements {
                tx.execute(sql, rusqlite::params_from_iter(params.iter()))?;
            }
            Ok(())
        })
    }

    /// Run a closure inside a transaction; commit on Ok, roll back on Err.
    pub fn with_tx<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    /// Borrow the raw connection for multi-statement work that does not fit
    /// the helpers above. The statement mutex is held for the duration.
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Consistent file copy through the store's online-backup primitive.
    /// `chunk_size` bounds how many bytes are copied per step.
    pub fn backup_to(&self, destination: impl AsRef<Path>, chunk_size: usize) -> Result<()> {
        let destination = destination.as_ref();
        if let Some(parent) = destination.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let pages_per_step = (chunk_size / STORE_PAGE_SIZE).max(1) as std::os::raw::c_int;

        let conn = self.conn.lock();
        let mut dst = Connection::open(destination)?;
        let backup = backup::Backup::new(&conn, &mut dst)?;
        backup.run_to_completion(pages_per_step, Duration::from_millis(10), None)?;
        Ok(())
    }

    /// Force a full WAL checkpoint so a following backup sees every commit.
    pub fn checkpoint(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.query_row("PRAGMA wal_checkpoint(FULL)", [], |_| Ok(()))?;
        Ok(())
    }

    /// First row of the store's built-in integrity probe.
    pub fn integrity_check(&self) -> Result<String> {
        let conn = self.conn.lock();
        let result = conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
        Ok(result)
    }

    /// Toggle foreign-key enforcement. Has no effect inside a transaction,
    /// so callers must flip it before opening one.
    pub fn set_foreign_keys(&self, enabled: bool) -> Result<()> {
        let conn = self.conn.lock();
        conn.pragma_update(None, "foreign_keys", enabled)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_db(dir: &TempDir, name: &str) -> DbGateway {
        let gw = DbGateway::open(dir.path().join(name)).unwrap();
        gw.execute_batch(
            "CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT);
             CREATE TABLE _sync_tracking (id INTEGER PRIMARY KEY);
             INSERT INTO items (id, name) VALUES (1, 'a'), (2, 'b');",
        )
        .unwrap();
        gw
    }

    #[test]
    fn test_tables_excludes_reserved() {
        let dir = TempDir::new().unwrap();
        let gw = test_db(&dir, "m.db");
        assert_eq!(gw.tables().unwrap(), vec!["items".to_string()]);
        assert!(gw
            .system_tables()
            .unwrap()
            .contains(&"_sync_tracking".to_string()));
    }

    #[test]
    fn test_columns_in_declared_order() {
        let dir = TempDir::new().unwrap();
        let gw = test_db(&dir, "m.db");
        assert_eq!(gw.columns("items").unwrap(), vec!["id", "name"]);
    }

    #[test]
    fn test_schema_ddl_verbatim() {
        let dir = TempDir::new().unwrap();
        let gw = test_db(&dir, "m.db");
        let ddl = gw.schema_ddl("items").unwrap();
        assert!(ddl.starts_with("CREATE TABLE items"));
    }

    #[test]
    fn test_query_returns_named_records() {
        let dir = TempDir::new().unwrap();
        let gw = test_db(&dir, "m.db");
        let rows = gw
            .query("SELECT id, name FROM items ORDER BY id", &[])
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("name"), Some(&Value::Text("a".to_string())));
        assert_eq!(rows[1].get("id"), Some(&Value::Integer(2)));
    }

    #[test]
    fn test_with_tx_rolls_back_on_error() {
        let dir = TempDir::new().unwrap();
        let gw = test_db(&dir, "m.db");
        let result: Result<()> = gw.with_tx(|tx| {
            tx.execute("INSERT INTO items (id, name) VALUES (3, 'c')", [])?;
            Err(Error::Internal("boom".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(gw.row_count("items").unwrap(), 2);
    }

    #[test]
    fn test_transaction_applies_statement_list() {
        let dir = TempDir::new().unwrap();
        let gw = test_db(&dir, "m.db");
        gw.transaction(&[
            (
                "INSERT INTO items (id, name) VALUES (?1, ?2)".to_string(),
                vec![Value::Integer(3), Value::Text("c".to_string())],
            ),
            (
                "DELETE FROM items WHERE id = ?1".to_string(),
                vec![Value::Integer(1)],
            ),
        ])
        .unwrap();
        assert_eq!(gw.row_count("items").unwrap(), 2);
    }

    #[test]
    fn test_backup_produces_consistent_copy() {
        let dir = TempDir::new().unwrap();
        let gw = test_db(&dir, "m.db");
        let copy_path = dir.path().join("copy.db");
        gw.backup_to(&copy_path, 1024 * 1024).unwrap();

        let copy = DbGateway::open_read_only(&copy_path).unwrap();
        assert_eq!(copy.row_count("items").unwrap(), 2);
    }

    #[test]
    fn test_integrity_check_ok() {
        let dir = TempDir::new().unwrap();
        let gw = test_db(&dir, "m.db");
        assert_eq!(gw.integrity_check().unwrap(), "ok");
    }
}
