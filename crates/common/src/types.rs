use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Table-name prefixes invisible to replication and enumeration.
pub const RESERVED_PREFIXES: &[&str] = &["sqlite_", "_sync_", "_db_info"];

/// Returns true for store-internal and engine-internal tables.
pub fn is_reserved_table(name: &str) -> bool {
    RESERVED_PREFIXES.iter().any(|p| name.starts_with(p))
}

/// Lifecycle state of a slave as kept in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlaveStatus {
    Inactive,
    Active,
    Syncing,
    Error,
}

impl SlaveStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SlaveStatus::Inactive => "inactive",
            SlaveStatus::Active => "active",
            SlaveStatus::Syncing => "syncing",
            SlaveStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "active" => SlaveStatus::Active,
            "syncing" => SlaveStatus::Syncing,
            "error" => SlaveStatus::Error,
            _ => SlaveStatus::Inactive,
        }
    }
}

impl std::fmt::Display for SlaveStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Row-level mutation kind captured by the master triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Insert => "INSERT",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "INSERT" => Operation::Insert,
            "DELETE" => Operation::Delete,
            _ => Operation::Update,
        }
    }
}

/// One row of `_sync_tracking`, written by a capture trigger.
///
/// The JSON payloads are diagnostic: the applier re-fetches authoritative
/// rows from the master, so absent or malformed payloads never break a sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingEntry {
    pub id: i64,
    pub table_name: String,
    pub row_id: i64,
    pub operation: Operation,
    pub changed_columns: Option<serde_json::Value>,
    pub old_values: Option<serde_json::Value>,
    pub new_values: Option<serde_json::Value>,
    pub timestamp: String,
}

impl TrackingEntry {
    /// A change synthesized by the convergence scan rather than a trigger.
    pub fn synthetic(table: &str, row_id: i64, operation: Operation) -> Self {
        Self {
            id: 0,
            table_name: table.to_string(),
            row_id,
            operation,
            changed_columns: None,
            old_values: None,
            new_values: None,
            timestamp: String::new(),
        }
    }
}

/// Per-table row-id buckets of one producer poll.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableOps {
    pub inserts: Vec<i64>,
    pub updates: Vec<i64>,
    pub deletes: Vec<i64>,
}

/// Changes grouped by `(table, operation)` for one realtime fan-out.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangeBatch {
    pub tables: BTreeMap<String, TableOps>,
}

impl ChangeBatch {
    /// Group tracking entries into deduplicated per-table buckets,
    /// preserving first-seen order within each bucket.
    pub fn group(entries: &[TrackingEntry]) -> Self {
        let mut batch = ChangeBatch::default();
        for entry in entries {
            let ops = batch.tables.entry(entry.table_name.clone()).or_default();
            let bucket = match entry.operation {
                Operation::Insert => &mut ops.inserts,
                Operation::Update => &mut ops.updates,
                Operation::Delete => &mut ops.deletes,
            };
            if !bucket.contains(&entry.row_id) {
                bucket.push(entry.row_id);
            }
        }
        batch
    }

    pub fn is_empty(&self) -> bool {
        self.tables.values().all(|ops| {
            ops.inserts.is_empty() && ops.updates.is_empty() && ops.deletes.is_empty()
        })
    }

    pub fn change_count(&self) -> usize {
        self.tables
            .values()
            .map(|ops| ops.inserts.len() + ops.updates.len() + ops.deletes.len())
            .sum()
    }
}

/// Terminal state of one sync attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Success,
    Error,
    Running,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncStatus::Success => "success",
            SyncStatus::Error => "error",
            SyncStatus::Running => "running",
        }
    }
}

/// Result object every sync entry point returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncOutcome {
    pub status: SyncStatus,
    pub message: String,
    pub changes_count: u64,
    pub duration: f64,
}

impl SyncOutcome {
    pub fn success(message: impl Into<String>, changes_count: u64, duration: f64) -> Self {
        Self {
            status: SyncStatus::Success,
            message: message.into(),
            changes_count,
            duration,
        }
    }

    pub fn error(message: impl Into<String>, duration: f64) -> Self {
        Self {
            status: SyncStatus::Error,
            message: message.into(),
            changes_count: 0,
            duration,
        }
    }

    pub fn running() -> Self {
        Self {
            status: SyncStatus::Running,
            message: "A sync for this slave is already in progress".to_string(),
            changes_count: 0,
            duration: 0.0,
        }
    }
}

/// Slave catalog entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaveRecord {
    pub id: i64,
    pub name: String,
    pub db_path: String,
    pub server_address: Option<String>,
    pub status: SlaveStatus,
    pub last_sync: Option<String>,
    pub ignored_tables: Vec<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Partial update for a slave; `None` fields are left untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SlaveUpdate {
    pub name: Option<String>,
    pub db_path: Option<String>,
    pub server_address: Option<String>,
    pub status: Option<SlaveStatus>,
    pub ignored_tables: Option<Vec<String>>,
}

/// Append-only per-slave sync log record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncLogEntry {
    pub id: i64,
    pub slave_id: i64,
    pub slave_name: String,
    pub status: String,
    pub message: String,
    pub changes_count: u64,
    pub duration: f64,
    pub created_at: String,
}

/// `PRAGMA integrity_check` result for one file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityProbe {
    pub status: String,
    pub message: String,
}

/// Per-table master/slave row counts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableIntegrity {
    pub master_count: i64,
    pub slave_count: i64,
    pub difference: i64,
}

/// Full integrity comparison between a master and one slave.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub status: SyncStatus,
    pub master: IntegrityProbe,
    pub slave: IntegrityProbe,
    pub tables_count: usize,
    pub rows_count: i64,
    pub inconsistencies: i64,
    pub details: BTreeMap<String, TableIntegrity>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(table: &str, row_id: i64, op: Operation) -> TrackingEntry {
        TrackingEntry::synthetic(table, row_id, op)
    }

    #[test]
    fn test_batch_grouping_dedups_row_ids() {
        let entries = vec![
            entry("items", 1, Operation::Insert),
            entry("items", 2, Operation::Insert),
            entry("items", 1, Operation::Insert),
            entry("items", 3, Operation::Delete),
            entry("orders", 7, Operation::Update),
        ];

        let batch = ChangeBatch::group(&entries);
        assert_eq!(batch.tables["items"].inserts, vec![1, 2]);
        assert_eq!(batch.tables["items"].deletes, vec![3]);
        assert_eq!(batch.tables["orders"].updates, vec![7]);
        assert_eq!(batch.change_count(), 4);
        assert!(!batch.is_empty());
    }

    #[test]
    fn test_empty_batch() {
        let batch = ChangeBatch::group(&[]);
        assert!(batch.is_empty());
        assert_eq!(batch.change_count(), 0);
    }

    #[test]
    fn test_status_roundtrip() {
        for status in [
            SlaveStatus::Inactive,
            SlaveStatus::Active,
            SlaveStatus::Syncing,
            SlaveStatus::Error,
        ] {
            assert_eq!(SlaveStatus::parse(status.as_str()), status);
        }
        assert_eq!(SlaveStatus::parse("garbage"), SlaveStatus::Inactive);
    }

    #[test]
    fn test_operation_serde_uppercase() {
        let json = serde_json::to_string(&Operation::Insert).unwrap();
        assert_eq!(json, "\"INSERT\"");
        assert_eq!(Operation::parse("DELETE"), Operation::Delete);
    }

    #[test]
    fn test_reserved_tables() {
        assert!(is_reserved_table("sqlite_sequence"));
        assert!(is_reserved_table("_sync_tracking"));
        assert!(is_reserved_table("_db_info"));
        assert!(!is_reserved_table("items"));
    }
}
