use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default streaming copy bound: 10 MiB.
pub const DEFAULT_CHUNK_SIZE: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Path to the master database. Required; the daemon refuses to start
    /// without an existing master file.
    pub master_db_path: PathBuf,
    /// Registry database holding `slaves`, `ignored_tables`, `sync_logs`.
    pub registry_db_path: PathBuf,
    /// Seconds between periodic scheduler ticks.
    pub sync_interval_secs: u64,
    /// Tables excluded from replication for every slave, merged with each
    /// slave's own ignored set.
    pub ignored_tables: Vec<String>,
    /// Directory for point-in-time snapshot copies during initial seeds.
    pub temp_dir: PathBuf,
    /// Upper bound in bytes for streaming copies (snapshot backup step).
    pub chunk_size: usize,
    /// Retention window for the processed-change cursor; `None` keeps it
    /// unbounded.
    pub processed_retention_days: Option<u32>,
}

impl SyncSettings {
    pub fn for_master(master_db_path: impl Into<PathBuf>) -> Self {
        let master_db_path = master_db_path.into();
        let registry_db_path = master_db_path
            .parent()
            .map(|dir| dir.join("sync_registry.db"))
            .unwrap_or_else(|| PathBuf::from("sync_registry.db"));
        Self {
            master_db_path,
            registry_db_path,
            sync_interval_secs: 60,
            ignored_tables: Vec::new(),
            temp_dir: std::env::temp_dir().join("db-sync"),
            chunk_size: DEFAULT_CHUNK_SIZE,
            processed_retention_days: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    pub level: String,
    pub file: Option<PathBuf>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}
