use anyhow::{Context, Result};
use common::config::{LogSettings, ServerSettings, SyncSettings};

#[derive(Debug, Clone)]
pub struct Config {
    pub sync: SyncSettings,
    pub server: ServerSettings,
    pub log: LogSettings,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let master_db_path =
            std::env::var("MASTER_DB_PATH").context("MASTER_DB_PATH must be set")?;
        let mut sync = SyncSettings::for_master(master_db_path);

        if let Ok(path) = std::env::var("REGISTRY_DB_PATH") {
            sync.registry_db_path = path.into();
        }
        sync.sync_interval_secs = std::env::var("SYNC_INTERVAL")
            .unwrap_or_else(|_| "60".to_string())
            .parse()
            .context("SYNC_INTERVAL must be a number of seconds")?;
        if let Ok(tables) = std::env::var("IGNORED_TABLES") {
            sync.ignored_tables = tables
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(String::from)
                .collect();
        }
        if let Ok(dir) = std::env::var("TEMP_DIR") {
            sync.temp_dir = dir.into();
        }
        if let Ok(size) = std::env::var("CHUNK_SIZE") {
            sync.chunk_size = size.parse().context("CHUNK_SIZE must be a number of bytes")?;
        }
        if let Ok(days) = std::env::var("PROCESSED_RETENTION_DAYS") {
            sync.processed_retention_days = Some(
                days.parse()
                    .context("PROCESSED_RETENTION_DAYS must be a number of days")?,
            );
        }

        let server = ServerSettings {
            host: std::env::var("WEB_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: std::env::var("WEB_PORT")
                .unwrap_or_else(|_| "5000".to_string())
                .parse()
                .context("WEB_PORT must be a port number")?,
        };

        let log = LogSettings {
            level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            file: std::env::var("LOG_FILE").ok().map(Into::into),
        };

        Ok(Config { sync, server, log })
    }
}
