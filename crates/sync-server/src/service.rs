use crate::metrics;
use crate::registry::SlaveRegistry;
use common::config::SyncSettings;
use common::utils::{now_timestamp, timestamp_drift_secs};
use common::{
    ChangeBatch, Error, IntegrityReport, Result, SlaveRecord, SlaveStatus, SlaveUpdate,
    SyncLogEntry, SyncOutcome, SyncStatus,
};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use sync_engine::{ChangeCapture, DbGateway, EngineOptions, SyncEngine};
use tracing::{error, info, warn};

/// Clock drift beyond which the slave's cursor is authoritative and is
/// propagated back to the registry.
const MAX_TIMESTAMP_DRIFT_SECS: i64 = 300;

const STATUS_LOG_LIMIT: usize = 5;

/// One slave plus its recent sync history, as reported by `get_status`.
#[derive(Debug, Clone, Serialize)]
pub struct SlaveStatusView {
    pub slave: SlaveRecord,
    pub logs: Vec<SyncLogEntry>,
}

/// Owns the registry, the master capture substrate and the per-slave engine
/// cache. The admin surface, the scheduler and the realtime dispatcher all
/// go through this one value; there is no hidden global state.
///
/// Cheap to clone (shared inner). The engine core blocks on SQLite, so
/// every async entry point hops onto the blocking pool and delegates to its
/// `_blocking` counterpart.
#[derive(Clone)]
pub struct SyncService {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    settings: SyncSettings,
    registry: SlaveRegistry,
    master: Arc<DbGateway>,
    capture: ChangeCapture,
    engines: DashMap<i64, Arc<SyncEngine>>,
}

impl SyncService {
    pub fn new(settings: SyncSettings) -> Result<Self> {
        if !settings.master_db_path.exists() {
            return Err(Error::Config(format!(
                "master database not found: {}",
                settings.master_db_path.display()
            )));
        }
        std::fs::create_dir_all(&settings.temp_dir)?;

        let master = Arc::new(DbGateway::open(&settings.master_db_path)?);
        let capture = ChangeCapture::new(master.clone());
        capture.install()?;

        let registry = SlaveRegistry::new(&settings.registry_db_path)?;
        info!(
            "Sync service ready (master: {}, registry: {})",
            settings.master_db_path.display(),
            settings.registry_db_path.display()
        );

        Ok(Self {
            inner: Arc::new(ServiceInner {
                settings,
                registry,
                master,
                capture,
                engines: DashMap::new(),
            }),
        })
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.inner.settings
    }

    pub fn registry(&self) -> &SlaveRegistry {
        &self.inner.registry
    }

    pub fn capture(&self) -> &ChangeCapture {
        &self.inner.capture
    }

    /// Cached per-slave engine; built on first use with the global and
    /// per-slave ignored sets merged.
    fn engine_for(&self, slave: &SlaveRecord) -> Result<Arc<SyncEngine>> {
        if let Some(engine) = self.inner.engines.get(&slave.id) {
            return Ok(engine.clone());
        }
        let mut ignored = self.inner.settings.ignored_tables.clone();
        ignored.extend(slave.ignored_tables.iter().cloned());
        let engine = Arc::new(SyncEngine::new(
            &self.inner.settings.master_db_path,
            &slave.db_path,
            ignored,
            EngineOptions {
                temp_dir: self.inner.settings.temp_dir.clone(),
                chunk_size: self.inner.settings.chunk_size,
            },
        )?);
        self.inner.engines.insert(slave.id, engine.clone());
        Ok(engine)
    }

    fn invalidate_engine(&self, slave_id: i64) {
        self.inner.engines.remove(&slave_id);
    }

    #[cfg(test)]
    fn has_cached_engine(&self, slave_id: i64) -> bool {
        self.inner.engines.contains_key(&slave_id)
    }

    /// Run one sync attempt for a slave: status bookkeeping, the engine
    /// call, timestamp reconciliation and the sync-log entry.
    pub fn sync_slave_blocking(
        &self,
        slave_id: i64,
        initial: bool,
        force: bool,
    ) -> Result<SyncOutcome> {
        let registry = &self.inner.registry;
        let slave = registry.get_slave(slave_id)?;
        let kind = if initial {
            "initial"
        } else if force {
            "forced"
        } else {
            "incremental"
        };
        info!("Starting {} sync for slave {}", kind, slave.name);

        registry.update_sync_status(slave_id, SlaveStatus::Syncing, None)?;

        let outcome = match self.engine_for(&slave) {
            Ok(engine) => {
                let outcome = if initial {
                    engine.initial_sync()
                } else if force {
                    engine.force_full_sync()
                } else {
                    engine.sync_databases()
                };

                if outcome.status == SyncStatus::Running {
                    // Another path holds the slave; put the previous status
                    // back and report without logging a failed attempt.
                    registry.update_sync_status(slave_id, slave.status, None)?;
                    return Ok(outcome);
                }

                let status = if outcome.status == SyncStatus::Success {
                    SlaveStatus::Active
                } else {
                    SlaveStatus::Error
                };
                let registry_now = now_timestamp();
                let last_sync = match engine.last_sync_timestamp() {
                    Ok(cursor)
                        if timestamp_drift_secs(&cursor, &registry_now)
                            > MAX_TIMESTAMP_DRIFT_SECS =>
                    {
                        warn!(
                            "Timestamp drift for slave {}: cursor={}, registry={}",
                            slave.name, cursor, registry_now
                        );
                        cursor
                    }
                    _ => registry_now,
                };
                registry.update_sync_status(slave_id, status, Some(&last_sync))?;
                outcome
            }
            Err(e) => {
                error!("Could not build engine for slave {}: {}", slave.name, e);
                registry.update_sync_status(slave_id, SlaveStatus::Error, None)?;
                SyncOutcome::error(format!("Could not open replication engine: {e}"), 0.0)
            }
        };

        registry.add_sync_log(
            slave_id,
            outcome.status,
            &outcome.message,
            outcome.changes_count,
            outcome.duration,
        )?;
        metrics::record_sync(&slave.name, outcome.status.as_str());
        metrics::record_sync_duration(outcome.duration);

        Ok(outcome)
    }

    pub async fn sync_slave(
        &self,
        slave_id: i64,
        initial: bool,
        force: bool,
    ) -> Result<SyncOutcome> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.sync_slave_blocking(slave_id, initial, force))
            .await
            .map_err(join_error)?
    }

    /// Realtime worker path: apply one producer batch to one slave. Slaves
    /// not in `active` status are skipped.
    pub fn apply_realtime_batch(&self, slave_id: i64, batch: &ChangeBatch) -> Result<u64> {
        let slave = self.inner.registry.get_slave(slave_id)?;
        if slave.status != SlaveStatus::Active {
            return Ok(0);
        }
        let engine = self.engine_for(&slave)?;
        let applied = engine.apply_batch(batch)?;
        metrics::record_realtime_batch(&slave.name, applied);
        Ok(applied)
    }

    /// Best-effort sync-log entry for a realtime failure.
    pub fn record_realtime_failure(&self, slave_id: i64, message: &str) {
        if let Err(e) =
            self.inner
                .registry
                .add_sync_log(slave_id, SyncStatus::Error, message, 0, 0.0)
        {
            warn!("Could not record realtime failure for slave {}: {}", slave_id, e);
        }
    }

    pub fn add_slave_blocking(
        &self,
        name: String,
        db_path: String,
        server_address: Option<String>,
        ignored_tables: Vec<String>,
    ) -> Result<SlaveRecord> {
        let id = self.inner.registry.add_slave(
            &name,
            &db_path,
            server_address.as_deref(),
            &ignored_tables,
        )?;
        self.inner.registry.get_slave(id)
    }

    pub async fn add_slave(
        &self,
        name: String,
        db_path: String,
        server_address: Option<String>,
        ignored_tables: Vec<String>,
    ) -> Result<SlaveRecord> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || {
            this.add_slave_blocking(name, db_path, server_address, ignored_tables)
        })
        .await
        .map_err(join_error)?
    }

    pub fn update_slave_blocking(&self, slave_id: i64, update: SlaveUpdate) -> Result<SlaveRecord> {
        self.inner.registry.update_slave(slave_id, &update)?;
        self.invalidate_engine(slave_id);
        self.inner.registry.get_slave(slave_id)
    }

    pub async fn update_slave(&self, slave_id: i64, update: SlaveUpdate) -> Result<SlaveRecord> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.update_slave_blocking(slave_id, update))
            .await
            .map_err(join_error)?
    }

    pub fn delete_slave_blocking(&self, slave_id: i64) -> Result<()> {
        self.inner.registry.delete_slave(slave_id)?;
        self.invalidate_engine(slave_id);
        Ok(())
    }

    pub async fn delete_slave(&self, slave_id: i64) -> Result<()> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.delete_slave_blocking(slave_id))
            .await
            .map_err(join_error)?
    }

    pub async fn get_slave(&self, slave_id: i64) -> Result<SlaveRecord> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.inner.registry.get_slave(slave_id))
            .await
            .map_err(join_error)?
    }

    pub async fn list_slaves(&self) -> Result<Vec<SlaveRecord>> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.inner.registry.list_slaves())
            .await
            .map_err(join_error)?
    }

    pub fn status_blocking(&self) -> Result<Vec<SlaveStatusView>> {
        let slaves = self.inner.registry.list_slaves()?;
        let mut views = Vec::with_capacity(slaves.len());
        for slave in slaves {
            let logs = self
                .inner
                .registry
                .get_logs(Some(slave.id), STATUS_LOG_LIMIT)?;
            views.push(SlaveStatusView { slave, logs });
        }
        Ok(views)
    }

    pub async fn status(&self) -> Result<Vec<SlaveStatusView>> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.status_blocking())
            .await
            .map_err(join_error)?
    }

    pub fn verify_integrity_blocking(&self, slave_id: i64) -> Result<IntegrityReport> {
        let slave = self.inner.registry.get_slave(slave_id)?;
        let engine = self.engine_for(&slave)?;
        engine.verify_integrity()
    }

    pub async fn verify_integrity(&self, slave_id: i64) -> Result<IntegrityReport> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.verify_integrity_blocking(slave_id))
            .await
            .map_err(join_error)?
    }

    pub async fn list_tables(&self) -> Result<Vec<String>> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.inner.master.tables())
            .await
            .map_err(join_error)?
    }

    pub async fn list_system_tables(&self) -> Result<Vec<String>> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.inner.master.system_tables())
            .await
            .map_err(join_error)?
    }

    pub async fn get_logs(&self, slave_id: Option<i64>, limit: usize) -> Result<Vec<SyncLogEntry>> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.inner.registry.get_logs(slave_id, limit))
            .await
            .map_err(join_error)?
    }

    /// Re-scan the master for new user tables and refresh triggers.
    pub async fn install_capture(&self) -> Result<()> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.inner.capture.install())
            .await
            .map_err(join_error)?
    }

    /// Drop archived tracking rows when a retention window is configured.
    pub async fn prune_processed(&self) -> Result<usize> {
        let Some(days) = self.inner.settings.processed_retention_days else {
            return Ok(0);
        };
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.inner.capture.prune_processed(days))
            .await
            .map_err(join_error)?
    }
}

fn join_error(e: tokio::task::JoinError) -> Error {
    Error::Internal(format!("blocking task failed: {e}"))
}
