use crate::metrics;
use crate::service::SyncService;
use common::utils::calculate_backoff_duration;
use common::ChangeBatch;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Producer poll cadence and read size.
const POLL_INTERVAL: Duration = Duration::from_millis(500);
const POLL_LIMIT: usize = 100;
/// Per-worker channel bound; a full channel pauses the producer rather than
/// dropping batches.
const WORKER_QUEUE_CAPACITY: usize = 64;
/// Worker back-off after a transient store error.
const WORKER_BACKOFF_BASE_MS: u64 = 2000;
const WORKER_BACKOFF_MAX_MS: u64 = 30_000;
/// Bound on joining workers at shutdown; stragglers are leaked and logged.
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize)]
pub struct RealtimeStatus {
    pub active: bool,
    pub queue_size: usize,
}

/// Low-latency change forwarder: one producer polling the master's
/// unprocessed-change cursor, one worker per live slave applying batches.
pub struct RealtimeDispatcher {
    service: SyncService,
    queue_depth: Arc<AtomicUsize>,
    state: Mutex<Option<DispatcherState>>,
}

struct DispatcherState {
    cancel: CancellationToken,
    producer: JoinHandle<()>,
}

struct Worker {
    sender: mpsc::Sender<ChangeBatch>,
    handle: JoinHandle<()>,
}

impl RealtimeDispatcher {
    pub fn new(service: SyncService) -> Arc<Self> {
        Arc::new(Self {
            service,
            queue_depth: Arc::new(AtomicUsize::new(0)),
            state: Mutex::new(None),
        })
    }

    /// Idempotent. Refreshes master triggers before the producer starts so
    /// tables created since boot are captured.
    pub async fn start(&self) -> common::Result<bool> {
        {
            let state = self.state.lock();
            if state.is_some() {
                info!("Realtime sync already running");
                return Ok(false);
            }
        }

        self.service.install_capture().await?;

        let mut state = self.state.lock();
        if state.is_some() {
            return Ok(false);
        }
        let cancel = CancellationToken::new();
        let producer = tokio::spawn(producer_loop(
            self.service.clone(),
            self.queue_depth.clone(),
            cancel.clone(),
        ));
        *state = Some(DispatcherState { cancel, producer });
        info!("Realtime sync started");
        Ok(true)
    }

    /// Idempotent. The producer exits first, worker channels drain, then
    /// workers are joined with a bounded wait.
    pub async fn stop(&self) -> bool {
        let Some(state) = self.state.lock().take() else {
            info!("Realtime sync not running");
            return false;
        };
        state.cancel.cancel();
        if tokio::time::timeout(JOIN_TIMEOUT * 2, state.producer)
            .await
            .is_err()
        {
            warn!("Realtime producer did not stop in time, leaking it");
        }
        self.queue_depth.store(0, Ordering::SeqCst);
        metrics::set_realtime_queue(0);
        info!("Realtime sync stopped");
        true
    }

    pub fn status(&self) -> RealtimeStatus {
        RealtimeStatus {
            active: self.state.lock().is_some(),
            queue_size: self.queue_depth.load(Ordering::SeqCst),
        }
    }
}

/// Poll unprocessed changes, fan each batch out to every live worker, then
/// advance the processed cursor. Marking-after-enqueue preserves cross-batch
/// ordering: a crash before the mark only re-dispatches, and applies are
/// idempotent.
async fn producer_loop(
    service: SyncService,
    queue_depth: Arc<AtomicUsize>,
    cancel: CancellationToken,
) {
    let mut workers: HashMap<i64, Worker> = HashMap::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }

        let slaves = match service.list_slaves().await {
            Ok(slaves) => slaves,
            Err(e) => {
                error!("Realtime producer could not list slaves: {}", e);
                tokio::time::sleep(Duration::from_secs(5)).await;
                continue;
            }
        };
        reconcile_workers(&service, &queue_depth, &mut workers, &slaves).await;

        let changes = {
            let service = service.clone();
            match tokio::task::spawn_blocking(move || service.capture().unprocessed_changes(POLL_LIMIT))
                .await
            {
                Ok(Ok(changes)) => changes,
                Ok(Err(e)) => {
                    error!("Reading unprocessed changes failed: {}", e);
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    continue;
                }
                Err(e) => {
                    error!("Change poll task failed: {}", e);
                    continue;
                }
            }
        };
        if changes.is_empty() {
            continue;
        }

        debug!("Dispatching {} changes to {} workers", changes.len(), workers.len());
        let batch = ChangeBatch::group(&changes);
        for worker in workers.values() {
            queue_depth.fetch_add(1, Ordering::SeqCst);
            metrics::set_realtime_queue(queue_depth.load(Ordering::SeqCst));
            // A full channel blocks here: backpressure pauses polling
            // instead of dropping the batch.
            if worker.sender.send(batch.clone()).await.is_err() {
                queue_depth.fetch_sub(1, Ordering::SeqCst);
            }
        }

        let change_ids: Vec<i64> = changes.iter().map(|c| c.id).collect();
        let mark = {
            let service = service.clone();
            tokio::task::spawn_blocking(move || service.capture().mark_processed(&change_ids)).await
        };
        match mark {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Marking changes processed failed: {}", e),
            Err(e) => error!("Mark task failed: {}", e),
        }
    }

    shutdown_workers(workers).await;
}

/// Launch workers for new slaves, retire workers for deleted ones.
async fn reconcile_workers(
    service: &SyncService,
    queue_depth: &Arc<AtomicUsize>,
    workers: &mut HashMap<i64, Worker>,
    slaves: &[common::SlaveRecord],
) {
    let live_ids: Vec<i64> = slaves.iter().map(|s| s.id).collect();

    for slave in slaves {
        if !workers.contains_key(&slave.id) {
            let (sender, receiver) = mpsc::channel(WORKER_QUEUE_CAPACITY);
            let handle = spawn_worker(
                service.clone(),
                slave.id,
                receiver,
                queue_depth.clone(),
            );
            workers.insert(slave.id, Worker { sender, handle });
            debug!("Started realtime worker for slave {}", slave.id);
        }
    }

    let gone: Vec<i64> = workers
        .keys()
        .copied()
        .filter(|id| !live_ids.contains(id))
        .collect();
    for slave_id in gone {
        if let Some(worker) = workers.remove(&slave_id) {
            drop(worker.sender);
            if tokio::time::timeout(Duration::from_secs(1), worker.handle)
                .await
                .is_err()
            {
                warn!("Worker for deleted slave {} did not stop in time", slave_id);
            }
            debug!("Retired realtime worker for slave {}", slave_id);
        }
    }
}

fn spawn_worker(
    service: SyncService,
    slave_id: i64,
    mut receiver: mpsc::Receiver<ChangeBatch>,
    queue_depth: Arc<AtomicUsize>,
) -> JoinHandle<()> {
    // Workers are all-blocking: they live on the blocking pool and drain
    // their channel with blocking_recv until the producer drops the sender.
    tokio::task::spawn_blocking(move || {
        let mut attempt = 0u32;
        while let Some(batch) = receiver.blocking_recv() {
            queue_depth.fetch_sub(1, Ordering::SeqCst);
            metrics::set_realtime_queue(queue_depth.load(Ordering::SeqCst));

            match service.apply_realtime_batch(slave_id, &batch) {
                Ok(applied) => {
                    attempt = 0;
                    if applied > 0 {
                        debug!("Slave {}: applied {} realtime changes", slave_id, applied);
                    }
                }
                Err(e) if e.is_transient() => {
                    warn!("Slave {}: transient store error, backing off: {}", slave_id, e);
                    std::thread::sleep(calculate_backoff_duration(
                        attempt,
                        WORKER_BACKOFF_BASE_MS,
                        WORKER_BACKOFF_MAX_MS,
                    ));
                    attempt = attempt.saturating_add(1);
                }
                Err(e) => {
                    error!("Slave {}: realtime apply failed: {}", slave_id, e);
                    service.record_realtime_failure(
                        slave_id,
                        &format!("Realtime apply failed: {e}"),
                    );
                }
            }
        }
        debug!("Realtime worker for slave {} exited", slave_id);
    })
}

async fn shutdown_workers(workers: HashMap<i64, Worker>) {
    let mut handles = Vec::with_capacity(workers.len());
    for (slave_id, worker) in workers {
        drop(worker.sender);
        handles.push((slave_id, worker.handle));
    }
    for (slave_id, handle) in handles {
        if tokio::time::timeout(JOIN_TIMEOUT, handle).await.is_err() {
            warn!("Realtime worker for slave {} leaked at shutdown", slave_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::config::SyncSettings;
    use common::SyncStatus;
    use sync_engine::DbGateway;
    use tempfile::TempDir;

    fn service(dir: &TempDir) -> SyncService {
        let master_path = dir.path().join("master.db");
        {
            let master = DbGateway::open(&master_path).unwrap();
            master
                .execute_batch("CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT);")
                .unwrap();
        }
        let mut settings = SyncSettings::for_master(&master_path);
        settings.registry_db_path = dir.path().join("registry.db");
        settings.temp_dir = dir.path().join("tmp");
        SyncService::new(settings).unwrap()
    }

    #[tokio::test]
    async fn test_status_reflects_lifecycle() {
        let dir = TempDir::new().unwrap();
        let dispatcher = RealtimeDispatcher::new(service(&dir));

        assert!(!dispatcher.status().active);
        assert!(dispatcher.start().await.unwrap());
        assert!(!dispatcher.start().await.unwrap());
        assert!(dispatcher.status().active);

        assert!(dispatcher.stop().await);
        assert!(!dispatcher.stop().await);
        assert!(!dispatcher.status().active);
        assert_eq!(dispatcher.status().queue_size, 0);
    }

    #[tokio::test]
    async fn test_changes_flow_to_active_slave() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);
        let slave = service
            .add_slave(
                "branch-a".to_string(),
                dir.path().join("slave.db").display().to_string(),
                None,
                vec![],
            )
            .await
            .unwrap();
        // Seed marks the slave active, which the worker requires.
        let outcome = service.sync_slave(slave.id, true, false).await.unwrap();
        assert_eq!(outcome.status, SyncStatus::Success);

        let dispatcher = RealtimeDispatcher::new(service.clone());
        dispatcher.start().await.unwrap();

        {
            let master = DbGateway::open(dir.path().join("master.db")).unwrap();
            master
                .execute("INSERT INTO items (id, name) VALUES (1, 'rt')", &[])
                .unwrap();
        }

        let slave_db = DbGateway::open(dir.path().join("slave.db")).unwrap();
        let mut replicated = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if slave_db.row_count("items").unwrap() == 1 {
                replicated = true;
                break;
            }
        }
        dispatcher.stop().await;
        assert!(replicated, "realtime change never reached the slave");

        // The producer advanced the cursor once the batch was enqueued.
        let unprocessed = service.capture().unprocessed_changes(10).unwrap();
        assert!(unprocessed.is_empty());
    }
}
