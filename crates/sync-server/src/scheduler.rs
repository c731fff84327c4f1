use crate::service::SyncService;
use common::SlaveStatus;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Spacing between slaves within one tick, to smooth load on the master.
const SLAVE_SPACING: Duration = Duration::from_secs(1);
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Periodic catch-up loop: walks the registry every `sync_interval` seconds
/// and runs an incremental sync for every slave not already syncing.
pub struct SyncScheduler {
    service: SyncService,
    interval: Duration,
    state: Mutex<Option<LoopState>>,
}

struct LoopState {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl SyncScheduler {
    pub fn new(service: SyncService, interval_secs: u64) -> Arc<Self> {
        Arc::new(Self {
            service,
            interval: Duration::from_secs(interval_secs.max(1)),
            state: Mutex::new(None),
        })
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().is_some()
    }

    /// Idempotent: starting a running scheduler is a no-op.
    pub fn start(&self) -> bool {
        let mut state = self.state.lock();
        if state.is_some() {
            info!("Periodic sync already running");
            return false;
        }
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_loop(
            self.service.clone(),
            self.interval,
            cancel.clone(),
        ));
        *state = Some(LoopState { cancel, handle });
        true
    }

    /// Idempotent: stopping a stopped scheduler is a no-op. Waits for the
    /// loop to observe the signal, bounded by a timeout.
    pub async fn stop(&self) -> bool {
        let Some(state) = self.state.lock().take() else {
            info!("Periodic sync not running");
            return false;
        };
        state.cancel.cancel();
        if tokio::time::timeout(STOP_TIMEOUT, state.handle).await.is_err() {
            warn!("Periodic sync loop did not stop within {:?}", STOP_TIMEOUT);
        }
        true
    }
}

async fn run_loop(service: SyncService, interval: Duration, cancel: CancellationToken) {
    info!("Periodic sync started (interval: {:?})", interval);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        sync_all_slaves(&service, &cancel).await;

        match service.prune_processed().await {
            Ok(0) => {}
            Ok(pruned) => info!("Pruned {} archived tracking rows", pruned),
            Err(e) => warn!("Pruning processed changes failed: {}", e),
        }
    }
    info!("Periodic sync stopped");
}

async fn sync_all_slaves(service: &SyncService, cancel: &CancellationToken) {
    let slaves = match service.list_slaves().await {
        Ok(slaves) => slaves,
        Err(e) => {
            error!("Could not list slaves: {}", e);
            return;
        }
    };

    for slave in slaves {
        if cancel.is_cancelled() {
            return;
        }
        if slave.status == SlaveStatus::Syncing {
            info!("Slave {} already syncing, skipping", slave.name);
            continue;
        }
        if let Err(e) = service.sync_slave(slave.id, false, false).await {
            error!("Periodic sync failed for slave {}: {}", slave.name, e);
        }
        tokio::time::sleep(SLAVE_SPACING).await;
    }
}
