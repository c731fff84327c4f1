use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

/// Initialize Prometheus metrics
pub fn init_metrics() -> PrometheusHandle {
    const EXPONENTIAL_SECONDS: &[f64] = &[
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ];

    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("db_sync_duration_seconds".to_string()),
            EXPONENTIAL_SECONDS,
        )
        .unwrap()
        .install_recorder()
        .unwrap()
}

// Metric recording functions
pub fn record_sync(slave: &str, status: &str) {
    counter!(
        "db_sync_runs_total",
        "slave" => slave.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn record_sync_duration(duration_secs: f64) {
    histogram!("db_sync_duration_seconds").record(duration_secs);
}

pub fn record_realtime_batch(slave: &str, applied: u64) {
    counter!(
        "db_sync_realtime_changes_total",
        "slave" => slave.to_string()
    )
    .increment(applied);
}

pub fn set_realtime_queue(depth: usize) {
    gauge!("db_sync_realtime_queue_depth").set(depth as f64);
}
