mod config;
mod dispatcher;
mod metrics;
mod registry;
mod scheduler;
mod server;
mod service;

use anyhow::Result;
use std::path::Path;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    dotenvy::dotenv().ok();
    let config = config::Config::from_env()?;

    // Initialize tracing; the non-blocking file writer guard must live for
    // the whole process.
    let (file_layer, _file_guard) = match &config.log.file {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
            let dir = dir.unwrap_or_else(|| Path::new("."));
            std::fs::create_dir_all(dir)?;
            let file_name = path
                .file_name()
                .map(|n| n.to_os_string())
                .unwrap_or_else(|| "db-sync.log".into());
            let appender = tracing_appender::rolling::never(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!(
                    "sync_server={0},sync_engine={0},common={0},tower_http=info",
                    config.log.level
                )
                .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();

    info!("Starting DB Sync Service...");
    info!("Master database: {}", config.sync.master_db_path.display());
    info!(
        "Admin surface will listen on {}:{}",
        config.server.host, config.server.port
    );

    // Initialize the service (opens the master, installs change tracking,
    // opens the registry)
    let service = service::SyncService::new(config.sync.clone())?;

    // Initialize metrics
    let metrics_handle = metrics::init_metrics();

    // Background loops: periodic catch-up plus realtime forwarding
    let scheduler = scheduler::SyncScheduler::new(service.clone(), config.sync.sync_interval_secs);
    let dispatcher = dispatcher::RealtimeDispatcher::new(service.clone());
    scheduler.start();
    dispatcher.start().await?;

    let state = server::AppState {
        service,
        scheduler: scheduler.clone(),
        dispatcher: dispatcher.clone(),
        metrics: metrics_handle,
    };
    let server = server::Server::new(config.server.clone(), state);

    if let Err(e) = server.run().await {
        error!("Server error: {}", e);
    }

    info!("Shutting down background loops...");
    dispatcher.stop().await;
    scheduler.stop().await;

    Ok(())
}
