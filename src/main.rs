use std::sync::Arc;

use tracing::info;

use studiobook::clock::SystemClock;
use studiobook::config::Config;
use studiobook::engine::Engine;
use studiobook::notify::NotifyHub;
use studiobook::store::WalStore;
use studiobook::sweeper;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env()?;
    studiobook::observability::init(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)?;
    let store = Arc::new(WalStore::open(&config.wal_path())?);
    let hub = Arc::new(NotifyHub::new());
    let engine = Arc::new(Engine::new(
        store.clone(),
        hub.clone(),
        Arc::new(SystemClock),
        config.approval_policy(),
    ));

    let registered = engine.register_all(config.load_resources()?);
    info!("studiobook running");
    info!("  resources: {registered} from {}", config.resources_path().display());
    info!("  data_dir: {}", config.data_dir.display());
    info!("  sweep every {:?}", config.sweep_interval);
    info!("  auto-approve: {:?}", config.auto_approve);
    info!("  metrics: {}", config.metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    let sweep = tokio::spawn(sweeper::run_sweeper(engine.clone(), config.sweep_interval));
    let compact = tokio::spawn(sweeper::run_compactor(
        store.clone(),
        config.compact_threshold,
        config.compact_interval,
    ));

    // Stand-in dispatcher: log every lifecycle event until a mailer subscribes.
    let mut events = hub.subscribe_all();
    let log_events = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            info!("{:?} {} ({})", event.kind, event.reservation.id, event.reservation.primary_key());
        }
    });

    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => {}
                        _ = sigterm.recv() => {}
                    }
                }
                Err(e) => {
                    tracing::warn!("no SIGTERM handler: {e}");
                    ctrl_c.await.ok();
                }
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };
    shutdown.await;

    info!("shutdown signal received");
    sweep.abort();
    compact.abort();
    log_events.abort();
    if let Err(e) = store.compact().await {
        tracing::warn!("final compaction failed: {e}");
    }
    info!("studiobook stopped");
    Ok(())
}
