use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::engine::Engine;
use crate::store::WalStore;

/// Background task that periodically promotes ended reservations to passed.
pub async fn run_sweeper(engine: Arc<Engine>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        let started = std::time::Instant::now();
        match engine.sweep_passed().await {
            Ok(passed) => debug!("sweep done, {} passed", passed.len()),
            // Storage outage: nothing was changed, try again next tick.
            Err(e) => error!("sweep failed: {e}"),
        }
        metrics::histogram!(crate::observability::SWEEP_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
    }
}

/// Background task that compacts the log once enough appends piled up.
pub async fn run_compactor(store: Arc<WalStore>, threshold: u64, period: Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        let appends = store.appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match store.compact().await {
            Ok(()) => info!("compacted {} after {appends} appends", store.path().display()),
            Err(e) => error!("compaction failed: {e}"),
        }
    }
}
