use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::error::StorageError;
use crate::store::Store;

const CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Compact the WAL once `threshold` events have been appended since the
/// last rewrite. Returns whether a compaction ran.
pub async fn compact_if_due(store: &Store, threshold: u64) -> Result<bool, StorageError> {
    let appends = store.wal_appends_since_compact().await;
    if appends == 0 || appends < threshold {
        return Ok(false);
    }
    let result = store.compact_wal().await;
    let label = if result.is_ok() { "ok" } else { "error" };
    metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL, "result" => label).increment(1);
    result?;
    info!("compacted WAL after {appends} appends");
    Ok(true)
}

/// Background task that keeps the WAL from growing without bound.
pub async fn run_compactor(store: Arc<Store>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        if let Err(e) = compact_if_due(&store, threshold).await {
            tracing::error!("WAL compaction failed: {e}");
        }
    }
}
