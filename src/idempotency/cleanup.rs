use crate::error::Result;
use crate::idempotency::storage::ExpiringStore;
use crate::observability::get_metrics;
use std::sync::Arc;

/// Background job removing expired idempotency resources.
pub struct IdempotencyCleanupJob {
    store: Arc<dyn ExpiringStore>,
    interval_seconds: u64,
}

impl IdempotencyCleanupJob {
    pub fn new(store: Arc<dyn ExpiringStore>, interval_seconds: u64) -> Self {
        Self {
            store,
            interval_seconds,
        }
    }

    /// Runs the cleanup job once.
    pub async fn run_once(&self) -> Result<u64> {
        let count = self.store.purge_expired().await?;
        get_metrics().record_purged(count);
        Ok(count)
    }

    /// Starts the cleanup job in a background task.
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(
                tokio::time::Duration::from_secs(self.interval_seconds.max(1))
            );

            loop {
                interval.tick().await;

                match self.run_once().await {
                    Ok(count) => {
                        if count > 0 {
                            tracing::info!("Cleaned up {} expired idempotency resources", count);
                        }
                    }
                    Err(e) => {
                        tracing::error!("Failed to clean up expired idempotency resources: {}", e);
                    }
                }
            }
        })
    }
}
