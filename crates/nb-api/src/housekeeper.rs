use std::sync::Arc;
use std::time::Duration;

use nb_driver::PoolDriver;

/// Spawn the background housekeeping loop.
pub fn spawn_housekeeper(driver: Arc<PoolDriver>, interval_secs: u64) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            match driver.housekeep().await {
                Ok(Some(action)) => tracing::debug!(?action, "housekeeping tick"),
                Ok(None) => tracing::debug!("housekeeping tick skipped"),
                Err(e) => tracing::error!(error = %e, "housekeeping tick failed"),
            }
        }
    });
}
