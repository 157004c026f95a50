//! Periodic eviction of expired grants

use crate::auth::now_nanos;
use crate::registry::SharedRegistry;
use std::time::Duration;
use tracing::{debug, info};

/// Evict expired grants every `period` until the task is dropped
pub async fn run_sweeper(registry: SharedRegistry, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let swept = sweep(&registry);
        if swept > 0 {
            info!(evicted = swept, "Evicted expired grants");
        } else {
            debug!("Sweep found nothing to evict");
        }
    }
}

/// One eviction pass. Returns how many grants were removed.
pub fn sweep(registry: &SharedRegistry) -> usize {
    let evicted = {
        let mut registry = registry.lock();
        let horizon = registry.horizon();
        registry.evict_expired(now_nanos(), horizon)
    };
    for grant in &evicted {
        grant.secrets.discard();
    }
    evicted.len()
}
