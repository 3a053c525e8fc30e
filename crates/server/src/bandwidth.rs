use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::trace;

use crate::registry::ConnectionRegistry;

/// Samples up/downlink of every open connection each `interval`.
pub fn spawn_sampler(registry: ConnectionRegistry, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            trace!(connections = registry.len(), "sampling bandwidth");
            registry.sample_bandwidth(Instant::now().into_std());
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_http::connection::ConnectionStats;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn derives_rates_from_samples() {
        let registry = ConnectionRegistry::new();
        let stats = Arc::new(ConnectionStats::new(([127, 0, 0, 1], 1).into()));
        let _registration = registry.register(Arc::clone(&stats));

        let sampler = spawn_sampler(registry, Duration::from_secs(3));
        tokio::time::sleep(Duration::from_secs(1)).await;
        stats.record_in(6000);
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert!(stats.uplink() > 0);
        sampler.abort();
    }
}
