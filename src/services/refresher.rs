//! Periodic subscription refresh
//!
//! Re-resolves the feed on a fixed interval and swaps the ranked result into
//! the shared queue. The running candidate is left alone; the new pool takes
//! effect at the next rotation.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{error, info, instrument, warn};

use crate::proxy::queue::SharedQueue;
use crate::proxy::subscription::CandidateSource;
use crate::shutdown::cancelled;

/// Background task replacing the candidate pool on every interval
pub struct SubscriptionRefresher {
    source: Arc<dyn CandidateSource>,
    queue: SharedQueue,
    interval: Duration,
}

impl SubscriptionRefresher {
    pub fn new(source: Arc<dyn CandidateSource>, queue: SharedQueue, interval: Duration) -> Self {
        Self {
            source,
            queue,
            interval,
        }
    }

    /// Resolve once and replace the queue.
    ///
    /// A failed or empty resolution keeps the current pool; returns whether
    /// the queue was replaced.
    pub async fn refresh(&self) -> bool {
        match self.source.resolve().await {
            Ok(candidates) if candidates.is_empty() => {
                warn!("Subscription returned no usable proxies, keeping current pool");
                false
            }
            Ok(candidates) => {
                info!("Subscription refreshed with {} proxies", candidates.len());
                self.queue.replace(candidates);
                true
            }
            Err(e) if e.is_fatal() => {
                error!("Subscription refresh rejected, keeping current pool: {}", e);
                false
            }
            Err(e) => {
                warn!("Subscription refresh failed, keeping current pool: {}", e);
                false
            }
        }
    }

    /// Run until shutdown. The first refresh happens one interval after start.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting subscription refresher (every {}h)",
            self.interval.as_secs() / 3600
        );

        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancelled(&mut shutdown) => break,
            }

            tokio::select! {
                _ = self.refresh() => {}
                _ = cancelled(&mut shutdown) => break,
            }
        }

        info!("Subscription refresher shutting down");
    }
}
