//! Latency ranking of the candidate pool

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, info};

use super::adapter::ProxyAdapter;

/// Dial timeout used when ranking a freshly fetched pool
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Probe every candidate concurrently, sort ascending by latency and drop
/// the ones that did not answer within `timeout`.
///
/// The result may be empty.
pub async fn rank(
    mut candidates: Vec<Arc<dyn ProxyAdapter>>,
    timeout: Duration,
) -> Vec<Arc<dyn ProxyAdapter>> {
    info!("Testing latency of {} proxies", candidates.len());

    join_all(
        candidates
            .iter()
            .map(|candidate| candidate.measure_latency(timeout)),
    )
    .await;

    candidates.sort_by_key(|candidate| candidate.latency());

    while let Some(worst) = candidates.last() {
        if worst.latency() <= timeout {
            break;
        }
        debug!("Excluding proxy {}", worst.identity());
        candidates.pop();
    }

    candidates
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::Result;
    use crate::proxy::adapter::UNREACHABLE;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Adapter with a scripted latency; never launches anything
    pub(crate) struct FixedLatency {
        name: String,
        scripted: Duration,
        measured: Mutex<Duration>,
        pub probes: AtomicUsize,
    }

    impl FixedLatency {
        pub(crate) fn new(name: &str, scripted: Duration) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                scripted,
                measured: Mutex::new(UNREACHABLE),
                probes: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ProxyAdapter for FixedLatency {
        fn identity(&self) -> String {
            self.name.clone()
        }

        fn executable(&self) -> &Path {
            Path::new("/bin/true")
        }

        fn command_line(&self) -> Vec<String> {
            vec![self.name.clone()]
        }

        fn latency(&self) -> Duration {
            *self.measured.lock()
        }

        async fn measure_latency(&self, timeout: Duration) -> Duration {
            self.probes.fetch_add(1, Ordering::SeqCst);
            let latency = if self.scripted > timeout {
                UNREACHABLE
            } else {
                self.scripted
            };
            *self.measured.lock() = latency;
            latency
        }

        async fn start(&self) -> Result<()> {
            Ok(())
        }

        async fn stop(&self) {}

        fn is_running(&self) -> bool {
            false
        }
    }

    fn names(pool: &[Arc<dyn ProxyAdapter>]) -> Vec<String> {
        pool.iter().map(|c| c.identity()).collect()
    }

    #[tokio::test]
    async fn test_rank_sorts_and_drops_unreachable() {
        let timeout = Duration::from_millis(2000);
        let a = FixedLatency::new("a", Duration::from_millis(300));
        let b = FixedLatency::new("b", Duration::from_millis(5000));
        let c = FixedLatency::new("c", Duration::from_millis(40));
        let d = FixedLatency::new("d", Duration::from_millis(2000));
        let e = FixedLatency::new("e", Duration::from_millis(120));

        let pool: Vec<Arc<dyn ProxyAdapter>> =
            vec![a.clone(), b.clone(), c.clone(), d.clone(), e.clone()];
        let ranked = rank(pool, timeout).await;

        assert_eq!(names(&ranked), vec!["c", "e", "a", "d"]);
        for candidate in [&a, &b, &c, &d, &e] {
            assert_eq!(candidate.probes.load(Ordering::SeqCst), 1);
        }
        assert!(ranked.iter().all(|c| c.latency() <= timeout));
    }

    #[tokio::test]
    async fn test_rank_all_unreachable_yields_empty() {
        let pool: Vec<Arc<dyn ProxyAdapter>> = vec![
            FixedLatency::new("a", Duration::from_secs(9)),
            FixedLatency::new("b", Duration::from_secs(3)),
        ];

        let ranked = rank(pool, Duration::from_secs(2)).await;
        assert!(ranked.is_empty());
    }

    #[tokio::test]
    async fn test_rank_empty_pool() {
        let ranked = rank(Vec::new(), DEFAULT_PROBE_TIMEOUT).await;
        assert!(ranked.is_empty());
    }

    #[tokio::test]
    async fn test_rank_keeps_order_of_equal_latencies() {
        let pool: Vec<Arc<dyn ProxyAdapter>> = vec![
            FixedLatency::new("first", Duration::from_millis(50)),
            FixedLatency::new("second", Duration::from_millis(50)),
            FixedLatency::new("third", Duration::from_millis(10)),
        ];

        let ranked = rank(pool, DEFAULT_PROBE_TIMEOUT).await;
        assert_eq!(names(&ranked), vec!["third", "first", "second"]);
    }
}
