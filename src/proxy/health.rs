//! Health checking through the active local proxy
//!
//! A health cycle probes every target URL through the local SOCKS port.
//! Targets that answer are not probed again in the same cycle; the rest are
//! retried after the configured interval until the attempts run out.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use reqwest::{Client, Proxy};
use tracing::{debug, info, instrument};

use crate::error::{PassError, Result};

/// One reachability request to a target URL
#[async_trait]
pub trait HttpProbe: Send + Sync {
    /// Any HTTP response counts as success; transport errors do not
    async fn get(&self, url: &str) -> Result<()>;
}

/// Builds a probe that dials through the proxy listening on `local_port`
pub trait ProbeConnector: Send + Sync {
    fn connect(&self, local_port: u16) -> Result<Arc<dyn HttpProbe>>;
}

/// HTTP client dialing through `socks5h://127.0.0.1:<port>`
pub struct SocksHttpProbe {
    client: Client,
}

impl SocksHttpProbe {
    pub fn new(local_port: u16, timeout: Duration) -> Result<Self> {
        let proxy = Proxy::all(format!("socks5h://127.0.0.1:{}", local_port))
            .map_err(|e| PassError::ProbeClient(e.to_string()))?;

        let max_idle_per_host = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            + 1;

        let client = Client::builder()
            .proxy(proxy)
            .timeout(timeout)
            .connect_timeout(timeout)
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(max_idle_per_host)
            .build()
            .map_err(|e| PassError::ProbeClient(e.to_string()))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl HttpProbe for SocksHttpProbe {
    async fn get(&self, url: &str) -> Result<()> {
        self.client
            .get(url)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| PassError::ProbeFailed(e.to_string()))
    }
}

/// Connector producing `SocksHttpProbe`s with a fixed per-request timeout
#[derive(Debug, Clone)]
pub struct SocksProbeConnector {
    pub timeout: Duration,
}

impl ProbeConnector for SocksProbeConnector {
    fn connect(&self, local_port: u16) -> Result<Arc<dyn HttpProbe>> {
        Ok(Arc::new(SocksHttpProbe::new(local_port, self.timeout)?))
    }
}

/// Multi-attempt, multi-target reachability check
pub struct HealthProber {
    probe: Arc<dyn HttpProbe>,
    urls: Vec<String>,
    interval: Duration,
}

impl HealthProber {
    pub fn new(probe: Arc<dyn HttpProbe>, urls: Vec<String>, interval: Duration) -> Self {
        Self {
            probe,
            urls,
            interval,
        }
    }

    /// Run one health cycle of at most `attempts` rounds
    #[instrument(skip(self))]
    pub async fn check(&self, attempts: u32) -> Result<()> {
        let attempts = attempts.max(1);
        let mut outstanding = self.urls.clone();

        for round in 1..=attempts {
            let results = join_all(outstanding.iter().map(|url| self.probe.get(url))).await;

            let mut failed = Vec::new();
            for (url, result) in outstanding.into_iter().zip(results) {
                match result {
                    Ok(()) => debug!("Probe {} ok at {}/{} attempt", url, round, attempts),
                    Err(e) => {
                        info!("Probe {} failed at {}/{} attempt: {}", url, round, attempts, e);
                        failed.push(url);
                    }
                }
            }
            outstanding = failed;

            if outstanding.is_empty() {
                info!("Health-check ok");
                return Ok(());
            }

            if round < attempts {
                tokio::time::sleep(self.interval).await;
            }
        }

        Err(PassError::HealthCheckFailed { attempts })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Each URL fails a scripted number of times, then succeeds
    struct ScriptedProbe {
        failures: Mutex<HashMap<String, u32>>,
        calls: Mutex<HashMap<String, u32>>,
    }

    impl ScriptedProbe {
        fn new(script: &[(&str, u32)]) -> Arc<Self> {
            Arc::new(Self {
                failures: Mutex::new(
                    script
                        .iter()
                        .map(|(url, n)| (url.to_string(), *n))
                        .collect(),
                ),
                calls: Mutex::new(HashMap::new()),
            })
        }

        fn calls(&self, url: &str) -> u32 {
            self.calls.lock().get(url).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl HttpProbe for ScriptedProbe {
        async fn get(&self, url: &str) -> Result<()> {
            *self.calls.lock().entry(url.to_string()).or_insert(0) += 1;
            let mut failures = self.failures.lock();
            let remaining = failures.entry(url.to_string()).or_insert(0);
            if *remaining > 0 {
                *remaining -= 1;
                Err(PassError::ProbeFailed("connection reset".into()))
            } else {
                Ok(())
            }
        }
    }

    const A: &str = "https://a.example";
    const B: &str = "https://b.example";

    #[tokio::test(start_paused = true)]
    async fn test_healthy_targets_are_not_reprobed() {
        let probe = ScriptedProbe::new(&[(A, 0), (B, 2)]);
        let prober = HealthProber::new(
            probe.clone(),
            vec![A.to_string(), B.to_string()],
            Duration::from_secs(60),
        );

        let start = tokio::time::Instant::now();
        prober.check(3).await.unwrap();

        assert_eq!(probe.calls(A), 1);
        assert_eq!(probe.calls(B), 3);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(120) && elapsed < Duration::from_secs(121));
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_targets_failing_exhausts_attempts() {
        let probe = ScriptedProbe::new(&[(A, u32::MAX), (B, u32::MAX)]);
        let prober = HealthProber::new(
            probe.clone(),
            vec![A.to_string(), B.to_string()],
            Duration::from_secs(10),
        );

        let start = tokio::time::Instant::now();
        let err = prober.check(4).await.unwrap_err();

        assert!(matches!(err, PassError::HealthCheckFailed { attempts: 4 }));
        assert_eq!(probe.calls(A), 4);
        assert_eq!(probe.calls(B), 4);
        // attempts - 1 sleeps between rounds, none after the last
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(30) && elapsed < Duration::from_secs(31));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_attempt_fails_fast() {
        let probe = ScriptedProbe::new(&[(A, 1)]);
        let prober = HealthProber::new(probe.clone(), vec![A.to_string()], Duration::from_secs(60));

        let start = tokio::time::Instant::now();
        assert!(prober.check(1).await.is_err());
        assert_eq!(probe.calls(A), 1);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_round_success_returns_immediately() {
        let probe = ScriptedProbe::new(&[(A, 0), (B, 0)]);
        let prober = HealthProber::new(
            probe.clone(),
            vec![A.to_string(), B.to_string()],
            Duration::from_secs(60),
        );

        let start = tokio::time::Instant::now();
        prober.check(3).await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(probe.calls(A), 1);
        assert_eq!(probe.calls(B), 1);
    }

    #[tokio::test]
    async fn test_socks_probe_without_listener_fails() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let probe = SocksProbeConnector {
            timeout: Duration::from_secs(2),
        }
        .connect(port)
        .unwrap();

        let err = probe.get("http://example.com/").await.unwrap_err();
        assert!(matches!(err, PassError::ProbeFailed(_)));
    }

    #[tokio::test]
    async fn test_socks_probe_dials_local_port() {
        use tokio::io::AsyncReadExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        // Read the SOCKS5 greeting, then hang up
        let local_proxy = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            stream.read_exact(&mut greeting).await.unwrap();
            greeting
        });

        let probe = SocksProbeConnector {
            timeout: Duration::from_secs(2),
        }
        .connect(port)
        .unwrap();

        let result = probe.get("http://health.invalid/").await;
        assert!(matches!(result, Err(PassError::ProbeFailed(_))));

        // Version 5, one method, no authentication
        let greeting = tokio::time::timeout(Duration::from_secs(2), local_proxy)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(greeting, [5, 1, 0]);
    }
}
