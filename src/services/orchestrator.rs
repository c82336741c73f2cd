//! Failover orchestrator
//!
//! Runs the candidate at the head of the queue, supervises it with health
//! checks and rotates to the next candidate when it fails:
//!
//! ```text
//! Selecting -> Starting -> WarmingUp -> FastHealthCheck -> Healthy
//!     ^            |                          |               |
//!     |            +--------------------------+---------------+
//!     |                                       v
//!     +------------------------------------ Rotating
//! ```
//!
//! `Stopped` is reached on shutdown, `Exhausted` when the queue is empty.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::error::{PassError, Result};
use crate::proxy::health::{HealthProber, ProbeConnector};
use crate::proxy::port::{wait_port_free, PortProbe};
use crate::proxy::queue::{Selection, SharedQueue};
use crate::proxy::ProxyAdapter;
use crate::shutdown::cancelled;

/// Orchestrator state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverState {
    Selecting,
    Starting,
    WarmingUp,
    FastHealthCheck,
    Healthy,
    Rotating,
    Stopped,
    Exhausted,
}

impl FailoverState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Selecting => "selecting",
            Self::Starting => "starting",
            Self::WarmingUp => "warming_up",
            Self::FastHealthCheck => "fast_health_check",
            Self::Healthy => "healthy",
            Self::Rotating => "rotating",
            Self::Stopped => "stopped",
            Self::Exhausted => "exhausted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Exhausted)
    }
}

impl std::fmt::Display for FailoverState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Published on every transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateUpdate {
    pub state: FailoverState,
    /// Identity of the candidate the state applies to
    pub candidate: Option<String>,
}

/// Orchestrator timings and health-check parameters
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Shared local listening port
    pub local_port: u16,
    /// Pause after start before the first health check
    pub settle_delay: Duration,
    /// Pause before moving on to the next candidate
    pub rotate_backoff: Duration,
    /// Poll interval while waiting for the local port to be released
    pub port_poll_interval: Duration,
    /// Health-check targets
    pub health_urls: Vec<String>,
    /// Steady-state tick, also the pause between retry rounds
    pub health_interval: Duration,
    /// Rounds per steady-state health cycle
    pub health_attempts: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            local_port: 1080,
            settle_delay: Duration::from_secs(5),
            rotate_backoff: Duration::from_secs(2),
            port_poll_interval: Duration::from_secs(2),
            health_urls: vec!["https://www.google.com".to_string()],
            health_interval: Duration::from_secs(60),
            health_attempts: 3,
        }
    }
}

impl OrchestratorConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            local_port: config.port,
            health_urls: config.health_check.urls.clone(),
            health_interval: config.health_check_interval(),
            health_attempts: config.health_check.attempts,
            ..Self::default()
        }
    }
}

/// How a single candidate's run ended
enum Outcome {
    /// Candidate failed; `reached_healthy` is true if it passed the fast check
    Failed { reached_healthy: bool },
    Cancelled,
}

/// Consecutive failures since the last candidate that reached `Healthy`
#[derive(Debug, Default)]
struct FailureStreak {
    count: usize,
}

impl FailureStreak {
    /// Record a failed candidate. Returns `true` when every candidate in the
    /// pool has failed in a row without any of them reaching `Healthy`.
    fn record(&mut self, reached_healthy: bool, pool_size: usize) -> bool {
        if reached_healthy {
            self.count = 0;
            return false;
        }

        self.count += 1;
        if pool_size > 0 && self.count >= pool_size {
            self.count = 0;
            return true;
        }
        false
    }
}

/// Drives the start -> supervise -> rotate cycle over the shared queue
pub struct FailoverOrchestrator {
    config: OrchestratorConfig,
    queue: SharedQueue,
    connector: Arc<dyn ProbeConnector>,
    port_probe: Arc<dyn PortProbe>,
    state_tx: watch::Sender<StateUpdate>,
}

impl FailoverOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        queue: SharedQueue,
        connector: Arc<dyn ProbeConnector>,
        port_probe: Arc<dyn PortProbe>,
    ) -> Self {
        let (state_tx, _) = watch::channel(StateUpdate {
            state: FailoverState::Selecting,
            candidate: None,
        });

        Self {
            config,
            queue,
            connector,
            port_probe,
            state_tx,
        }
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<StateUpdate> {
        self.state_tx.subscribe()
    }

    pub fn queue(&self) -> &SharedQueue {
        &self.queue
    }

    /// Run until shutdown (`Ok`) or until the queue is empty
    /// (`Err(NoCandidatesAvailable)`).
    #[instrument(skip(self, shutdown), fields(port = self.config.local_port))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut streak = FailureStreak::default();

        loop {
            if *shutdown.borrow() {
                self.publish(FailoverState::Stopped, None);
                return Ok(());
            }

            self.publish(FailoverState::Selecting, None);
            let Some(selection) = self.queue.head() else {
                self.publish(FailoverState::Exhausted, None);
                return Err(PassError::NoCandidatesAvailable);
            };
            let candidate = selection.candidate.clone();
            let identity = candidate.identity();

            let reached_healthy = match self.supervise(&candidate, &mut shutdown).await? {
                Outcome::Cancelled => {
                    info!("Stopping proxy {} on shutdown", identity);
                    candidate.stop().await;
                    self.publish(FailoverState::Stopped, Some(identity));
                    return Ok(());
                }
                Outcome::Failed { reached_healthy } => reached_healthy,
            };

            self.publish(FailoverState::Rotating, Some(identity.clone()));
            if !self.rotate(&selection, &mut shutdown).await {
                self.publish(FailoverState::Stopped, None);
                return Ok(());
            }

            let pool_size = self.queue.len();
            if streak.record(reached_healthy, pool_size) {
                warn!(
                    "All {} proxies failed in a full rotation, cycling again",
                    pool_size
                );
            }
        }
    }

    /// Start a candidate and supervise it until it fails or shutdown
    async fn supervise(
        &self,
        candidate: &Arc<dyn ProxyAdapter>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Outcome> {
        let identity = candidate.identity();

        self.publish(FailoverState::Starting, Some(identity.clone()));
        info!("Starting proxy {}", identity);
        debug!(cmd = %candidate.command_line().join(" "), "Proxy command line");
        if let Err(e) = candidate.start().await {
            warn!("Failed to start proxy {}: {}", identity, e);
            return Ok(Outcome::Failed {
                reached_healthy: false,
            });
        }
        info!("Proxy {} started", identity);

        self.publish(FailoverState::WarmingUp, Some(identity.clone()));
        tokio::select! {
            _ = sleep(self.config.settle_delay) => {}
            _ = cancelled(shutdown) => return Ok(Outcome::Cancelled),
        }

        self.publish(FailoverState::FastHealthCheck, Some(identity.clone()));
        let probe = match self.connector.connect(self.config.local_port) {
            Ok(probe) => probe,
            Err(e) => {
                candidate.stop().await;
                return Err(e);
            }
        };
        let prober = HealthProber::new(
            probe,
            self.config.health_urls.clone(),
            self.config.health_interval,
        );

        tokio::select! {
            result = prober.check(1) => {
                if let Err(e) = result {
                    info!("Proxy {} failed startup health-check: {}", identity, e);
                    return Ok(Outcome::Failed { reached_healthy: false });
                }
            }
            _ = cancelled(shutdown) => return Ok(Outcome::Cancelled),
        }

        self.publish(FailoverState::Healthy, Some(identity.clone()));
        info!(
            "Proxy {} healthy, checking every {}s",
            identity,
            self.config.health_interval.as_secs()
        );

        let mut ticker = interval_at(
            Instant::now() + self.config.health_interval,
            self.config.health_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancelled(shutdown) => return Ok(Outcome::Cancelled),
            }

            tokio::select! {
                result = prober.check(self.config.health_attempts) => {
                    if let Err(e) = result {
                        info!("Stopping proxy {} due to failed health-check: {}", identity, e);
                        return Ok(Outcome::Failed { reached_healthy: true });
                    }
                }
                _ = cancelled(shutdown) => return Ok(Outcome::Cancelled),
            }
        }
    }

    /// Stop the failed candidate, wait for the port, back off and move it to
    /// the tail. Returns `false` if shutdown interrupted the rotation.
    async fn rotate(&self, failed: &Selection, shutdown: &mut watch::Receiver<bool>) -> bool {
        failed.candidate.stop().await;

        if !wait_port_free(
            self.port_probe.as_ref(),
            self.config.local_port,
            self.config.port_poll_interval,
            shutdown,
        )
        .await
        {
            return false;
        }

        tokio::select! {
            _ = sleep(self.config.rotate_backoff) => {}
            _ = cancelled(shutdown) => return false,
        }

        if !self.queue.rotate(failed) {
            debug!("Proxy pool was replaced, starting from the new head");
        }
        info!("Trying next proxy");
        true
    }

    fn publish(&self, state: FailoverState, candidate: Option<String>) {
        debug!(state = %state, candidate = ?candidate, "Failover state changed");
        self.state_tx.send_replace(StateUpdate { state, candidate });
    }
}
