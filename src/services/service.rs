//! Service wiring
//!
//! Resolves the initial pool, then runs the failover orchestrator in the
//! foreground and the subscription refresher in the background.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info, instrument};

use crate::config::Config;
use crate::error::{PassError, Result};
use crate::proxy::health::{ProbeConnector, SocksProbeConnector};
use crate::proxy::port::{PortProbe, TcpPortProbe};
use crate::proxy::queue::SharedQueue;
use crate::proxy::subscription::{CandidateSource, SubscriptionResolver};
use crate::shutdown::ShutdownHandle;

use super::orchestrator::{FailoverOrchestrator, OrchestratorConfig, StateUpdate};
use super::refresher::SubscriptionRefresher;

pub struct Service {
    config: Config,
    queue: SharedQueue,
    source: Arc<dyn CandidateSource>,
    orchestrator: FailoverOrchestrator,
}

impl Service {
    /// Build the production service and resolve the initial pool
    pub async fn new(config: Config) -> Result<Self> {
        let resolver = SubscriptionResolver::from_config(&config)?;
        let connector = SocksProbeConnector {
            timeout: config.health_check_timeout(),
        };

        Self::from_parts(
            config,
            Arc::new(resolver),
            Arc::new(connector),
            Arc::new(TcpPortProbe),
        )
        .await
    }

    /// Build from explicit collaborators.
    ///
    /// Fails if the initial resolution fails or yields no candidates.
    pub async fn from_parts(
        config: Config,
        source: Arc<dyn CandidateSource>,
        connector: Arc<dyn ProbeConnector>,
        port_probe: Arc<dyn PortProbe>,
    ) -> Result<Self> {
        let candidates = source.resolve().await.map_err(|e| {
            error!("Initial subscription resolution failed: {}", e);
            e
        })?;

        if candidates.is_empty() {
            error!("No proxy in the subscription is reachable");
            return Err(PassError::NoCandidatesAvailable);
        }

        let queue = SharedQueue::new(candidates);
        let orchestrator = FailoverOrchestrator::new(
            OrchestratorConfig::from_config(&config),
            queue.clone(),
            connector,
            port_probe,
        );

        Ok(Self {
            config,
            queue,
            source,
            orchestrator,
        })
    }

    pub fn queue(&self) -> &SharedQueue {
        &self.queue
    }

    /// Watch orchestrator state transitions
    pub fn subscribe(&self) -> watch::Receiver<StateUpdate> {
        self.orchestrator.subscribe()
    }

    /// Run until shutdown or until the pool is exhausted
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let (refresher_handle, refresher_shutdown) = ShutdownHandle::new();
        let refresher = SubscriptionRefresher::new(
            self.source.clone(),
            self.queue.clone(),
            self.config.subscription_update_interval(),
        );
        let refresher_task = tokio::spawn(async move {
            refresher.run(refresher_shutdown).await;
        });

        info!("Serving on local port {}", self.config.port);
        let result = self.orchestrator.run(shutdown).await;

        refresher_handle.shutdown();
        if let Err(e) = refresher_task.await {
            error!("Subscription refresher task failed: {}", e);
        }

        result
    }
}
