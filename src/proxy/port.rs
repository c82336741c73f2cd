//! Local listening port availability

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::shutdown::cancelled;

/// Reports whether the shared local port can be bound
#[async_trait]
pub trait PortProbe: Send + Sync {
    async fn is_free(&self, port: u16) -> bool;
}

/// Checks by binding the port on all interfaces and releasing it at once
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpPortProbe;

#[async_trait]
impl PortProbe for TcpPortProbe {
    async fn is_free(&self, port: u16) -> bool {
        match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => {
                drop(listener);
                true
            }
            Err(e) => {
                debug!("Port {} is busy: {}", port, e);
                false
            }
        }
    }
}

/// Poll until `port` is free.
///
/// Returns `false` if shutdown was requested before the port was released.
pub async fn wait_port_free(
    probe: &dyn PortProbe,
    port: u16,
    poll_interval: Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    info!("Waiting until port {} is free", port);

    loop {
        if probe.is_free(port).await {
            info!("Port {} is free", port);
            return true;
        }

        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => {}
            _ = cancelled(shutdown) => return false,
        }
    }
}
