//! Capability contract shared by every proxy kind

use std::path::Path;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::Result;

/// Latency recorded for an endpoint that could not be reached
pub const UNREACHABLE: Duration = Duration::MAX;

/// A launchable, pingable, stoppable local proxy process
///
/// Implementations own their backing process exclusively. `stop` must be
/// idempotent and must not return before the process has exited.
#[async_trait]
pub trait ProxyAdapter: Send + Sync {
    /// Stable `host:port` of the remote endpoint
    fn identity(&self) -> String;

    /// Backing executable, which must exist before the pool is accepted
    fn executable(&self) -> &Path;

    /// Full argument vector, executable first
    fn command_line(&self) -> Vec<String>;

    /// Last measured latency, `UNREACHABLE` until measured or on failure
    fn latency(&self) -> Duration;

    /// Dial the remote endpoint once and record the elapsed time
    async fn measure_latency(&self, timeout: Duration) -> Duration;

    /// Launch the backing process on the shared local port
    async fn start(&self) -> Result<()>;

    /// Terminate the backing process and wait for it to exit
    async fn stop(&self);

    fn is_running(&self) -> bool;
}

/// Time a raw TCP connect to `address`. The connection is dropped immediately.
pub async fn dial_latency(address: &str, dial_timeout: Duration) -> Duration {
    let start = Instant::now();
    match timeout(dial_timeout, TcpStream::connect(address)).await {
        Ok(Ok(_stream)) => start.elapsed(),
        _ => UNREACHABLE,
    }
}
