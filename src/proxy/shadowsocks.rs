//! Shadowsocks adapter backed by `ss-local`

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

use super::adapter::{dial_latency, ProxyAdapter, UNREACHABLE};
use crate::error::{PassError, Result};
use crate::models::ShadowsocksServer;

/// How long a stopping process gets to exit after SIGTERM before it is killed
const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

/// Runs one shadowsocks endpoint through `ss-local`
pub struct ShadowsocksAdapter {
    server: ShadowsocksServer,
    local_port: u16,
    executable: PathBuf,
    /// Latency in nanoseconds, `u64::MAX` when unreachable
    latency_nanos: AtomicU64,
    child: Mutex<Option<Child>>,
    stop_grace: Duration,
}

impl ShadowsocksAdapter {
    pub fn new(server: ShadowsocksServer, local_port: u16, executable: impl Into<PathBuf>) -> Self {
        Self {
            server,
            local_port,
            executable: executable.into(),
            latency_nanos: AtomicU64::new(u64::MAX),
            child: Mutex::new(None),
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    #[cfg(test)]
    fn pid(&self) -> Option<u32> {
        self.child.lock().as_ref().and_then(|child| child.id())
    }

    fn args(&self) -> Vec<String> {
        let mut args = vec![
            "-s".to_string(),
            self.server.host.clone(),
            "-p".to_string(),
            self.server.port.to_string(),
            "-l".to_string(),
            self.local_port.to_string(),
            "-m".to_string(),
            self.server.cipher.clone(),
            "-k".to_string(),
            self.server.password.clone(),
        ];
        if let Some(plugin) = &self.server.plugin {
            if !plugin.name.is_empty() {
                args.push("--plugin".to_string());
                args.push(plugin.name.clone());
            }
            if !plugin.opts.is_empty() {
                args.push("--plugin-opts".to_string());
                args.push(plugin.opts.clone());
            }
        }
        args
    }

    fn record_latency(&self, latency: Duration) {
        let nanos = if latency == UNREACHABLE {
            u64::MAX
        } else {
            u64::try_from(latency.as_nanos()).unwrap_or(u64::MAX - 1)
        };
        self.latency_nanos.store(nanos, Ordering::Relaxed);
    }
}

#[async_trait]
impl ProxyAdapter for ShadowsocksAdapter {
    fn identity(&self) -> String {
        self.server.address()
    }

    fn executable(&self) -> &Path {
        &self.executable
    }

    fn command_line(&self) -> Vec<String> {
        let mut cmd = vec![self.executable.display().to_string()];
        cmd.extend(self.args());
        cmd
    }

    fn latency(&self) -> Duration {
        match self.latency_nanos.load(Ordering::Relaxed) {
            u64::MAX => UNREACHABLE,
            nanos => Duration::from_nanos(nanos),
        }
    }

    async fn measure_latency(&self, timeout: Duration) -> Duration {
        let latency = dial_latency(&self.server.address(), timeout).await;
        self.record_latency(latency);
        latency
    }

    #[instrument(skip(self), fields(proxy = %self.server.address()))]
    async fn start(&self) -> Result<()> {
        let mut guard = self.child.lock();
        if guard.is_some() {
            debug!("Proxy process already started");
            return Ok(());
        }

        let child = Command::new(&self.executable)
            .args(self.args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                PassError::Spawn(format!("{}: {}", self.executable.display(), e))
            })?;

        debug!(pid = ?child.id(), "Proxy process spawned");
        *guard = Some(child);
        Ok(())
    }

    #[instrument(skip(self), fields(proxy = %self.server.address()))]
    async fn stop(&self) {
        let Some(mut child) = self.child.lock().take() else {
            return;
        };

        #[cfg(unix)]
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
        #[cfg(not(unix))]
        let _ = child.start_kill();

        match timeout(self.stop_grace, child.wait()).await {
            Ok(Ok(status)) => debug!(%status, "Proxy process exited"),
            Ok(Err(e)) => {
                warn!("Failed to wait for proxy process, killing it: {}", e);
                kill_and_reap(&mut child).await;
            }
            Err(_) => {
                warn!(
                    "Proxy process ignored SIGTERM for {}s, killing it",
                    self.stop_grace.as_secs()
                );
                kill_and_reap(&mut child).await;
            }
        }
    }

    fn is_running(&self) -> bool {
        match self.child.lock().as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }
}

/// SIGKILL the child and wait for it to exit
async fn kill_and_reap(child: &mut Child) {
    if let Err(e) = child.kill().await {
        warn!("Failed to kill proxy process: {}", e);
    }
}
