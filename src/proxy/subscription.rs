//! Subscription feed resolution
//!
//! Fetches the Base64 feed, turns each URI line into an adapter, checks that
//! every backing executable exists and ranks the result by latency.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, error, info, instrument, warn};
use url::Url;

use super::adapter::ProxyAdapter;
use super::latency::{rank, DEFAULT_PROBE_TIMEOUT};
use super::shadowsocks::ShadowsocksAdapter;
use crate::config::Config;
use crate::error::{PassError, Result};
use crate::models::{decode_base64_padded, ProxyScheme, ShadowsocksServer};

/// Timeout of the plain subscription fetch
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Settings applied to every adapter built from the feed
#[derive(Debug, Clone)]
pub struct CandidateOptions {
    /// Shared local listening port
    pub local_port: u16,
    /// Backing executable for shadowsocks candidates
    pub ss_local_bin: PathBuf,
}

/// Anything that can produce a ranked candidate pool
#[async_trait]
pub trait CandidateSource: Send + Sync {
    async fn resolve(&self) -> Result<Vec<Arc<dyn ProxyAdapter>>>;
}

/// Decode the feed body into trimmed, non-empty URI lines
pub fn decode_subscription(body: &str) -> Result<Vec<String>> {
    let raw = decode_base64_padded(body.trim())?;
    let text = String::from_utf8(raw).map_err(|e| PassError::Decode(e.to_string()))?;

    Ok(text
        .replace("\r\n", "\n")
        .split('\n')
        .map(|line| line.trim().to_string())
        .filter(|line| !line.is_empty())
        .collect())
}

/// Build an adapter from one URI line.
///
/// Returns `Ok(None)` for lines without a scheme.
pub fn parse_candidate(line: &str, options: &CandidateOptions) -> Result<Option<Arc<dyn ProxyAdapter>>> {
    let url = match Url::parse(line) {
        Ok(url) => url,
        Err(url::ParseError::RelativeUrlWithoutBase) => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    match ProxyScheme::from_str(url.scheme()) {
        Some(ProxyScheme::Shadowsocks) => {
            let server = ShadowsocksServer::from_url(&url)?;
            Ok(Some(Arc::new(ShadowsocksAdapter::new(
                server,
                options.local_port,
                options.ss_local_bin.clone(),
            ))))
        }
        None => Err(PassError::UnsupportedScheme(url.scheme().to_string())),
    }
}

/// Parse every line, logging and skipping the ones that cannot be used
pub fn parse_candidates(lines: &[String], options: &CandidateOptions) -> Vec<Arc<dyn ProxyAdapter>> {
    let mut candidates = Vec::with_capacity(lines.len());

    for line in lines {
        match parse_candidate(line, options) {
            Ok(Some(candidate)) => {
                debug!("Proxy URL parsed: {}", candidate.identity());
                candidates.push(candidate);
            }
            Ok(None) => {}
            Err(PassError::UnsupportedScheme(scheme)) => {
                info!("Unknown proxy protocol {}, skipping {}", scheme, line);
            }
            Err(e) if e.is_per_candidate() => {
                warn!("Invalid proxy URL, skipping {}: {}", line, e);
            }
            Err(e) => {
                error!("Failed to build proxy from {}: {}", line, e);
            }
        }
    }

    candidates
}

/// Fail if any executable referenced by the pool is missing
pub async fn verify_executables(candidates: &[Arc<dyn ProxyAdapter>]) -> Result<()> {
    let executables: BTreeSet<PathBuf> = candidates
        .iter()
        .map(|c| c.executable().to_path_buf())
        .collect();

    for executable in executables {
        if tokio::fs::metadata(&executable).await.is_err() {
            return Err(PassError::MissingExecutable(executable));
        }
    }

    Ok(())
}

/// Resolves the configured subscription URL into a ranked pool
pub struct SubscriptionResolver {
    url: String,
    client: Client,
    options: CandidateOptions,
}

impl SubscriptionResolver {
    pub fn new(url: impl Into<String>, options: CandidateOptions) -> Result<Self> {
        // The feed must never be fetched through the local proxy we supervise
        let client = Client::builder()
            .no_proxy()
            .timeout(FETCH_TIMEOUT)
            .build()
            .map_err(|e| PassError::Internal(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            url: url.into(),
            client,
            options,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(
            config.subscription.url.clone(),
            CandidateOptions {
                local_port: config.port,
                ss_local_bin: config.subscription.ss_local_bin.clone(),
            },
        )
    }

    /// Fetch the raw feed body
    pub async fn fetch(&self) -> Result<String> {
        let body = self
            .client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(body)
    }
}

#[async_trait]
impl CandidateSource for SubscriptionResolver {
    #[instrument(skip(self))]
    async fn resolve(&self) -> Result<Vec<Arc<dyn ProxyAdapter>>> {
        let body = self.fetch().await?;
        let lines = decode_subscription(&body)?;
        let candidates = parse_candidates(&lines, &self.options);
        verify_executables(&candidates).await?;

        let ranked = rank(candidates, DEFAULT_PROBE_TIMEOUT).await;

        info!("Available proxies: {}", ranked.len());
        for candidate in &ranked {
            info!(
                "{} {}ms",
                candidate.identity(),
                candidate.latency().as_millis()
            );
        }

        Ok(ranked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::STANDARD, Engine};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn options(bin: impl Into<PathBuf>) -> CandidateOptions {
        CandidateOptions {
            local_port: 1080,
            ss_local_bin: bin.into(),
        }
    }

    /// Serve `body` once over plain HTTP and return the feed URL
    async fn serve_once(body: String) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = socket.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = socket.shutdown().await;
        });

        format!("http://{}/feed", addr)
    }

    #[test]
    fn test_decode_subscription_normalizes_lines() {
        let feed = STANDARD.encode("ss://a@h:1\r\nss://b@h:2\n\n  \nvmess://xyz\n");
        // Strip padding to exercise the padding-tolerant decoder
        let feed = feed.trim_end_matches('=');

        let lines = decode_subscription(feed).unwrap();
        assert_eq!(lines, vec!["ss://a@h:1", "ss://b@h:2", "vmess://xyz"]);
    }

    #[test]
    fn test_decode_subscription_rejects_garbage() {
        assert!(matches!(
            decode_subscription("this is not base64!"),
            Err(PassError::Decode(_))
        ));
    }

    #[test]
    fn test_parse_candidate_schemes() {
        let opts = options("/usr/bin/ss-local");

        let ss = parse_candidate("ss://YWVzLTI1Ni1nY206c2VjcmV0@example.net:8388", &opts)
            .unwrap()
            .unwrap();
        assert_eq!(ss.identity(), "example.net:8388");
        assert_eq!(ss.executable(), std::path::Path::new("/usr/bin/ss-local"));

        assert!(matches!(
            parse_candidate("vmess://eyJhZGQiOiJ4In0=", &opts),
            Err(PassError::UnsupportedScheme(s)) if s == "vmess"
        ));
        assert!(parse_candidate("no scheme here", &opts).unwrap().is_none());
        assert!(parse_candidate("ss://[::1", &opts).is_err());
    }

    #[test]
    fn test_parse_candidates_skips_bad_lines() {
        let lines: Vec<String> = vec![
            "ss://YWVzLTI1Ni1nY206c2VjcmV0@a.example:8388".into(),
            "trojan://pw@b.example:443".into(),
            "ss://!!!!@c.example:8388".into(),
            "just text".into(),
            "ss://aes-128-gcm:pw@d.example:8389".into(),
        ];

        let candidates = parse_candidates(&lines, &options("/usr/bin/ss-local"));
        let ids: Vec<String> = candidates.iter().map(|c| c.identity()).collect();
        assert_eq!(ids, vec!["a.example:8388", "d.example:8389"]);
    }

    #[tokio::test]
    async fn test_verify_executables() {
        let exe = tempfile::NamedTempFile::new().unwrap();
        let lines = vec!["ss://YWVzLTI1Ni1nY206c2VjcmV0@a.example:8388".to_string()];

        let present = parse_candidates(&lines, &options(exe.path()));
        assert!(verify_executables(&present).await.is_ok());

        let missing = parse_candidates(&lines, &options("/nonexistent/ss-local"));
        assert!(matches!(
            verify_executables(&missing).await,
            Err(PassError::MissingExecutable(_))
        ));

        // An empty pool references nothing
        assert!(verify_executables(&[]).await.is_ok());
    }

    #[tokio::test]
    async fn test_resolve_fetches_and_ranks() {
        let exe = tempfile::NamedTempFile::new().unwrap();
        let up = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let up_port = up.local_addr().unwrap().port();
        let down = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let down_port = down.local_addr().unwrap().port();
        drop(down);

        let feed = STANDARD.encode(format!(
            "ss://YWVzLTI1Ni1nY206c2VjcmV0@127.0.0.1:{}\nss://YWVzLTI1Ni1nY206c2VjcmV0@127.0.0.1:{}\n",
            down_port, up_port
        ));
        let url = serve_once(feed).await;

        let resolver = SubscriptionResolver::new(url, options(exe.path())).unwrap();
        let ranked = resolver.resolve().await.unwrap();

        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].identity(), format!("127.0.0.1:{}", up_port));
    }

    #[tokio::test]
    async fn test_resolve_missing_executable_is_fatal() {
        let up = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let up_port = up.local_addr().unwrap().port();
        let feed = STANDARD.encode(format!(
            "ss://YWVzLTI1Ni1nY206c2VjcmV0@127.0.0.1:{}\n",
            up_port
        ));
        let url = serve_once(feed).await;

        let resolver = SubscriptionResolver::new(url, options("/nonexistent/ss-local")).unwrap();
        assert!(matches!(
            resolver.resolve().await,
            Err(PassError::MissingExecutable(_))
        ));
    }

    #[tokio::test]
    async fn test_fetch_unreachable_is_transient() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let resolver =
            SubscriptionResolver::new(format!("http://{}/feed", addr), options("/bin/sh")).unwrap();
        let Err(err) = resolver.resolve().await else {
            panic!("unreachable feed resolved");
        };
        assert!(matches!(err, PassError::SubscriptionFetch(_)));
        assert!(err.is_transient());
    }
}
