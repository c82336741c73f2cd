use crate::error::{PassError, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use url::Url;

/// Default location of the shadowsocks-libev client
pub const DEFAULT_SS_LOCAL_BIN: &str = "/usr/bin/ss-local";

/// Application configuration, loaded from environment variables or a YAML file
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Local SOCKS port shared by every candidate (default: 1080)
    pub port: u16,
    /// Subscription feed configuration
    pub subscription: SubscriptionConfig,
    /// Health-check configuration
    pub health_check: HealthCheckConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (pretty, json)
    pub format: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubscriptionConfig {
    /// URL returning a Base64 blob of proxy URIs
    pub url: String,
    /// Hours between background refreshes
    pub update_interval_hours: u64,
    /// Path of the backing `ss-local` executable
    pub ss_local_bin: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthCheckConfig {
    /// Targets probed through the local proxy
    pub urls: Vec<String>,
    /// Seconds between steady-state cycles and between retry rounds
    pub interval_secs: u64,
    /// Per-request timeout in seconds
    pub timeout_secs: u64,
    /// Rounds per steady-state cycle
    pub attempts: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log: LogConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
            port: 1080,
            subscription: SubscriptionConfig {
                url: String::new(),
                update_interval_hours: 24,
                ss_local_bin: PathBuf::from(DEFAULT_SS_LOCAL_BIN),
            },
            health_check: HealthCheckConfig {
                urls: vec!["https://www.google.com".to_string()],
                interval_secs: 60,
                timeout_secs: 5,
                attempts: 3,
            },
        }
    }
}

/// On-disk layout; keys follow the historical config file format
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    #[serde(rename = "LogLevel")]
    log_level: Option<String>,
    #[serde(rename = "LogFormat")]
    log_format: Option<String>,
    #[serde(rename = "Port")]
    port: Option<u16>,
    #[serde(rename = "SubscribeURL")]
    subscription_url: Option<String>,
    #[serde(rename = "SubscriptionUpdateIntervalHours")]
    subscription_update_interval_hours: Option<u64>,
    #[serde(rename = "SSLocalBin")]
    ss_local_bin: Option<PathBuf>,
    #[serde(rename = "HealthCheck")]
    health_check: FileHealthCheck,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileHealthCheck {
    #[serde(rename = "URLs")]
    urls: Option<Vec<String>>,
    #[serde(rename = "IntervalSec")]
    interval_secs: Option<u64>,
    #[serde(rename = "TimeoutSec")]
    timeout_secs: Option<u64>,
    #[serde(rename = "Attempts")]
    attempts: Option<u32>,
}

impl Config {
    /// Load from a YAML file if a path is given, otherwise from the environment
    pub fn load(file: Option<&Path>) -> Result<Self> {
        match file {
            Some(path) => Self::from_file(path),
            None => Self::from_env(),
        }
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();

        if let Some(v) = get_env("GFWPASS_LOGLEVEL") {
            config.log.level = v;
        }
        if let Some(v) = get_env("GFWPASS_LOG_FORMAT") {
            config.log.format = v;
        }
        if let Some(v) = parse_env("GFWPASS_PORT")? {
            config.port = v;
        }
        if let Some(v) = get_env("GFWPASS_SUBS_URL") {
            config.subscription.url = v;
        }
        if let Some(v) = parse_env("GFWPASS_SUBS_INTERVAL_HOUR")? {
            config.subscription.update_interval_hours = v;
        }
        if let Some(v) = get_env("GFWPASS_SS_LOCAL_BIN") {
            config.subscription.ss_local_bin = PathBuf::from(v);
        }
        if let Some(v) = get_env("GFWPASS_HC_URLS") {
            config.health_check.urls = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(v) = parse_env("GFWPASS_HC_INTERVAL_SEC")? {
            config.health_check.interval_secs = v;
        }
        if let Some(v) = parse_env("GFWPASS_HC_TIMEOUT_SEC")? {
            config.health_check.timeout_secs = v;
        }
        // The misspelled key shipped in early releases and is still honored
        if let Some(v) = parse_env("GFWPASS_HC_ATTEMPTS")? {
            config.health_check.attempts = v;
        } else if let Some(v) = parse_env("GFWPASS_HC_APPEMPTS")? {
            config.health_check.attempts = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file layered over the defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            PassError::InvalidConfig(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&raw)
    }

    /// Parse a YAML document layered over the defaults
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let file: FileConfig = serde_yaml::from_str(raw)?;
        let mut config = Config::default();

        if let Some(v) = file.log_level {
            config.log.level = v;
        }
        if let Some(v) = file.log_format {
            config.log.format = v;
        }
        if let Some(v) = file.port {
            config.port = v;
        }
        if let Some(v) = file.subscription_url {
            config.subscription.url = v;
        }
        if let Some(v) = file.subscription_update_interval_hours {
            config.subscription.update_interval_hours = v;
        }
        if let Some(v) = file.ss_local_bin {
            config.subscription.ss_local_bin = v;
        }
        if let Some(v) = file.health_check.urls {
            config.health_check.urls = v;
        }
        if let Some(v) = file.health_check.interval_secs {
            config.health_check.interval_secs = v;
        }
        if let Some(v) = file.health_check.timeout_secs {
            config.health_check.timeout_secs = v;
        }
        if let Some(v) = file.health_check.attempts {
            config.health_check.attempts = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the service cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(PassError::InvalidConfig("port must be non-zero".into()));
        }

        if !matches!(
            self.log.level.to_ascii_lowercase().as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            return Err(PassError::InvalidConfig(format!(
                "unknown log level: {}",
                self.log.level
            )));
        }
        if !matches!(self.log.format.as_str(), "pretty" | "json") {
            return Err(PassError::InvalidConfig(format!(
                "log format must be pretty or json, got {}",
                self.log.format
            )));
        }

        let url = Url::parse(&self.subscription.url).map_err(|e| {
            PassError::InvalidConfig(format!("subscription URL must be a valid URL: {}", e))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(PassError::InvalidConfig(format!(
                "subscription URL has unsupported scheme: {}",
                url.scheme()
            )));
        }
        if self.subscription.update_interval_hours == 0 {
            return Err(PassError::InvalidConfig(
                "subscription update interval must be at least 1 hour".into(),
            ));
        }

        if self.health_check.urls.is_empty() {
            return Err(PassError::InvalidConfig(
                "at least one health-check URL is required".into(),
            ));
        }
        for raw in &self.health_check.urls {
            Url::parse(raw).map_err(|e| {
                PassError::InvalidConfig(format!("invalid health-check URL {}: {}", raw, e))
            })?;
        }
        if self.health_check.attempts == 0 {
            return Err(PassError::InvalidConfig(
                "health-check attempts must be at least 1".into(),
            ));
        }
        if self.health_check.interval_secs == 0 || self.health_check.timeout_secs == 0 {
            return Err(PassError::InvalidConfig(
                "health-check interval and timeout must be positive".into(),
            ));
        }

        Ok(())
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check.interval_secs)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_secs(self.health_check.timeout_secs)
    }

    pub fn subscription_update_interval(&self) -> Duration {
        Duration::from_secs(self.subscription.update_interval_hours * 3600)
    }

    /// Render as YAML for the startup log line
    pub fn to_yaml(&self) -> String {
        serde_yaml::to_string(self).unwrap_or_else(|_| "null".to_string())
    }
}

/// Get a non-empty environment variable
fn get_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Parse a non-empty environment variable, failing on malformed values
fn parse_env<T: FromStr>(key: &str) -> Result<Option<T>> {
    match get_env(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| PassError::InvalidConfig(format!("{} has an invalid value: {}", key, raw))),
        None => Ok(None),
    }
}
