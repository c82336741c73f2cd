use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE, URL_SAFE_NO_PAD},
    Engine,
};
use percent_encoding::{percent_decode_str, utf8_percent_encode, NON_ALPHANUMERIC};
use url::Url;

use crate::error::{PassError, Result};

/// Proxy URI schemes understood by the subscription parser
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyScheme {
    Shadowsocks,
}

impl ProxyScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyScheme::Shadowsocks => "ss",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "ss" => Some(ProxyScheme::Shadowsocks),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProxyScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// SIP003 plugin and its raw option string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginSpec {
    pub name: String,
    pub opts: String,
}

impl PluginSpec {
    /// Parse `name;opt1=v1;opt2=v2`, splitting on the first semicolon
    pub fn parse(raw: &str) -> Option<Self> {
        if raw.is_empty() {
            return None;
        }
        let (name, opts) = raw.split_once(';').unwrap_or((raw, ""));
        Some(Self {
            name: name.to_string(),
            opts: opts.to_string(),
        })
    }

    pub fn to_param(&self) -> String {
        if self.opts.is_empty() {
            self.name.clone()
        } else {
            format!("{};{}", self.name, self.opts)
        }
    }
}

/// Connection parameters of one shadowsocks endpoint
///
/// Immutable once parsed; the local listening port is assigned by the adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShadowsocksServer {
    pub host: String,
    pub port: u16,
    pub cipher: String,
    pub password: String,
    pub plugin: Option<PluginSpec>,
}

impl ShadowsocksServer {
    /// Build from an `ss://` URI.
    ///
    /// Accepts both the SIP002 form, where the user-info is Base64 of
    /// `cipher:password`, and the plain `cipher:password@` form.
    pub fn from_url(url: &Url) -> Result<Self> {
        let host = url
            .host_str()
            .ok_or_else(|| PassError::InvalidCandidate(format!("missing host in {}", url)))?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host)
            .to_string();

        let port = url
            .port()
            .ok_or_else(|| PassError::InvalidCandidate(format!("missing port for {}", host)))?;

        let (cipher, password) = match url.password() {
            Some(password) => (percent_decode(url.username())?, percent_decode(password)?),
            None => {
                if url.username().is_empty() {
                    return Err(PassError::InvalidCandidate(format!(
                        "missing credentials for {}:{}",
                        host, port
                    )));
                }
                let userinfo = decode_base64_padded(&percent_decode(url.username())?)?;
                let userinfo = String::from_utf8(userinfo)
                    .map_err(|e| PassError::Decode(e.to_string()))?;
                let (cipher, password) = userinfo.split_once(':').ok_or_else(|| {
                    PassError::InvalidCandidate(format!(
                        "credentials for {}:{} are not cipher:password",
                        host, port
                    ))
                })?;
                (cipher.to_string(), password.to_string())
            }
        };

        let plugin = url
            .query_pairs()
            .find(|(key, _)| key == "plugin")
            .and_then(|(_, value)| PluginSpec::parse(&value));

        Ok(Self {
            host,
            port,
            cipher,
            password,
            plugin,
        })
    }

    /// Render as a SIP002 URI
    pub fn to_url(&self) -> String {
        let userinfo = URL_SAFE_NO_PAD.encode(format!("{}:{}", self.cipher, self.password));
        let mut url = format!("ss://{}@{}", userinfo, self.address());
        if let Some(plugin) = &self.plugin {
            url.push_str("?plugin=");
            url.push_str(&utf8_percent_encode(&plugin.to_param(), NON_ALPHANUMERIC).to_string());
        }
        url
    }

    /// `host:port`, bracketing IPv6 literals
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Decode Base64, right-padding with `=` to a multiple of four first.
///
/// Subscription feeds mix the standard and URL-safe alphabets, so the
/// URL-safe alphabet is tried when the standard one rejects the input.
pub fn decode_base64_padded(input: &str) -> Result<Vec<u8>> {
    let mut padded: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    let rem = padded.len() % 4;
    if rem != 0 {
        padded.push_str(&"=".repeat(4 - rem));
    }

    match STANDARD.decode(&padded) {
        Ok(bytes) => Ok(bytes),
        Err(err) => URL_SAFE.decode(&padded).map_err(|_| PassError::from(err)),
    }
}

fn percent_decode(raw: &str) -> Result<String> {
    percent_decode_str(raw)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|e| PassError::InvalidCandidate(e.to_string()))
}
