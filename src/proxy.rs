//! Geo-validated proxy pool.
//!
//! Candidates come from configuration. Each selection shuffles them and probes
//! them one by one through a geo-IP lookup, returning the first endpoint whose
//! egress country matches the target market. When none passes the pool
//! returns `None` and callers use direct egress.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use reqwest::{Client, Proxy as ReqwestProxy};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

use crate::timing::{Clock, SystemClock};
use crate::{Result, ScrapeError};

/// Proxy protocol type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyProtocol {
    /// HTTP proxy
    #[default]
    Http,
    /// HTTPS proxy
    Https,
    /// SOCKS5 proxy
    Socks5,
}

impl ProxyProtocol {
    fn scheme(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
            Self::Socks5 => "socks5",
        }
    }
}

/// A candidate egress endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProxyEndpoint {
    /// Proxy host (IP or domain)
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub protocol: ProxyProtocol,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl ProxyEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            protocol: ProxyProtocol::Http,
            username: None,
            password: None,
        }
    }

    pub fn with_protocol(mut self, protocol: ProxyProtocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// `host:port`, used as the cache key and in logs.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Full proxy URL including credentials.
    pub fn url(&self) -> String {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => format!(
                "{}://{}:{}@{}:{}",
                self.protocol.scheme(),
                user,
                pass,
                self.host,
                self.port
            ),
            _ => self.server(),
        }
    }

    /// Proxy URL without credentials, as Chrome's `--proxy-server` expects.
    pub fn server(&self) -> String {
        format!("{}://{}:{}", self.protocol.scheme(), self.host, self.port)
    }

    /// Builds the reqwest proxy for this endpoint.
    pub fn to_reqwest(&self) -> Result<ReqwestProxy> {
        ReqwestProxy::all(self.url())
            .map_err(|e| ScrapeError::Other(format!("Failed to create proxy: {}", e)))
    }
}

impl fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.protocol.scheme(), self.address())
    }
}

impl FromStr for ProxyEndpoint {
    type Err = ScrapeError;

    /// Parses `scheme://[user:pass@]host[:port]`.
    fn from_str(s: &str) -> Result<Self> {
        let url = url::Url::parse(s.trim())?;
        let protocol = match url.scheme() {
            "http" => ProxyProtocol::Http,
            "https" => ProxyProtocol::Https,
            "socks5" | "socks5h" => ProxyProtocol::Socks5,
            scheme => {
                return Err(ScrapeError::Other(format!(
                    "Unsupported proxy protocol: {}",
                    scheme
                )))
            }
        };
        let host = url
            .host_str()
            .ok_or_else(|| ScrapeError::Other("Missing proxy host".to_string()))?;
        let port = url.port().unwrap_or(match protocol {
            ProxyProtocol::Http | ProxyProtocol::Https => 8080,
            ProxyProtocol::Socks5 => 1080,
        });

        let mut endpoint = ProxyEndpoint::new(host, port).with_protocol(protocol);
        if let Some(password) = url.password() {
            endpoint = endpoint.with_auth(url.username(), password);
        }
        Ok(endpoint)
    }
}

/// Outcome of the last geo probe through an endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyValidation {
    pub passed: bool,
    /// Country reported by the probe, when it answered.
    pub country: Option<String>,
    pub checked_at: DateTime<Utc>,
}

/// Proxy pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    pub candidates: Vec<ProxyEndpoint>,
    /// ISO 3166-1 alpha-2 country the egress IP must be in.
    pub required_country: String,
    /// Candidates probed per selection; 0 means all.
    pub max_attempts: usize,
    /// Geo-IP lookup URL answering JSON with a country code.
    pub probe_url: String,
    pub probe_timeout_secs: u64,
    /// How long a probe outcome is reused, in seconds.
    pub validation_ttl_secs: u64,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            candidates: Vec::new(),
            required_country: "RU".to_string(),
            max_attempts: 5,
            probe_url: "https://ipinfo.io/json".to_string(),
            probe_timeout_secs: 8,
            validation_ttl_secs: 600,
        }
    }
}

/// Reports the egress country seen through a proxy.
#[async_trait]
pub trait GeoProbe: Send + Sync {
    async fn country(&self, proxy: &ProxyEndpoint) -> Result<String>;
}

/// Geo probe backed by an ipinfo-style JSON endpoint.
pub struct HttpGeoProbe {
    url: String,
    timeout: Duration,
}

impl HttpGeoProbe {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            timeout,
        }
    }
}

#[async_trait]
impl GeoProbe for HttpGeoProbe {
    async fn country(&self, proxy: &ProxyEndpoint) -> Result<String> {
        let client = Client::builder()
            .proxy(proxy.to_reqwest()?)
            .timeout(self.timeout)
            .build()?;
        let body: Value = client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        country_code(&body)
            .ok_or_else(|| ScrapeError::Parse("geo probe answered without a country".to_string()))
    }
}

fn country_code(body: &Value) -> Option<String> {
    ["country", "countryCode", "country_code"]
        .iter()
        .filter_map(|key| body.get(*key).and_then(Value::as_str))
        .map(|s| s.trim().to_uppercase())
        .find(|s| !s.is_empty())
}

/// A pool of geo-validated proxies.
pub struct ProxyPool {
    candidates: Vec<ProxyEndpoint>,
    probe: Arc<dyn GeoProbe>,
    required_country: String,
    max_attempts: usize,
    probe_timeout: Duration,
    validation_ttl: Duration,
    validations: RwLock<HashMap<String, ProxyValidation>>,
    clock: Arc<dyn Clock>,
}

impl ProxyPool {
    /// Creates a pool probing through [`HttpGeoProbe`].
    pub fn new(settings: ProxySettings) -> Self {
        let timeout = Duration::from_secs(settings.probe_timeout_secs);
        let probe = Arc::new(HttpGeoProbe::new(settings.probe_url.clone(), timeout));
        Self::with_probe(settings, probe)
    }

    /// Creates a pool with a custom geo probe.
    pub fn with_probe(settings: ProxySettings, probe: Arc<dyn GeoProbe>) -> Self {
        Self {
            candidates: settings.candidates,
            probe,
            required_country: settings.required_country.trim().to_uppercase(),
            max_attempts: settings.max_attempts,
            probe_timeout: Duration::from_secs(settings.probe_timeout_secs),
            validation_ttl: Duration::from_secs(settings.validation_ttl_secs),
            validations: RwLock::new(HashMap::new()),
            clock: Arc::new(SystemClock),
        }
    }

    /// A pool with no candidates; `select` always yields direct egress.
    pub fn disabled() -> Self {
        Self::new(ProxySettings::default())
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Whether any candidates are configured.
    pub fn is_enabled(&self) -> bool {
        !self.candidates.is_empty()
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Returns a proxy whose egress country matches, or `None` for direct egress.
    pub async fn select(&self) -> Option<ProxyEndpoint> {
        if self.candidates.is_empty() {
            return None;
        }

        let mut order: Vec<&ProxyEndpoint> = self.candidates.iter().collect();
        order.shuffle(&mut rand::thread_rng());
        let attempts = match self.max_attempts {
            0 => order.len(),
            n => n.min(order.len()),
        };

        for proxy in order.into_iter().take(attempts) {
            if let Some(cached) = self.cached(proxy).await {
                if cached.passed {
                    debug!("Reusing validated proxy {}", proxy.address());
                    return Some(proxy.clone());
                }
                continue;
            }

            let validation = self.probe(proxy).await;
            let passed = validation.passed;
            self.validations
                .write()
                .await
                .insert(proxy.address(), validation);
            if passed {
                return Some(proxy.clone());
            }
        }

        debug!(
            "No proxy passed {} geo validation after {} attempts; using direct egress",
            self.required_country, attempts
        );
        None
    }

    /// Last recorded validation for an endpoint.
    pub async fn validation(&self, proxy: &ProxyEndpoint) -> Option<ProxyValidation> {
        self.validations.read().await.get(&proxy.address()).cloned()
    }

    async fn cached(&self, proxy: &ProxyEndpoint) -> Option<ProxyValidation> {
        let validation = self.validation(proxy).await?;
        let age = self.clock.now() - validation.checked_at;
        let ttl = chrono::Duration::from_std(self.validation_ttl).ok()?;
        (age < ttl).then_some(validation)
    }

    async fn probe(&self, proxy: &ProxyEndpoint) -> ProxyValidation {
        let country = match tokio::time::timeout(self.probe_timeout, self.probe.country(proxy)).await
        {
            Ok(Ok(country)) => Some(country.trim().to_uppercase()),
            Ok(Err(e)) => {
                debug!("Proxy {} probe failed: {}", proxy.address(), e);
                None
            }
            Err(_) => {
                debug!("Proxy {} probe timed out", proxy.address());
                None
            }
        };
        let passed = country.as_deref() == Some(self.required_country.as_str());
        debug!(
            "Proxy {} egress country {:?}: {}",
            proxy.address(),
            country,
            if passed { "pass" } else { "fail" }
        );
        ProxyValidation {
            passed,
            country,
            checked_at: self.clock.now(),
        }
    }
}
