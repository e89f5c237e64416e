//! Engine configuration supplied at construction time.
//!
//! Everything marketplace-specific that is data rather than logic lives here:
//! selector sets, endpoint URLs, session TTLs and the delay bounds used for
//! human emulation. The engine never reads files; collaborators deserialize a
//! [`ScraperConfig`] however they like and hand it over.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::emulation::EmulationSettings;
use crate::identity::IdentitySettings;
use crate::marketplaces::{Ozon, Wildberries};
use crate::proxy::ProxySettings;
use crate::Marketplace;

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScraperConfig {
    /// Per-marketplace settings.
    #[serde(default = "default_marketplaces")]
    pub marketplaces: HashMap<Marketplace, MarketplaceSettings>,
    /// Proxy candidates and geo requirements.
    #[serde(default)]
    pub proxy: ProxySettings,
    /// Fingerprint pools.
    #[serde(default)]
    pub identity: IdentitySettings,
    /// Human-emulation delay bounds.
    #[serde(default)]
    pub emulation: EmulationSettings,
    /// Browser pool settings.
    #[serde(default)]
    pub browser: BrowserSettings,
    /// Retry policy for direct endpoint calls.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Network deadlines.
    #[serde(default)]
    pub timeouts: Timeouts,
    /// Items fetched before filtering when any filter is present.
    #[serde(default = "default_max_fetch")]
    pub max_fetch: usize,
    /// Targets scraped concurrently by the batch helper.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

fn default_marketplaces() -> HashMap<Marketplace, MarketplaceSettings> {
    HashMap::from([
        (Marketplace::Ozon, Ozon::default_settings()),
        (Marketplace::Wildberries, Wildberries::default_settings()),
    ])
}

fn default_max_fetch() -> usize {
    100
}

fn default_concurrency() -> usize {
    4
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            marketplaces: default_marketplaces(),
            proxy: ProxySettings::default(),
            identity: IdentitySettings::default(),
            emulation: EmulationSettings::default(),
            browser: BrowserSettings::default(),
            retry: RetryPolicy::default(),
            timeouts: Timeouts::default(),
            max_fetch: default_max_fetch(),
            concurrency: default_concurrency(),
        }
    }
}

impl ScraperConfig {
    /// Returns the settings for a marketplace, if configured.
    pub fn marketplace(&self, marketplace: Marketplace) -> Option<&MarketplaceSettings> {
        self.marketplaces.get(&marketplace)
    }

    /// Session TTLs keyed by marketplace.
    pub fn session_ttls(&self) -> HashMap<Marketplace, Duration> {
        self.marketplaces
            .iter()
            .map(|(m, s)| (*m, s.session_ttl()))
            .collect()
    }
}

/// Settings for a single marketplace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketplaceSettings {
    /// Lifetime of harvested anti-bot cookies, in seconds.
    pub session_ttl_secs: u64,
    /// Attach a cached session to direct endpoint calls.
    #[serde(default = "default_true")]
    pub use_session: bool,
    /// Whether the internal data endpoint is attempted at all.
    #[serde(default = "default_true")]
    pub direct_enabled: bool,
    /// Landing page visited to solve challenges and harvest cookies.
    pub landing_url: String,
    /// Search-by-text data endpoint.
    pub search_endpoint: String,
    /// Product-by-id data endpoint.
    pub product_endpoint: String,
    /// Delivery region parameter, where the endpoint needs one.
    #[serde(default)]
    pub region: Option<String>,
    /// Upper bound on endpoint pages fetched per search.
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
    /// DOM selectors for rendered extraction.
    pub selectors: SelectorSet,
}

fn default_true() -> bool {
    true
}

fn default_max_pages() -> u32 {
    5
}

impl MarketplaceSettings {
    /// Session TTL as a duration.
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }
}

/// Marketplace-specific DOM selectors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SelectorSet {
    /// Selector whose presence means the content has rendered.
    pub ready: String,
    /// Selector matching one item card on a listing page.
    pub card: String,
    /// Card attribute carrying the article, if the markup has one.
    #[serde(default)]
    pub card_id_attr: Option<String>,
    /// Field selectors relative to a card.
    #[serde(default)]
    pub list: FieldSelectors,
    /// Field selectors on a product page.
    #[serde(default)]
    pub product: FieldSelectors,
    /// Lower-case substrings that identify a challenge page.
    #[serde(default)]
    pub challenge_markers: Vec<String>,
    /// Render each card's product page when the list lacks required fields.
    #[serde(default)]
    pub dereference_cards: bool,
}

/// Selectors for the individual product fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldSelectors {
    pub name: Option<String>,
    pub price: Option<String>,
    pub old_price: Option<String>,
    pub discount: Option<String>,
    pub stock: Option<String>,
    pub image: Option<String>,
    pub link: Option<String>,
    pub labels: Option<String>,
}

/// Browser pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserSettings {
    /// Maximum number of concurrently open browser contexts.
    pub max_contexts: usize,
    /// Whether to run the browser in headless mode.
    pub headless: bool,
    /// Path to the Chrome/Chromium executable. If `None`, auto-detected.
    pub chrome_path: Option<String>,
    /// Route browser contexts through a validated proxy.
    pub use_proxy: bool,
    /// Additional launch arguments for Chrome.
    pub launch_args: Vec<String>,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            max_contexts: 4,
            headless: true,
            chrome_path: None,
            use_proxy: true,
            launch_args: Vec::new(),
        }
    }
}

/// Bounded exponential backoff for 429/5xx answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Ceiling for a single delay, in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u64.checked_shl(retry).unwrap_or(u64::MAX);
        let ms = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}

/// Network deadlines.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// Direct endpoint request timeout, in seconds.
    pub request_secs: u64,
    /// Page navigation timeout, in seconds.
    pub navigation_secs: u64,
    /// Maximum wait for the ready selector, in milliseconds.
    pub ready_ms: u64,
    /// How long a session refresh waits for a challenge to clear, in seconds.
    pub challenge_secs: u64,
    /// Fail-fast window after a failed session refresh, in seconds.
    pub refresh_cooldown_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            request_secs: 15,
            navigation_secs: 30,
            ready_ms: 10_000,
            challenge_secs: 20,
            refresh_cooldown_secs: 30,
        }
    }
}

impl Timeouts {
    pub fn request(&self) -> Duration {
        Duration::from_secs(self.request_secs)
    }

    pub fn navigation(&self) -> Duration {
        Duration::from_secs(self.navigation_secs)
    }

    pub fn challenge(&self) -> Duration {
        Duration::from_secs(self.challenge_secs)
    }

    pub fn refresh_cooldown(&self) -> Duration {
        Duration::from_secs(self.refresh_cooldown_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_has_both_marketplaces() {
        let config = ScraperConfig::default();
        assert!(config.marketplace(Marketplace::Ozon).is_some());
        assert!(config.marketplace(Marketplace::Wildberries).is_some());
        assert_eq!(config.max_fetch, 100);
        assert_eq!(config.concurrency, 4);
    }

    #[test]
    fn test_default_session_ttls_differ() {
        let ttls = ScraperConfig::default().session_ttls();
        assert_eq!(ttls[&Marketplace::Ozon], Duration::from_secs(3600));
        assert_eq!(ttls[&Marketplace::Wildberries], Duration::from_secs(600));
    }

    #[test]
    fn test_retry_backoff_is_exponential_and_capped() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_delay_ms: 500,
            max_delay_ms: 3_000,
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(500));
        assert_eq!(policy.backoff(1), Duration::from_millis(1_000));
        assert_eq!(policy.backoff(2), Duration::from_millis(2_000));
        assert_eq!(policy.backoff(3), Duration::from_millis(3_000));
        assert_eq!(policy.backoff(70), Duration::from_millis(3_000));
    }

    #[test]
    fn test_config_deserialization_uses_defaults() {
        let json = r#"{"max_fetch": 40, "retry": {"max_retries": 1}}"#;
        let config: ScraperConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.max_fetch, 40);
        assert_eq!(config.retry.max_retries, 1);
        assert_eq!(config.retry.base_delay_ms, 500);
        assert_eq!(config.marketplaces.len(), 2);
        assert!(config.browser.headless);
    }

    #[test]
    fn test_config_roundtrip_keeps_marketplace_keys() {
        let config = ScraperConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"ozon\""));
        assert!(json.contains("\"wildberries\""));
    }

    #[test]
    fn test_field_selectors_partial() {
        let json = r#"{"name": "h1"}"#;
        let fields: FieldSelectors = serde_json::from_str(json).unwrap();
        assert_eq!(fields.name.as_deref(), Some("h1"));
        assert!(fields.price.is_none());
    }
}
