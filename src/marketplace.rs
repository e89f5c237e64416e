//! Marketplace identity and the per-marketplace strategy trait.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{MarketplaceSettings, SelectorSet};
use crate::marketplaces::{ozon, wildberries};
use crate::target::{Classified, TargetInput, TargetKind};
use crate::{RawItem, Result, ScrapeError};

/// Supported marketplaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Marketplace {
    Ozon,
    Wildberries,
}

impl Marketplace {
    /// Every marketplace the engine knows about.
    pub const ALL: [Marketplace; 2] = [Marketplace::Ozon, Marketplace::Wildberries];

    /// Lower-case identifier used in logs, dump file names and config keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ozon => "ozon",
            Self::Wildberries => "wildberries",
        }
    }

    /// Whether a URL host belongs to this marketplace.
    pub fn owns_host(&self, host: &str) -> bool {
        let host = host.trim_start_matches("www.");
        let suffixes: &[&str] = match self {
            Self::Ozon => &["ozon.ru", "ozon.by", "ozon.kz"],
            Self::Wildberries => &["wildberries.ru", "wildberries.by", "wildberries.kz", "wb.ru"],
        };
        suffixes
            .iter()
            .any(|s| host == *s || host.ends_with(&format!(".{}", s)))
    }

    /// Extracts the marketplace article from a product URL.
    pub fn article_from_url(&self, url: &str) -> Option<String> {
        match self {
            Self::Ozon => ozon::article_from_url(url),
            Self::Wildberries => wildberries::article_from_url(url),
        }
    }
}

impl fmt::Display for Marketplace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Marketplace {
    type Err = ScrapeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "ozon" => Ok(Self::Ozon),
            "wildberries" | "wb" => Ok(Self::Wildberries),
            other => Err(ScrapeError::UnsupportedMarketplace(other.to_string())),
        }
    }
}

/// A prepared request against a marketplace's internal data endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointRequest {
    /// Fully built endpoint URL.
    pub url: String,
    /// Page the in-page script would have been running on.
    pub referer: String,
    /// Origin header value.
    pub origin: String,
}

/// Strategy implemented once per marketplace.
///
/// The orchestrator and both clients dispatch through this trait; nothing
/// outside `marketplaces/` inspects URLs or payload envelopes directly.
pub trait MarketplaceAdapter: Send + Sync {
    /// The marketplace this adapter serves.
    fn marketplace(&self) -> Marketplace;

    /// Returns the marketplace settings.
    fn config(&self) -> &MarketplaceSettings;

    /// Resolves a caller-supplied target into a kind and a page URL.
    fn classify(&self, input: &TargetInput) -> Result<Classified>;

    /// Builds a search-by-text endpoint request for a 1-based page.
    fn search_request(&self, query: &str, page: u32) -> Result<EndpointRequest>;

    /// Unwraps the search response envelope into raw items, in source order.
    fn parse_search(&self, body: &Value) -> Result<Vec<RawItem>>;

    /// Builds a product-by-id endpoint request.
    fn product_request(&self, article: &str) -> Result<EndpointRequest>;

    /// Unwraps the product response envelope. `None` means no such product.
    fn parse_product(&self, article: &str, body: &Value) -> Result<Option<RawItem>>;

    /// Public product page for an article.
    fn product_page_url(&self, article: &str) -> String;

    /// Public search page for a query.
    fn search_page_url(&self, query: &str) -> String;

    /// Returns the DOM selectors for rendered extraction.
    fn selectors(&self) -> &SelectorSet {
        &self.config().selectors
    }

    /// Whether a usable data endpoint exists for this kind of target.
    fn supports_direct(&self, kind: &TargetKind) -> bool {
        if !self.config().direct_enabled {
            return false;
        }
        match kind {
            TargetKind::ProductPage { .. } => true,
            TargetKind::CategorySearch { query } => query.is_some(),
        }
    }
}
