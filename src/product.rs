//! Canonical product records and the raw items they are built from.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ErrorKind, Marketplace, ScrapeError, ScrapeRequest};

/// Which strategy produced an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionSource {
    /// Internal JSON data endpoint.
    Direct,
    /// Rendered browser DOM.
    Rendered,
}

/// Old/new price pair shown when an item is discounted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricePair {
    pub old: f64,
    pub new: f64,
}

/// One captured product snapshot.
///
/// `identifier`, `marketplace` and `captured_at` together identify the
/// snapshot. Every scrape produces new snapshots; history is kept by the
/// persistence collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub marketplace: Marketplace,
    /// Marketplace-scoped article.
    pub identifier: String,
    pub name: String,
    /// Current price in major currency units.
    pub price: f64,
    pub price_pair: Option<PricePair>,
    pub discount_percent: Option<u32>,
    /// Units in stock, when the source exposes it.
    pub stock: Option<u32>,
    pub image_url: Option<String>,
    pub promo_labels: Vec<String>,
    /// Product page URL, when known.
    pub url: Option<String>,
    pub source: ExtractionSource,
    pub captured_at: DateTime<Utc>,
}

impl Product {
    /// Returns the `(marketplace, identifier, captured_at)` snapshot key.
    pub fn snapshot_key(&self) -> (Marketplace, &str, DateTime<Utc>) {
        (self.marketplace, &self.identifier, self.captured_at)
    }
}

/// Field text read from a rendered page. Any field may be missing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomFields {
    pub article: Option<String>,
    pub name: Option<String>,
    pub price: Option<String>,
    pub old_price: Option<String>,
    pub discount: Option<String>,
    pub stock: Option<String>,
    pub image: Option<String>,
    pub link: Option<String>,
    pub labels: Vec<String>,
}

impl DomFields {
    /// Whether the fields required for a product are all present.
    pub fn has_required(&self) -> bool {
        self.name.is_some() && self.price.is_some() && (self.article.is_some() || self.link.is_some())
    }
}

/// Marketplace payload before normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum RawPayload {
    /// One item object from a data endpoint.
    Json(Value),
    /// Fields read from the DOM.
    Dom(DomFields),
}

/// An item as extracted, with its provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawItem {
    pub payload: RawPayload,
    pub source: ExtractionSource,
    /// Page the item was read from.
    pub page_url: Option<String>,
}

impl RawItem {
    /// Wraps a JSON item from a data endpoint.
    pub fn json(value: Value) -> Self {
        Self {
            payload: RawPayload::Json(value),
            source: ExtractionSource::Direct,
            page_url: None,
        }
    }

    /// Wraps DOM fields from a rendered page.
    pub fn dom(fields: DomFields) -> Self {
        Self {
            payload: RawPayload::Dom(fields),
            source: ExtractionSource::Rendered,
            page_url: None,
        }
    }

    /// Sets the page URL the item came from.
    pub fn with_page_url(mut self, url: impl Into<String>) -> Self {
        self.page_url = Some(url.into());
        self
    }
}

/// Products produced for one target.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScrapeResult {
    pub products: Vec<Product>,
    /// Strategy whose items were kept.
    pub source: Option<ExtractionSource>,
}

impl ScrapeResult {
    pub fn new(products: Vec<Product>, source: ExtractionSource) -> Self {
        Self {
            products,
            source: Some(source),
        }
    }

    pub fn len(&self) -> usize {
        self.products.len()
    }

    pub fn is_empty(&self) -> bool {
        self.products.is_empty()
    }
}

/// Per-target error reported to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&ScrapeError> for TargetFailure {
    fn from(err: &ScrapeError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Outcome of one target in a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetOutcome {
    pub request: ScrapeRequest,
    pub outcome: std::result::Result<ScrapeResult, TargetFailure>,
}

impl TargetOutcome {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_raw_item_json_is_direct() {
        let item = RawItem::json(json!({"id": 1}));
        assert_eq!(item.source, ExtractionSource::Direct);
        assert!(item.page_url.is_none());
    }

    #[test]
    fn test_raw_item_dom_with_page_url() {
        let item = RawItem::dom(DomFields::default()).with_page_url("https://www.ozon.ru/");
        assert_eq!(item.source, ExtractionSource::Rendered);
        assert_eq!(item.page_url.as_deref(), Some("https://www.ozon.ru/"));
    }

    #[test]
    fn test_dom_fields_has_required() {
        let mut fields = DomFields {
            name: Some("Хлебцы".into()),
            price: Some("100 ₽".into()),
            ..Default::default()
        };
        assert!(!fields.has_required());
        fields.link = Some("/catalog/1/detail.aspx".into());
        assert!(fields.has_required());
    }

    #[test]
    fn test_target_failure_from_error() {
        let err = ScrapeError::AntiBotChallenge("captcha page".into());
        let failure = TargetFailure::from(&err);
        assert_eq!(failure.kind, ErrorKind::AntiBotChallenge);
        assert!(failure.message.contains("captcha page"));
    }

    #[test]
    fn test_scrape_result_serialization() {
        let result = ScrapeResult::new(Vec::new(), ExtractionSource::Rendered);
        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains("\"source\":\"rendered\""));
        assert!(result.is_empty());
    }
}
