//! Ozon adapter.
//!
//! Ozon pages are assembled by a page composer. Requesting the composer with a
//! page path returns the same widget states the site renders from, each one a
//! JSON document encoded as a string.

use serde_json::{Map, Value};

use super::{check_article, check_query, parse_owned_url, resolve, with_params};
use crate::config::{FieldSelectors, MarketplaceSettings, SelectorSet};
use crate::marketplace::{EndpointRequest, MarketplaceAdapter};
use crate::target::{Classified, TargetInput, TargetKind};
use crate::{Marketplace, RawItem, Result, ScrapeError};

/// Public storefront.
pub const SITE: &str = "https://www.ozon.ru";

const COMPOSER: &str = "https://www.ozon.ru/api/entrypoint-api.bx/page/json/v2";

/// Ozon marketplace adapter.
pub struct Ozon {
    settings: MarketplaceSettings,
}

impl Ozon {
    /// Creates an adapter with the default settings.
    pub fn new() -> Self {
        Self::with_settings(Self::default_settings())
    }

    /// Creates an adapter with custom settings.
    pub fn with_settings(settings: MarketplaceSettings) -> Self {
        Self { settings }
    }

    /// Default settings: long-lived anti-bot cookies, composer endpoint.
    pub fn default_settings() -> MarketplaceSettings {
        MarketplaceSettings {
            session_ttl_secs: 3600,
            use_session: true,
            direct_enabled: true,
            landing_url: format!("{}/", SITE),
            search_endpoint: COMPOSER.to_string(),
            product_endpoint: COMPOSER.to_string(),
            region: None,
            max_pages: 3,
            selectors: SelectorSet {
                ready: "[data-widget='searchResultsV2'], [data-widget='webProductHeading']"
                    .to_string(),
                card: "[data-widget='searchResultsV2'] .tile-root".to_string(),
                card_id_attr: None,
                list: FieldSelectors {
                    name: Some(".tile-clickable-element span.tsBody500Medium".to_string()),
                    price: Some("span.tsHeadline500Medium".to_string()),
                    old_price: Some("span.tsBodyControl400Small".to_string()),
                    discount: None,
                    stock: None,
                    image: Some("img".to_string()),
                    link: Some("a.tile-clickable-element".to_string()),
                    labels: None,
                },
                product: FieldSelectors {
                    name: Some("[data-widget='webProductHeading'] h1".to_string()),
                    price: Some("[data-widget='webPrice'] span".to_string()),
                    old_price: None,
                    discount: None,
                    stock: Some("[data-widget='webStockInfo']".to_string()),
                    image: Some("[data-widget='webGallery'] img".to_string()),
                    link: None,
                    labels: Some("[data-widget='webMarketingLabels'] span".to_string()),
                },
                challenge_markers: vec![
                    "доступ ограничен".to_string(),
                    "antibot".to_string(),
                    "captcha".to_string(),
                ],
                // List tiles carry no stock and only truncated names.
                dereference_cards: true,
            },
        }
    }

    fn composer_request(&self, endpoint: &str, path: &str, referer: String) -> EndpointRequest {
        EndpointRequest {
            url: with_params(endpoint, &[("url", path)]),
            referer,
            origin: SITE.to_string(),
        }
    }
}

impl Default for Ozon {
    fn default() -> Self {
        Self::new()
    }
}

impl MarketplaceAdapter for Ozon {
    fn marketplace(&self) -> Marketplace {
        Marketplace::Ozon
    }

    fn config(&self) -> &MarketplaceSettings {
        &self.settings
    }

    fn classify(&self, input: &TargetInput) -> Result<Classified> {
        match input {
            TargetInput::Url(raw) => {
                let url = parse_owned_url(Marketplace::Ozon, raw)?;
                let page_url = url.to_string();
                if let Some(article) = article_from_url(url.as_str()) {
                    return Ok(Classified {
                        kind: TargetKind::ProductPage { article },
                        page_url,
                    });
                }
                // Both /search/ and /category/ pages may carry a text query.
                let query = url
                    .query_pairs()
                    .find(|(k, _)| k == "text")
                    .map(|(_, v)| v.trim().to_string())
                    .filter(|v| !v.is_empty());
                Ok(Classified {
                    kind: TargetKind::CategorySearch { query },
                    page_url,
                })
            }
            TargetInput::Query(query) => {
                let query = check_query(query)?;
                Ok(Classified {
                    kind: TargetKind::CategorySearch {
                        query: Some(query.to_string()),
                    },
                    page_url: self.search_page_url(query),
                })
            }
            TargetInput::Article(article) => {
                let article = check_article(article)?;
                Ok(Classified {
                    kind: TargetKind::ProductPage {
                        article: article.to_string(),
                    },
                    page_url: self.product_page_url(article),
                })
            }
        }
    }

    fn search_request(&self, query: &str, page: u32) -> Result<EndpointRequest> {
        let query = check_query(query)?;
        let mut path = format!("/search/?text={}", urlencoding::encode(query));
        if page > 1 {
            path.push_str(&format!("&page={}", page));
        }
        Ok(self.composer_request(
            &self.settings.search_endpoint,
            &path,
            self.search_page_url(query),
        ))
    }

    fn parse_search(&self, body: &Value) -> Result<Vec<RawItem>> {
        let widgets = widget_states(body)?;
        let mut items = Vec::new();
        for (_, state) in widgets.iter().filter(|(k, _)| k.starts_with("searchResultsV2")) {
            if let Some(tiles) = state.get("items").and_then(Value::as_array) {
                items.extend(tiles.iter().cloned().map(RawItem::json));
            }
        }
        Ok(items)
    }

    fn product_request(&self, article: &str) -> Result<EndpointRequest> {
        let article = check_article(article)?;
        Ok(self.composer_request(
            &self.settings.product_endpoint,
            &format!("/product/{}/", article),
            self.product_page_url(article),
        ))
    }

    fn parse_product(&self, article: &str, body: &Value) -> Result<Option<RawItem>> {
        let widgets = widget_states(body)?;
        let widget = |prefix: &str| find_widget(&widgets, prefix);

        let Some(name) = widget("webProductHeading")
            .and_then(|h| h.get("title"))
            .and_then(Value::as_str)
        else {
            return Ok(None);
        };

        let mut product = Map::new();
        product.insert("sku".into(), Value::String(article.to_string()));
        product.insert("name".into(), Value::String(name.to_string()));
        product.insert("url".into(), Value::String(self.product_page_url(article)));
        if let Some(price) = widget("webPrice") {
            for (from, to) in [("price", "price"), ("cardPrice", "price"), ("originalPrice", "originalPrice")] {
                if let Some(text) = price.get(from).and_then(Value::as_str) {
                    product.entry(to).or_insert_with(|| Value::String(text.to_string()));
                }
            }
        }
        if let Some(image) = widget("webGallery")
            .and_then(|g| g.get("coverImage").or_else(|| g.pointer("/images/0/src")))
            .and_then(Value::as_str)
        {
            product.insert("image".into(), Value::String(image.to_string()));
        }
        if let Some(stock) = widget("webStockInfo")
            .and_then(|s| s.get("text").or_else(|| s.get("title")))
            .and_then(Value::as_str)
        {
            product.insert("stock".into(), Value::String(stock.to_string()));
        }
        let labels: Vec<Value> = widget("webMarketingLabels")
            .and_then(|l| l.get("items"))
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|i| i.get("title").and_then(Value::as_str))
                    .map(|t| Value::String(t.to_string()))
                    .collect()
            })
            .unwrap_or_default();
        product.insert("labels".into(), Value::Array(labels));

        Ok(Some(RawItem::json(Value::Object(product))))
    }

    fn product_page_url(&self, article: &str) -> String {
        format!("{}/context/detail/id/{}/", SITE, article)
    }

    fn search_page_url(&self, query: &str) -> String {
        format!("{}/search/?text={}", SITE, urlencoding::encode(query))
    }
}

/// Decodes `widgetStates`, whose values are JSON documents encoded as strings.
fn widget_states(body: &Value) -> Result<Vec<(String, Value)>> {
    let states = body
        .get("widgetStates")
        .and_then(Value::as_object)
        .ok_or_else(|| ScrapeError::Parse("composer response has no widgetStates".to_string()))?;

    let mut decoded = Vec::with_capacity(states.len());
    for (key, raw) in states {
        let value = match raw {
            Value::String(s) => match serde_json::from_str(s) {
                Ok(v) => v,
                Err(e) => {
                    tracing::debug!("Skipping undecodable widget {}: {}", key, e);
                    continue;
                }
            },
            other => other.clone(),
        };
        decoded.push((key.clone(), value));
    }
    Ok(decoded)
}

fn find_widget<'a>(widgets: &'a [(String, Value)], prefix: &str) -> Option<&'a Value> {
    widgets
        .iter()
        .find(|(k, _)| k.starts_with(prefix))
        .map(|(_, v)| v)
}

/// Extracts the SKU from `/product/<slug>-<digits>/` or `/context/detail/id/<digits>/`.
pub fn article_from_url(url: &str) -> Option<String> {
    let url = resolve(SITE, url)?;
    let segments: Vec<&str> = url.path_segments()?.filter(|s| !s.is_empty()).collect();
    let candidate = match segments.as_slice() {
        ["product", slug, ..] => slug.rsplit('-').next()?,
        ["context", "detail", "id", id, ..] => *id,
        _ => return None,
    };
    if !candidate.is_empty() && candidate.chars().all(|c| c.is_ascii_digit()) {
        Some(candidate.to_string())
    } else {
        None
    }
}

/// Turns a tile link into an absolute product URL without tracking parameters.
pub fn absolute_url(link: &str) -> String {
    match resolve(SITE, link) {
        Some(mut url) => {
            url.set_query(None);
            url.set_fragment(None);
            url.to_string()
        }
        None => link.to_string(),
    }
}
