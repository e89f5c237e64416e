//! Wildberries adapter.
//!
//! The public site exposes two JSON endpoints the storefront itself calls:
//! a paged text search and a card-detail lookup by article (`nm`). Listing
//! pages other than text search have no usable endpoint and go straight to
//! rendering.

use serde_json::Value;

use super::{check_article, check_query, parse_owned_url, resolve, with_params};
use crate::config::{FieldSelectors, MarketplaceSettings, SelectorSet};
use crate::marketplace::{EndpointRequest, MarketplaceAdapter};
use crate::target::{Classified, TargetInput, TargetKind};
use crate::{Marketplace, RawItem, Result, ScrapeError};

/// Public storefront.
pub const SITE: &str = "https://www.wildberries.ru";

/// Default delivery region (Moscow).
const DEFAULT_DEST: &str = "-1257786";

/// Wildberries marketplace adapter.
pub struct Wildberries {
    settings: MarketplaceSettings,
}

impl Wildberries {
    /// Creates an adapter with the default settings.
    pub fn new() -> Self {
        Self::with_settings(Self::default_settings())
    }

    /// Creates an adapter with custom settings.
    pub fn with_settings(settings: MarketplaceSettings) -> Self {
        Self { settings }
    }

    /// Default settings: short-lived anti-bot cookies, live endpoints.
    pub fn default_settings() -> MarketplaceSettings {
        MarketplaceSettings {
            session_ttl_secs: 600,
            use_session: true,
            direct_enabled: true,
            landing_url: format!("{}/", SITE),
            search_endpoint: "https://search.wb.ru/exactmatch/ru/common/v7/search".to_string(),
            product_endpoint: "https://card.wb.ru/cards/v2/detail".to_string(),
            region: Some(DEFAULT_DEST.to_string()),
            max_pages: 5,
            selectors: SelectorSet {
                ready: "article.product-card, h1.product-page__title".to_string(),
                card: "article.product-card".to_string(),
                card_id_attr: Some("data-nm-id".to_string()),
                list: FieldSelectors {
                    name: Some(".product-card__name".to_string()),
                    price: Some(".price__lower-price".to_string()),
                    old_price: Some("del".to_string()),
                    discount: Some(".product-card__discount".to_string()),
                    stock: None,
                    image: Some("img".to_string()),
                    link: Some("a.product-card__link".to_string()),
                    labels: Some(".product-card__tip".to_string()),
                },
                product: FieldSelectors {
                    name: Some("h1.product-page__title".to_string()),
                    price: Some("ins.price-block__final-price".to_string()),
                    old_price: Some("del.price-block__old-price".to_string()),
                    discount: None,
                    stock: Some(".product-page__stock".to_string()),
                    image: Some(".slide__content img".to_string()),
                    link: None,
                    labels: Some(".product-page__badge".to_string()),
                },
                challenge_markers: vec![
                    "почти готово".to_string(),
                    "подозрительная активность".to_string(),
                    "captcha".to_string(),
                ],
                dereference_cards: false,
            },
        }
    }

    fn dest(&self) -> &str {
        self.settings.region.as_deref().unwrap_or(DEFAULT_DEST)
    }
}

impl Default for Wildberries {
    fn default() -> Self {
        Self::new()
    }
}

impl MarketplaceAdapter for Wildberries {
    fn marketplace(&self) -> Marketplace {
        Marketplace::Wildberries
    }

    fn config(&self) -> &MarketplaceSettings {
        &self.settings
    }

    fn classify(&self, input: &TargetInput) -> Result<Classified> {
        match input {
            TargetInput::Url(raw) => {
                let url = parse_owned_url(Marketplace::Wildberries, raw)?;
                let page_url = url.to_string();
                if let Some(article) = article_from_url(url.as_str()) {
                    return Ok(Classified {
                        kind: TargetKind::ProductPage { article },
                        page_url,
                    });
                }
                let query = if url.path().ends_with("/search.aspx") {
                    url.query_pairs()
                        .find(|(k, _)| k == "search")
                        .map(|(_, v)| v.trim().to_string())
                        .filter(|v| !v.is_empty())
                } else {
                    None
                };
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
        let page = page.max(1).to_string();
        Ok(EndpointRequest {
            url: with_params(
                &self.settings.search_endpoint,
                &[
                    ("appType", "1"),
                    ("curr", "rub"),
                    ("dest", self.dest()),
                    ("query", query),
                    ("resultset", "catalog"),
                    ("sort", "popular"),
                    ("spp", "30"),
                    ("page", page.as_str()),
                ],
            ),
            referer: self.search_page_url(query),
            origin: SITE.to_string(),
        })
    }

    fn parse_search(&self, body: &Value) -> Result<Vec<RawItem>> {
        match products(body) {
            Some(items) => Ok(items.iter().cloned().map(RawItem::json).collect()),
            // An answer with metadata but no product list means zero hits.
            None if body.get("data").is_some() || body.get("metadata").is_some() => Ok(Vec::new()),
            None => Err(ScrapeError::Parse(
                "search response has no product list".to_string(),
            )),
        }
    }

    fn product_request(&self, article: &str) -> Result<EndpointRequest> {
        let article = check_article(article)?;
        Ok(EndpointRequest {
            url: with_params(
                &self.settings.product_endpoint,
                &[
                    ("appType", "1"),
                    ("curr", "rub"),
                    ("dest", self.dest()),
                    ("spp", "30"),
                    ("nm", article),
                ],
            ),
            referer: self.product_page_url(article),
            origin: SITE.to_string(),
        })
    }

    fn parse_product(&self, article: &str, body: &Value) -> Result<Option<RawItem>> {
        let items = products(body).ok_or_else(|| {
            ScrapeError::Parse("card response has no product list".to_string())
        })?;
        // Only the requested article counts.
        let item = items.iter().find(|p| match p.get("id") {
            Some(Value::Number(id)) => id.to_string() == article,
            Some(Value::String(id)) => id.trim() == article,
            _ => false,
        });
        Ok(item.cloned().map(RawItem::json))
    }

    fn product_page_url(&self, article: &str) -> String {
        product_url(article)
    }

    fn search_page_url(&self, query: &str) -> String {
        format!(
            "{}/catalog/0/search.aspx?search={}",
            SITE,
            urlencoding::encode(query)
        )
    }
}

fn products(body: &Value) -> Option<&Vec<Value>> {
    body.pointer("/data/products")
        .or_else(|| body.get("products"))
        .and_then(Value::as_array)
}

/// Public product page for an article.
pub fn product_url(article: &str) -> String {
    format!("{}/catalog/{}/detail.aspx", SITE, article)
}

/// Extracts the article from `/catalog/<digits>/detail.aspx`.
pub fn article_from_url(url: &str) -> Option<String> {
    let url = resolve(SITE, url)?;
    let segments: Vec<&str> = url.path_segments()?.filter(|s| !s.is_empty()).collect();
    match segments.as_slice() {
        ["catalog", id, "detail.aspx"] if !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()) => {
            Some(id.to_string())
        }
        _ => None,
    }
}

/// Derives the CDN image URL for an article.
///
/// Images are sharded into numbered baskets by volume (`article / 100000`).
pub fn image_url(article: &str) -> Option<String> {
    let id: u64 = article.parse().ok()?;
    let vol = id / 100_000;
    let part = id / 1_000;
    Some(format!(
        "https://basket-{:02}.wbbasket.ru/vol{}/part{}/{}/images/c516x688/1.webp",
        basket(vol),
        vol,
        part,
        id
    ))
}

fn basket(vol: u64) -> u32 {
    const UPPER_BOUNDS: [u64; 24] = [
        143, 287, 431, 719, 1007, 1061, 1115, 1169, 1313, 1601, 1655, 1919, 2045, 2189, 2405,
        2621, 2837, 3053, 3269, 3485, 3701, 3917, 4133, 4349,
    ];
    UPPER_BOUNDS
        .iter()
        .position(|upper| vol <= *upper)
        .map(|i| i as u32 + 1)
        .unwrap_or(UPPER_BOUNDS.len() as u32 + 1)
}
