//! Mapping of raw marketplace payloads into canonical [`Product`] records.
//!
//! All payload-shape knowledge lives here: Wildberries card JSON (legacy
//! `priceU` fields and the newer `sizes[].price` block), Ozon composer tiles,
//! the flattened Ozon product object built by the adapter, and DOM fields.

use std::collections::HashSet;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::marketplaces::{ozon, wildberries};
use crate::{
    DomFields, Marketplace, PricePair, Product, RawItem, RawPayload, Result, ScrapeError,
    ScrapeTarget,
};

fn number_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d[\d\s]*(?:[.,]\d{1,2})?").ok())
        .as_ref()
}

fn integer_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d[\d\s]*").ok()).as_ref()
}

/// Extracts the first numeric amount from price text.
///
/// Whitespace (including non-breaking and thin spaces) is treated as a digit
/// group separator and a comma as the decimal mark: `"1 299,50 ₽"` → `1299.5`.
pub fn parse_price(text: &str) -> Option<f64> {
    let m = number_re()?.find(text)?;
    let cleaned: String = m
        .as_str()
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| if c == ',' { '.' } else { c })
        .collect();
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Extracts the first whole number from text such as `"Осталось 18 шт"`.
pub fn parse_count(text: &str) -> Option<u32> {
    let m = integer_re()?.find(text)?;
    let digits: String = m.as_str().chars().filter(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

/// Extracts a discount percentage from text such as `"−18%"`.
pub fn parse_percent(text: &str) -> Option<u32> {
    parse_count(text).filter(|p| *p <= 100)
}

/// Field values common to every payload shape, before validation.
#[derive(Debug, Default)]
struct Fields {
    identifier: Option<String>,
    name: Option<String>,
    price: Option<f64>,
    old_price: Option<f64>,
    discount: Option<u32>,
    stock: Option<u32>,
    image: Option<String>,
    url: Option<String>,
    labels: Vec<String>,
}

/// Normalizes one raw item into a product snapshot.
///
/// Returns [`ScrapeError::Parse`] when a required field (identifier, name,
/// price) cannot be read. Optional fields that are missing or malformed are
/// left absent.
pub fn normalize(
    item: &RawItem,
    marketplace: Marketplace,
    captured_at: DateTime<Utc>,
) -> Result<Product> {
    let fields = match (&item.payload, marketplace) {
        (RawPayload::Json(value), Marketplace::Wildberries) => wildberries_fields(value),
        (RawPayload::Json(value), Marketplace::Ozon) => ozon_fields(value),
        (RawPayload::Dom(dom), _) => dom_fields(dom, marketplace, item.page_url.as_deref()),
    };

    let identifier = fields
        .identifier
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ScrapeError::Parse("item has no identifier".to_string()))?;
    let name = fields
        .name
        .map(|s| collapse_whitespace(&s))
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ScrapeError::Parse(format!("item {} has no name", identifier)))?;
    let price = fields
        .price
        .filter(|p| *p >= 0.0)
        .ok_or_else(|| ScrapeError::Parse(format!("item {} has no price", identifier)))?;

    let price_pair = fields
        .old_price
        .filter(|old| *old > price)
        .map(|old| PricePair { old, new: price });
    let discount_percent = fields.discount.or_else(|| {
        price_pair.map(|pair| (((pair.old - pair.new) / pair.old) * 100.0).round() as u32)
    });

    Ok(Product {
        marketplace,
        identifier,
        name,
        price,
        price_pair,
        discount_percent,
        stock: fields.stock,
        image_url: fields.image.filter(|s| !s.is_empty()),
        promo_labels: dedupe_labels(fields.labels),
        url: fields.url.or_else(|| item.page_url.clone()),
        source: item.source,
        captured_at,
    })
}

/// Normalizes a batch, skipping items that lack required fields.
pub fn normalize_all(
    items: &[RawItem],
    marketplace: Marketplace,
    captured_at: DateTime<Utc>,
) -> Vec<Product> {
    items
        .iter()
        .filter_map(|item| match normalize(item, marketplace, captured_at) {
            Ok(product) => Some(product),
            Err(e) => {
                warn!("Skipping {} item: {}", marketplace, e);
                None
            }
        })
        .collect()
}

/// Keeps products passing both filters. Empty filters pass everything.
///
/// The category filter matches any term as a case-insensitive substring of
/// the name; the article filter matches any term as a substring of the
/// identifier.
pub fn apply_filters(
    products: Vec<Product>,
    category_filter: &[String],
    article_filter: &[String],
) -> Vec<Product> {
    let categories: Vec<String> = category_filter.iter().map(|t| t.to_lowercase()).collect();
    let articles: Vec<String> = article_filter.iter().map(|t| t.to_lowercase()).collect();

    products
        .into_iter()
        .filter(|p| {
            let name = p.name.to_lowercase();
            categories.is_empty() || categories.iter().any(|t| name.contains(t.as_str()))
        })
        .filter(|p| {
            let id = p.identifier.to_lowercase();
            articles.is_empty() || articles.iter().any(|t| id.contains(t.as_str()))
        })
        .collect()
}

/// De-duplicates, filters and only then truncates to the target limit.
pub fn finalize(products: Vec<Product>, target: &ScrapeTarget) -> Vec<Product> {
    let fetched = products.len();
    let mut seen = HashSet::new();
    let unique: Vec<Product> = products
        .into_iter()
        .filter(|p| seen.insert(p.identifier.clone()))
        .collect();
    let mut filtered = apply_filters(unique, &target.category_filter, &target.article_filter);
    if target.limit > 0 {
        filtered.truncate(target.limit);
    }
    debug!(
        "Finalized {} of {} fetched items for '{}'",
        filtered.len(),
        fetched,
        target.raw
    );
    filtered
}

fn wildberries_fields(value: &Value) -> Fields {
    let identifier = scalar_string(value.get("id"));
    let sizes = value.get("sizes").and_then(Value::as_array);

    // Legacy cards carry kopek prices at the top level; current ones per size.
    let (price, old_price) = match (
        value.get("salePriceU").and_then(Value::as_f64),
        value.get("priceU").and_then(Value::as_f64),
    ) {
        (Some(sale), basic) => (Some(sale / 100.0), basic.map(|b| b / 100.0)),
        (None, Some(basic)) => (Some(basic / 100.0), None),
        (None, None) => sizes
            .into_iter()
            .flatten()
            .filter_map(|size| size.get("price"))
            .map(|p| {
                (
                    p.get("product").and_then(Value::as_f64).map(|v| v / 100.0),
                    p.get("basic").and_then(Value::as_f64).map(|v| v / 100.0),
                )
            })
            .find(|(product, _)| product.is_some())
            .unwrap_or((None, None)),
    };

    let stock = value
        .get("totalQuantity")
        .and_then(Value::as_u64)
        .map(|q| q.min(u32::MAX as u64) as u32)
        .or_else(|| {
            let quantities: Vec<u64> = sizes
                .into_iter()
                .flatten()
                .filter_map(|size| size.get("stocks").and_then(Value::as_array))
                .flatten()
                .filter_map(|stock| stock.get("qty").and_then(Value::as_u64))
                .collect();
            if quantities.is_empty() {
                None
            } else {
                Some(quantities.iter().sum::<u64>().min(u32::MAX as u64) as u32)
            }
        });

    let labels = ["promoTextCard", "promoTextCat"]
        .iter()
        .filter_map(|key| value.get(*key).and_then(Value::as_str))
        .map(str::to_string)
        .collect();

    Fields {
        image: identifier.as_deref().and_then(wildberries::image_url),
        url: identifier.as_deref().map(wildberries::product_url),
        identifier,
        name: value.get("name").and_then(Value::as_str).map(str::to_string),
        price,
        old_price,
        discount: value
            .get("sale")
            .and_then(Value::as_u64)
            .filter(|d| *d > 0 && *d <= 100)
            .map(|d| d as u32),
        stock,
        labels,
    }
}

fn ozon_fields(value: &Value) -> Fields {
    if value.get("mainState").is_some() {
        ozon_tile_fields(value)
    } else {
        ozon_flat_fields(value)
    }
}

fn ozon_tile_fields(value: &Value) -> Fields {
    let link = value
        .pointer("/action/link")
        .and_then(Value::as_str)
        .map(str::to_string);
    let identifier = scalar_string(value.get("sku"))
        .or_else(|| link.as_deref().and_then(ozon::article_from_url))
        .or_else(|| scalar_string(value.get("skuId")));

    let mut fields = Fields {
        identifier,
        url: link.as_deref().map(ozon::absolute_url),
        image: value
            .pointer("/tileImage/items/0/image/link")
            .or_else(|| value.pointer("/tileImage/images/0"))
            .and_then(Value::as_str)
            .map(str::to_string),
        ..Default::default()
    };

    let atoms = value
        .get("mainState")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    for entry in atoms {
        let atom = entry.get("atom").unwrap_or(entry);
        let atom_id = entry
            .get("id")
            .or_else(|| entry.get("name"))
            .or_else(|| atom.get("id"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        let atom_type = atom.get("type").and_then(Value::as_str).unwrap_or_default();

        match atom_type {
            "textAtom" => {
                let text = atom
                    .pointer("/textAtom/text")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                if atom_id == "name" && fields.name.is_none() {
                    fields.name = Some(text.to_string());
                } else if fields.stock.is_none() && text.to_lowercase().contains("осталось") {
                    fields.stock = parse_count(text);
                }
            }
            "priceV2" => {
                let prices = atom
                    .pointer("/priceV2/price")
                    .and_then(Value::as_array)
                    .map(Vec::as_slice)
                    .unwrap_or_default();
                for price in prices {
                    let text = price.get("text").and_then(Value::as_str).unwrap_or_default();
                    match price.get("textStyle").and_then(Value::as_str) {
                        Some("ORIGINAL_PRICE") => fields.old_price = parse_price(text),
                        _ if fields.price.is_none() => fields.price = parse_price(text),
                        _ => {}
                    }
                }
                fields.discount = atom
                    .pointer("/priceV2/discount")
                    .and_then(Value::as_str)
                    .and_then(parse_percent);
            }
            "labelList" => {
                let items = atom
                    .pointer("/labelList/items")
                    .and_then(Value::as_array)
                    .map(Vec::as_slice)
                    .unwrap_or_default();
                fields.labels.extend(
                    items
                        .iter()
                        .filter_map(|i| i.get("title").and_then(Value::as_str))
                        .map(str::to_string),
                );
            }
            _ => {}
        }
    }
    fields
}

fn ozon_flat_fields(value: &Value) -> Fields {
    let text = |key: &str| value.get(key).and_then(Value::as_str);
    Fields {
        identifier: scalar_string(value.get("sku")),
        name: text("name").map(str::to_string),
        price: text("price").and_then(parse_price),
        old_price: text("originalPrice").and_then(parse_price),
        discount: text("discount").and_then(parse_percent),
        stock: text("stock").and_then(parse_count),
        image: text("image").map(str::to_string),
        url: text("url").map(str::to_string),
        labels: value
            .get("labels")
            .and_then(Value::as_array)
            .map(|labels| {
                labels
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
    }
}

fn dom_fields(dom: &DomFields, marketplace: Marketplace, page_url: Option<&str>) -> Fields {
    let url = dom
        .link
        .as_deref()
        .map(|link| absolutize(link, page_url))
        .or_else(|| page_url.map(str::to_string));
    let identifier = dom
        .article
        .clone()
        .or_else(|| url.as_deref().and_then(|u| marketplace.article_from_url(u)));

    Fields {
        identifier,
        name: dom.name.clone(),
        price: dom.price.as_deref().and_then(parse_price),
        old_price: optional(dom.old_price.as_deref(), "old_price", parse_price),
        discount: optional(dom.discount.as_deref(), "discount", parse_percent),
        stock: optional(dom.stock.as_deref(), "stock", parse_count),
        image: dom.image.as_deref().map(|src| absolutize(src, page_url)),
        url,
        labels: dom.labels.clone(),
    }
}

fn optional<T>(text: Option<&str>, field: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
    let text = text?;
    let parsed = parse(text);
    if parsed.is_none() {
        warn!("Field '{}' has unreadable value '{}', leaving it absent", field, text);
    }
    parsed
}

fn absolutize(link: &str, base: Option<&str>) -> String {
    if link.starts_with("//") {
        return format!("https:{}", link);
    }
    match base.and_then(|b| url::Url::parse(b).ok()) {
        Some(base) => base
            .join(link)
            .map(|u| u.to_string())
            .unwrap_or_else(|_| link.to_string()),
        None => link.to_string(),
    }
}

fn scalar_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn dedupe_labels(labels: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    labels
        .into_iter()
        .map(|l| collapse_whitespace(&l))
        .filter(|l| !l.is_empty() && seen.insert(l.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ExtractionSource, ScrapeRequest, TargetInput};
    use crate::target::{Classified, TargetKind};
    use chrono::TimeZone;
    use serde_json::json;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn dom(article: &str, name: &str, price: &str) -> RawItem {
        RawItem::dom(DomFields {
            article: Some(article.to_string()),
            name: Some(name.to_string()),
            price: Some(price.to_string()),
            ..Default::default()
        })
    }

    fn product(id: &str, name: &str) -> Product {
        normalize(&dom(id, name, "10"), Marketplace::Ozon, ts()).unwrap()
    }

    fn target(limit: usize, categories: &[&str], articles: &[&str]) -> ScrapeTarget {
        let request = ScrapeRequest::new(Marketplace::Ozon, TargetInput::Query("x".into()))
            .with_limit(limit)
            .with_category_filter(categories.iter().map(|s| s.to_string()).collect())
            .with_article_filter(articles.iter().map(|s| s.to_string()).collect());
        ScrapeTarget::new(
            &request,
            Classified {
                kind: TargetKind::CategorySearch {
                    query: Some("x".into()),
                },
                page_url: "https://www.ozon.ru/search/?text=x".into(),
            },
        )
    }

    #[test]
    fn test_parse_price() {
        assert_eq!(parse_price("100 руб."), Some(100.0));
        assert_eq!(parse_price("1 299 ₽"), Some(1299.0));
        assert_eq!(parse_price("1\u{2009}299\u{00A0}₽"), Some(1299.0));
        assert_eq!(parse_price("1 299,50 ₽"), Some(1299.5));
        assert_eq!(parse_price("от 12.5"), Some(12.5));
        assert_eq!(parse_price("Нет в наличии"), None);
    }

    #[test]
    fn test_parse_count_and_percent() {
        assert_eq!(parse_count("Осталось 18 шт"), Some(18));
        assert_eq!(parse_count("много"), None);
        assert_eq!(parse_percent("−18%"), Some(18));
        assert_eq!(parse_percent("250%"), None);
    }

    #[test]
    fn test_normalize_dom_literal_values() {
        let mut first = dom("A1", "Хлебцы гречневые", "100");
        if let RawPayload::Dom(fields) = &mut first.payload {
            fields.stock = Some("20".into());
        }
        let mut second = dom("A1", "Хлебцы гречневые", "110");
        if let RawPayload::Dom(fields) = &mut second.payload {
            fields.stock = Some("18".into());
        }

        let p1 = normalize(&first, Marketplace::Ozon, ts()).unwrap();
        let p2 = normalize(&second, Marketplace::Ozon, ts() + chrono::Duration::days(1)).unwrap();
        assert_eq!((p1.identifier.as_str(), p1.price, p1.stock), ("A1", 100.0, Some(20)));
        assert_eq!((p2.identifier.as_str(), p2.price, p2.stock), ("A1", 110.0, Some(18)));
        assert_ne!(p1.snapshot_key(), p2.snapshot_key());
    }

    #[test]
    fn test_normalize_dom_missing_optional_fields_are_absent() {
        let mut item = dom("ART123", "Хлебцы", "100 руб.");
        if let RawPayload::Dom(fields) = &mut item.payload {
            fields.stock = Some("в наличии".into());
        }
        let p = normalize(&item, Marketplace::Wildberries, ts()).unwrap();
        assert_eq!(p.stock, None);
        assert_eq!(p.discount_percent, None);
        assert!(p.price_pair.is_none());
        assert!(p.image_url.is_none());
        assert_eq!(p.source, ExtractionSource::Rendered);
    }

    #[test]
    fn test_normalize_dom_missing_required_field_is_parse_error() {
        let item = RawItem::dom(DomFields {
            article: Some("A1".into()),
            name: Some("Name".into()),
            ..Default::default()
        });
        let err = normalize(&item, Marketplace::Ozon, ts()).unwrap_err();
        assert!(matches!(err, ScrapeError::Parse(_)));
    }

    #[test]
    fn test_normalize_dom_article_from_relative_link() {
        let item = RawItem::dom(DomFields {
            name: Some("Хлебцы".into()),
            price: Some("99 ₽".into()),
            old_price: Some("129 ₽".into()),
            link: Some("/catalog/238356171/detail.aspx?targetUrl=SP".into()),
            image: Some("//basket-15.wbbasket.ru/1.webp".into()),
            labels: vec![" Акция ".into(), "Акция".into()],
            ..Default::default()
        })
        .with_page_url("https://www.wildberries.ru/catalog/0/search.aspx?search=x");
        let p = normalize(&item, Marketplace::Wildberries, ts()).unwrap();
        assert_eq!(p.identifier, "238356171");
        assert_eq!(
            p.url.as_deref(),
            Some("https://www.wildberries.ru/catalog/238356171/detail.aspx?targetUrl=SP")
        );
        assert_eq!(p.image_url.as_deref(), Some("https://basket-15.wbbasket.ru/1.webp"));
        assert_eq!(p.price_pair, Some(PricePair { old: 129.0, new: 99.0 }));
        assert_eq!(p.discount_percent, Some(23));
        assert_eq!(p.promo_labels, vec!["Акция"]);
    }

    #[test]
    fn test_normalize_wildberries_legacy_card() {
        let item = RawItem::json(json!({
            "id": 238356171,
            "name": "Хлебцы гречневые",
            "priceU": 12900,
            "salePriceU": 9900,
            "sale": 23,
            "totalQuantity": 18,
            "promoTextCard": "МЕГАСКИДКИ"
        }));
        let p = normalize(&item, Marketplace::Wildberries, ts()).unwrap();
        assert_eq!(p.identifier, "238356171");
        assert_eq!(p.price, 99.0);
        assert_eq!(p.price_pair, Some(PricePair { old: 129.0, new: 99.0 }));
        assert_eq!(p.discount_percent, Some(23));
        assert_eq!(p.stock, Some(18));
        assert_eq!(p.promo_labels, vec!["МЕГАСКИДКИ"]);
        assert!(p.image_url.unwrap().contains("/vol2383/part238356/238356171/"));
        assert_eq!(p.source, ExtractionSource::Direct);
    }

    #[test]
    fn test_normalize_wildberries_sizes_card() {
        let item = RawItem::json(json!({
            "id": 101,
            "name": "Bread",
            "sizes": [
                {"price": {"basic": 20000, "product": 15000}, "stocks": [{"qty": 3}, {"qty": 4}]},
                {"stocks": [{"qty": 1}]}
            ]
        }));
        let p = normalize(&item, Marketplace::Wildberries, ts()).unwrap();
        assert_eq!(p.price, 150.0);
        assert_eq!(p.price_pair, Some(PricePair { old: 200.0, new: 150.0 }));
        assert_eq!(p.discount_percent, Some(25));
        assert_eq!(p.stock, Some(8));
    }

    #[test]
    fn test_normalize_wildberries_without_stock_info() {
        let item = RawItem::json(json!({"id": 5, "name": "X", "salePriceU": 100}));
        let p = normalize(&item, Marketplace::Wildberries, ts()).unwrap();
        assert_eq!(p.price, 1.0);
        assert_eq!(p.stock, None);
    }

    #[test]
    fn test_normalize_ozon_tile() {
        let item = RawItem::json(json!({
            "action": {"link": "/product/hlebtsy-3-zlaka-1605229466/?advert=abc"},
            "tileImage": {"items": [{"image": {"link": "https://cdn1.ozone.ru/s3/1.jpg"}}]},
            "mainState": [
                {"type": "priceV2", "priceV2": {
                    "price": [
                        {"text": "1 299 ₽", "textStyle": "PRICE"},
                        {"text": "1 599 ₽", "textStyle": "ORIGINAL_PRICE"}
                    ],
                    "discount": "−18%"
                }},
                {"type": "textAtom", "id": "name", "textAtom": {"text": "Хлебцы 3 злака"}},
                {"type": "textAtom", "textAtom": {"text": "Осталось 7 шт"}},
                {"type": "labelList", "labelList": {"items": [{"title": "Распродажа"}]}}
            ]
        }));
        let p = normalize(&item, Marketplace::Ozon, ts()).unwrap();
        assert_eq!(p.identifier, "1605229466");
        assert_eq!(p.name, "Хлебцы 3 злака");
        assert_eq!(p.price, 1299.0);
        assert_eq!(p.price_pair, Some(PricePair { old: 1599.0, new: 1299.0 }));
        assert_eq!(p.discount_percent, Some(18));
        assert_eq!(p.stock, Some(7));
        assert_eq!(p.promo_labels, vec!["Распродажа"]);
        assert_eq!(
            p.url.as_deref(),
            Some("https://www.ozon.ru/product/hlebtsy-3-zlaka-1605229466/")
        );
    }

    #[test]
    fn test_normalize_ozon_flat_product() {
        let item = RawItem::json(json!({
            "sku": "1707473661",
            "name": "Хлебцы",
            "price": "250 ₽",
            "originalPrice": "300 ₽",
            "labels": ["Хит"]
        }));
        let p = normalize(&item, Marketplace::Ozon, ts()).unwrap();
        assert_eq!(p.identifier, "1707473661");
        assert_eq!(p.price, 250.0);
        assert_eq!(p.discount_percent, Some(17));
        assert_eq!(p.stock, None);
    }

    #[test]
    fn test_normalize_all_skips_broken_items() {
        let items = vec![
            dom("A1", "Good", "10"),
            RawItem::dom(DomFields::default()),
            dom("A2", "Also good", "12"),
        ];
        let products = normalize_all(&items, Marketplace::Ozon, ts());
        assert_eq!(products.len(), 2);
        assert_eq!(products[1].identifier, "A2");
    }

    #[test]
    fn test_category_filter_case_insensitive() {
        let products = vec![product("1", "Fresh BREAD Loaf"), product("2", "Milk")];
        let filtered = apply_filters(products, &["bread".to_string()], &[]);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].name, "Fresh BREAD Loaf");
    }

    #[test]
    fn test_category_filter_or_semantics() {
        let products = vec![
            product("1", "Хлебцы гречневые"),
            product("2", "Хлебцы рисовые"),
            product("3", "Молоко"),
        ];
        let filtered = apply_filters(
            products,
            &["гречневые".to_string(), "рисовые".to_string()],
            &[],
        );
        assert_eq!(filtered.len(), 2);
    }

    #[test]
    fn test_article_filter_substring() {
        let products = vec![product("ART123", "a"), product("ART456", "b")];
        let filtered = apply_filters(products.clone(), &[], &["ART123".to_string()]);
        assert_eq!(filtered.len(), 1);
        let filtered = apply_filters(products, &[], &["art".to_string()]);
        assert_eq!(filtered.len(), 2);
    }

    #[test]
    fn test_apply_filters_idempotent() {
        let products = vec![
            product("A1", "Fresh bread"),
            product("B2", "Bread sticks"),
            product("A3", "Cheese"),
        ];
        let categories = vec!["bread".to_string()];
        let articles = vec!["A".to_string()];
        let once = apply_filters(products, &categories, &articles);
        let twice = apply_filters(once.clone(), &categories, &articles);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_empty_filters_pass_everything() {
        let products = vec![product("1", "a"), product("2", "b")];
        assert_eq!(apply_filters(products, &[], &[]).len(), 2);
    }

    #[test]
    fn test_finalize_truncates_in_source_order() {
        let products: Vec<Product> = (0..10)
            .map(|i| product(&format!("ID{}", i), &format!("Item {}", i)))
            .collect();
        let result = finalize(products, &target(5, &[], &[]));
        let ids: Vec<&str> = result.iter().map(|p| p.identifier.as_str()).collect();
        assert_eq!(ids, vec!["ID0", "ID1", "ID2", "ID3", "ID4"]);
    }

    #[test]
    fn test_finalize_filters_before_truncating() {
        let mut products: Vec<Product> = (0..8).map(|i| product(&format!("X{}", i), "Milk")).collect();
        products.push(product("B1", "Bread one"));
        products.push(product("B2", "Bread two"));
        let result = finalize(products, &target(2, &["bread"], &[]));
        let ids: Vec<&str> = result.iter().map(|p| p.identifier.as_str()).collect();
        assert_eq!(ids, vec!["B1", "B2"]);
    }

    #[test]
    fn test_finalize_dedupes_by_identifier() {
        let products = vec![product("1", "first"), product("1", "dup"), product("2", "second")];
        let result = finalize(products, &target(0, &[], &[]));
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].name, "first");
    }
}
