//! DOM extraction from rendered marketplace pages.

use scraper::{ElementRef, Html, Selector};
use tracing::{debug, warn};

use crate::config::{FieldSelectors, SelectorSet};
use crate::{DomFields, RawItem, Result, ScrapeError};

fn selector(css: &str) -> Result<Selector> {
    Selector::parse(css)
        .map_err(|e| ScrapeError::InvalidSelector(format!("{}: {:?}", css, e)))
}

fn optional(css: &Option<String>) -> Result<Option<Selector>> {
    match css.as_deref().map(str::trim) {
        Some(css) if !css.is_empty() => selector(css).map(Some),
        _ => Ok(None),
    }
}

/// Field selectors parsed once per page.
struct FieldQueries {
    name: Option<Selector>,
    price: Option<Selector>,
    old_price: Option<Selector>,
    discount: Option<Selector>,
    stock: Option<Selector>,
    image: Option<Selector>,
    link: Option<Selector>,
    labels: Option<Selector>,
    img: Selector,
}

impl FieldQueries {
    fn compile(fields: &FieldSelectors) -> Result<Self> {
        Ok(Self {
            name: optional(&fields.name)?,
            price: optional(&fields.price)?,
            old_price: optional(&fields.old_price)?,
            discount: optional(&fields.discount)?,
            stock: optional(&fields.stock)?,
            image: optional(&fields.image)?,
            link: optional(&fields.link)?,
            labels: optional(&fields.labels)?,
            img: selector("img")?,
        })
    }

    fn read(&self, scope: ElementRef<'_>) -> DomFields {
        DomFields {
            article: None,
            name: first_text(scope, self.name.as_ref()),
            price: first_text(scope, self.price.as_ref()),
            old_price: first_text(scope, self.old_price.as_ref()),
            discount: first_text(scope, self.discount.as_ref()),
            stock: first_text(scope, self.stock.as_ref()),
            image: self.image(scope),
            link: self.link(scope),
            labels: self
                .labels
                .as_ref()
                .map(|sel| {
                    scope
                        .select(sel)
                        .map(element_text)
                        .filter(|t| !t.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
        }
    }

    fn image(&self, scope: ElementRef<'_>) -> Option<String> {
        let element = scope.select(self.image.as_ref()?).next()?;
        if element.value().name() == "img" {
            return image_source(element);
        }
        element.select(&self.img).find_map(image_source)
    }

    fn link(&self, scope: ElementRef<'_>) -> Option<String> {
        let href = match &self.link {
            Some(sel) => scope.select(sel).next()?.value().attr("href"),
            None if scope.value().name() == "a" => scope.value().attr("href"),
            None => None,
        };
        href.map(str::trim).filter(|h| !h.is_empty()).map(str::to_string)
    }
}

/// Text of an element with whitespace collapsed.
fn element_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

fn first_text(scope: ElementRef<'_>, sel: Option<&Selector>) -> Option<String> {
    scope
        .select(sel?)
        .map(element_text)
        .find(|t| !t.is_empty())
}

fn image_source(img: ElementRef<'_>) -> Option<String> {
    let attrs = img.value();
    attrs
        .attr("src")
        .filter(|s| !s.starts_with("data:"))
        .or_else(|| attrs.attr("data-src"))
        .map(str::to_string)
        .or_else(|| {
            attrs
                .attr("srcset")
                .and_then(|set| set.split(',').next())
                .and_then(|entry| entry.split_whitespace().next())
                .map(str::to_string)
        })
        .filter(|s| !s.is_empty())
}

/// Reads up to `limit` item cards from a listing page, in page order.
/// A `limit` of 0 reads every card.
///
/// Cards missing a field are still returned; the normalizer decides whether
/// they are usable.
pub fn extract_cards(
    html: &str,
    selectors: &SelectorSet,
    limit: usize,
    page_url: &str,
) -> Result<Vec<RawItem>> {
    let document = Html::parse_document(html);
    let card = selector(&selectors.card)?;
    let queries = FieldQueries::compile(&selectors.list)?;
    let take = if limit == 0 { usize::MAX } else { limit };

    let mut items = Vec::new();
    let mut incomplete = 0;
    for element in document.select(&card).take(take) {
        let mut fields = queries.read(element);
        if let Some(attr) = &selectors.card_id_attr {
            fields.article = element
                .value()
                .attr(attr)
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .map(str::to_string);
        }
        if !fields.has_required() {
            incomplete += 1;
        }
        items.push(RawItem::dom(fields).with_page_url(page_url));
    }

    if incomplete > 0 {
        warn!(
            "{} of {} cards on {} are missing required fields",
            incomplete,
            items.len(),
            page_url
        );
    }
    debug!("Extracted {} cards from {}", items.len(), page_url);
    Ok(items)
}

/// Reads a product page. Returns `None` when neither a name nor a price is
/// present.
pub fn extract_product(
    html: &str,
    selectors: &SelectorSet,
    page_url: &str,
) -> Result<Option<RawItem>> {
    let document = Html::parse_document(html);
    let queries = FieldQueries::compile(&selectors.product)?;
    let fields = queries.read(document.root_element());

    if fields.name.is_none() && fields.price.is_none() {
        return Ok(None);
    }
    if fields.name.is_none() || fields.price.is_none() {
        warn!("Product page {} is missing its name or price", page_url);
    }
    Ok(Some(RawItem::dom(fields).with_page_url(page_url)))
}

/// Fills a listing card's gaps with fields read from its product page.
///
/// Page values win where present; the card keeps its article and link.
pub fn merge_fields(card: DomFields, page: DomFields) -> DomFields {
    DomFields {
        article: card.article.or(page.article),
        name: page.name.or(card.name),
        price: page.price.or(card.price),
        old_price: page.old_price.or(card.old_price),
        discount: page.discount.or(card.discount),
        stock: page.stock.or(card.stock),
        image: page.image.or(card.image),
        link: card.link.or(page.link),
        labels: if page.labels.is_empty() {
            card.labels
        } else {
            page.labels
        },
    }
}

/// Returns the first challenge marker found in the body, compared case-insensitively.
pub fn detect_challenge(body: &str, markers: &[String]) -> Option<String> {
    let lower = body.to_lowercase();
    markers
        .iter()
        .find(|m| !m.is_empty() && lower.contains(&m.to_lowercase()))
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marketplaces::{Ozon, Wildberries};
    use crate::{MarketplaceAdapter, RawPayload};

    const LISTING: &str = r#"
        <html><body>
          <article class="product-card" data-nm-id="101">
            <a class="product-card__link" href="/catalog/101/detail.aspx"></a>
            <img src="https://basket-01.wbbasket.ru/vol1/part101/101/images/c246x328/1.webp">
            <span class="product-card__name">  Хлебцы
              ржаные </span>
            <ins class="price__lower-price">89 ₽</ins>
            <del>120 ₽</del>
            <p class="product-card__tip">Хит</p>
            <p class="product-card__tip">Акция</p>
          </article>
          <article class="product-card" data-nm-id="102">
            <a class="product-card__link" href="/catalog/102/detail.aspx"></a>
            <span class="product-card__name">Хлебцы гречневые</span>
          </article>
          <article class="product-card" data-nm-id="103">
            <span class="product-card__name">Хлебцы овсяные</span>
            <ins class="price__lower-price">75 ₽</ins>
          </article>
        </body></html>
    "#;

    fn dom(item: &RawItem) -> &DomFields {
        match &item.payload {
            RawPayload::Dom(fields) => fields,
            other => panic!("expected DOM payload, got {:?}", other),
        }
    }

    #[test]
    fn test_extract_cards_in_page_order() {
        let selectors = Wildberries::new().selectors().clone();
        let items = extract_cards(LISTING, &selectors, 0, "https://www.wildberries.ru/x").unwrap();
        assert_eq!(items.len(), 3);

        let first = dom(&items[0]);
        assert_eq!(first.article.as_deref(), Some("101"));
        assert_eq!(first.name.as_deref(), Some("Хлебцы ржаные"));
        assert_eq!(first.price.as_deref(), Some("89 ₽"));
        assert_eq!(first.link.as_deref(), Some("/catalog/101/detail.aspx"));
        assert_eq!(first.labels, vec!["Хит".to_string(), "Акция".to_string()]);
        assert!(first.image.as_deref().unwrap().ends_with("1.webp"));
        assert_eq!(items[0].page_url.as_deref(), Some("https://www.wildberries.ru/x"));

        // Missing fields do not drop the card.
        assert_eq!(dom(&items[1]).price, None);
        assert_eq!(dom(&items[2]).article.as_deref(), Some("103"));
    }

    #[test]
    fn test_extract_cards_respects_limit() {
        let selectors = Wildberries::new().selectors().clone();
        let items = extract_cards(LISTING, &selectors, 2, "https://www.wildberries.ru/x").unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(dom(&items[1]).article.as_deref(), Some("102"));
    }

    #[test]
    fn test_extract_cards_no_matches() {
        let selectors = Ozon::new().selectors().clone();
        let items = extract_cards("<html><body></body></html>", &selectors, 10, "u").unwrap();
        assert!(items.is_empty());
    }

    #[test]
    fn test_invalid_selector() {
        let selectors = SelectorSet {
            card: "div[".to_string(),
            ..Default::default()
        };
        let err = extract_cards("<html></html>", &selectors, 0, "u").unwrap_err();
        assert!(matches!(err, ScrapeError::InvalidSelector(_)));
    }

    #[test]
    fn test_card_link_falls_back_to_anchor_card() {
        let selectors = SelectorSet {
            card: "a.tile".to_string(),
            list: FieldSelectors {
                name: Some("span".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let html = r#"<a class="tile" href="/product/bread-42/"><span>Bread</span></a>"#;
        let items = extract_cards(html, &selectors, 0, "u").unwrap();
        assert_eq!(dom(&items[0]).link.as_deref(), Some("/product/bread-42/"));
    }

    #[test]
    fn test_image_from_lazy_attributes() {
        let selectors = SelectorSet {
            card: "div.c".to_string(),
            list: FieldSelectors {
                image: Some("div.pic".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let html = r#"
            <div class="c"><div class="pic"><img src="data:image/gif;base64,R0" data-src="/a.jpg"></div></div>
            <div class="c"><div class="pic"><img srcset="/b-1x.jpg 1x, /b-2x.jpg 2x"></div></div>
        "#;
        let items = extract_cards(html, &selectors, 0, "u").unwrap();
        assert_eq!(dom(&items[0]).image.as_deref(), Some("/a.jpg"));
        assert_eq!(dom(&items[1]).image.as_deref(), Some("/b-1x.jpg"));
    }

    #[test]
    fn test_extract_product() {
        let selectors = Wildberries::new().selectors().clone();
        let html = r#"
            <h1 class="product-page__title">Хлебцы ржаные</h1>
            <ins class="price-block__final-price">89&nbsp;₽</ins>
            <del class="price-block__old-price">120 ₽</del>
        "#;
        let item = extract_product(html, &selectors, "https://www.wildberries.ru/catalog/101/detail.aspx")
            .unwrap()
            .unwrap();
        let fields = dom(&item);
        assert_eq!(fields.name.as_deref(), Some("Хлебцы ржаные"));
        assert_eq!(fields.old_price.as_deref(), Some("120 ₽"));
    }

    #[test]
    fn test_extract_product_empty_page() {
        let selectors = Wildberries::new().selectors().clone();
        let item = extract_product("<html><body>Not found</body></html>", &selectors, "u").unwrap();
        assert!(item.is_none());
    }

    #[test]
    fn test_merge_fields() {
        let card = DomFields {
            name: Some("Хлебцы ржан...".into()),
            price: Some("89 ₽".into()),
            link: Some("/product/hlebtsy-42/".into()),
            labels: vec!["Хит".into()],
            ..Default::default()
        };
        let page = DomFields {
            name: Some("Хлебцы ржаные цельнозерновые".into()),
            stock: Some("Осталось 3 шт".into()),
            ..Default::default()
        };
        let merged = merge_fields(card, page);
        assert_eq!(merged.name.as_deref(), Some("Хлебцы ржаные цельнозерновые"));
        assert_eq!(merged.price.as_deref(), Some("89 ₽"));
        assert_eq!(merged.stock.as_deref(), Some("Осталось 3 шт"));
        assert_eq!(merged.link.as_deref(), Some("/product/hlebtsy-42/"));
        assert_eq!(merged.labels, vec!["Хит".to_string()]);
    }

    #[test]
    fn test_detect_challenge() {
        let markers = vec!["почти готово".to_string(), "captcha".to_string()];
        assert_eq!(
            detect_challenge("<title>Почти готово...</title>", &markers).as_deref(),
            Some("почти готово")
        );
        assert_eq!(
            detect_challenge("<div id=\"CAPTCHA\"></div>", &markers).as_deref(),
            Some("captcha")
        );
        assert_eq!(detect_challenge("<html>ok</html>", &markers), None);
        assert_eq!(detect_challenge("anything", &[]), None);
    }
}
