//! Marketplace adapter implementations.

pub mod ozon;
pub mod wildberries;

pub use ozon::Ozon;
pub use wildberries::Wildberries;

use url::Url;

use crate::{Marketplace, Result, ScrapeError};

/// Parses a caller-supplied URL and checks that it belongs to `marketplace`.
pub(crate) fn parse_owned_url(marketplace: Marketplace, raw: &str) -> Result<Url> {
    let url = Url::parse(raw.trim())?;
    let host = url.host_str().unwrap_or_default();
    if !marketplace.owns_host(host) {
        return Err(ScrapeError::UnsupportedMarketplace(format!(
            "{} is not a {} URL",
            raw, marketplace
        )));
    }
    Ok(url)
}

/// Parses an absolute URL, or a site-relative path against `site`.
pub(crate) fn resolve(site: &str, raw: &str) -> Option<Url> {
    if raw.starts_with('/') && !raw.starts_with("//") {
        Url::parse(site).ok()?.join(raw).ok()
    } else if let Some(rest) = raw.strip_prefix("//") {
        Url::parse(&format!("https://{}", rest)).ok()
    } else {
        Url::parse(raw).ok()
    }
}

/// Appends query parameters to an endpoint base URL.
pub(crate) fn with_params(base: &str, params: &[(&str, &str)]) -> String {
    let query = params
        .iter()
        .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&");
    let sep = if base.contains('?') { '&' } else { '?' };
    format!("{}{}{}", base, sep, query)
}

/// Rejects blank queries and non-numeric articles.
pub(crate) fn check_article(article: &str) -> Result<&str> {
    let article = article.trim();
    if article.is_empty() || !article.chars().all(|c| c.is_ascii_digit()) {
        return Err(ScrapeError::Parse(format!("invalid article: '{}'", article)));
    }
    Ok(article)
}

pub(crate) fn check_query(query: &str) -> Result<&str> {
    let query = query.trim();
    if query.is_empty() {
        return Err(ScrapeError::Parse("empty search query".to_string()));
    }
    Ok(query)
}
