//! Scrape requests and resolved targets.

use serde::{Deserialize, Serialize};

use crate::Marketplace;

/// Default number of products returned per target.
pub const DEFAULT_LIMIT: usize = 20;

/// What the caller asked to scrape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum TargetInput {
    /// A product or listing URL; its kind is derived from the URL shape.
    Url(String),
    /// A free-text search query.
    Query(String),
    /// A marketplace article (product identifier).
    Article(String),
}

impl TargetInput {
    /// Returns the raw text the caller supplied.
    pub fn raw(&self) -> &str {
        match self {
            Self::Url(s) | Self::Query(s) | Self::Article(s) => s,
        }
    }

    /// Guesses the input type from free text: URLs, bare digit articles, queries.
    pub fn infer(text: impl Into<String>) -> Self {
        let text = text.into();
        let trimmed = text.trim();
        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            Self::Url(trimmed.to_string())
        } else if !trimmed.is_empty() && trimmed.chars().all(|c| c.is_ascii_digit()) {
            Self::Article(trimmed.to_string())
        } else {
            Self::Query(trimmed.to_string())
        }
    }
}

/// Resolved kind of a target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    /// A single product identified by its article.
    ProductPage { article: String },
    /// A listing; `query` is set when the listing is a text search.
    CategorySearch { query: Option<String> },
}

impl TargetKind {
    pub fn is_product(&self) -> bool {
        matches!(self, Self::ProductPage { .. })
    }
}

/// Output of marketplace classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classified {
    pub kind: TargetKind,
    /// Public page the browser renders for this target.
    pub page_url: String,
}

/// A request to scrape one target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeRequest {
    /// Marketplace the target belongs to.
    pub marketplace: Marketplace,
    /// URL, query or article.
    pub target: TargetInput,
    /// Name terms; an item passes when any term matches (case-insensitive).
    #[serde(default)]
    pub category_filter: Vec<String>,
    /// Article terms; an item passes when any term is contained in its identifier.
    #[serde(default)]
    pub article_filter: Vec<String>,
    /// Maximum number of products returned; 0 means no explicit limit.
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    DEFAULT_LIMIT
}

impl ScrapeRequest {
    /// Creates a request with no filters and the default limit.
    pub fn new(marketplace: Marketplace, target: TargetInput) -> Self {
        Self {
            marketplace,
            target,
            category_filter: Vec::new(),
            article_filter: Vec::new(),
            limit: DEFAULT_LIMIT,
        }
    }

    /// Sets the category (name) filter.
    pub fn with_category_filter(mut self, terms: Vec<String>) -> Self {
        self.category_filter = terms;
        self
    }

    /// Sets the article filter.
    pub fn with_article_filter(mut self, terms: Vec<String>) -> Self {
        self.article_filter = terms;
        self
    }

    /// Sets the result limit.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}

/// A classified, immutable target consumed by one orchestration call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrapeTarget {
    /// The URL or query as supplied.
    pub raw: String,
    pub kind: TargetKind,
    /// Public page rendered by the browser strategy.
    pub page_url: String,
    pub marketplace: Marketplace,
    pub category_filter: Vec<String>,
    pub article_filter: Vec<String>,
    pub limit: usize,
}

impl ScrapeTarget {
    /// Builds a target from a request and its classification.
    pub fn new(request: &ScrapeRequest, classified: Classified) -> Self {
        Self {
            raw: request.target.raw().to_string(),
            kind: classified.kind,
            page_url: classified.page_url,
            marketplace: request.marketplace,
            category_filter: clean_terms(&request.category_filter),
            article_filter: clean_terms(&request.article_filter),
            limit: request.limit,
        }
    }

    /// Whether either filter is non-empty.
    pub fn has_filters(&self) -> bool {
        !self.category_filter.is_empty() || !self.article_filter.is_empty()
    }

    /// Number of items to fetch so that filtering sees the full set.
    ///
    /// Always at least `max_fetch`: duplicates and unusable items are only
    /// dropped after fetching, so fetching exactly `limit` can come up short.
    pub fn fetch_limit(&self, max_fetch: usize) -> usize {
        max_fetch.max(self.limit)
    }

    /// Items worth completing before the rest are left as read.
    ///
    /// `None` when every fetched item may matter (filters or no limit).
    pub fn wanted(&self) -> Option<usize> {
        if self.has_filters() || self.limit == 0 {
            None
        } else {
            Some(self.limit)
        }
    }
}

fn clean_terms(terms: &[String]) -> Vec<String> {
    terms
        .iter()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}
