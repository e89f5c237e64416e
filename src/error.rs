//! Error types for the extraction engine.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for scrape operations.
pub type Result<T> = std::result::Result<T, ScrapeError>;

/// Coarse classification of a failure, reported to callers per target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Connection failure, timeout or unexpected HTTP status.
    NetworkError,
    /// A captcha or JS-challenge page was served instead of content.
    AntiBotChallenge,
    /// The endpoint kept answering 429 after all retries.
    RateLimited,
    /// Browser-driven challenge solving did not produce a session.
    SessionRefreshFailed,
    /// A whole item (or payload) could not be read.
    ParseError,
    /// The marketplace is unknown or the target does not belong to it.
    UnsupportedMarketplace,
    /// The browser process or a CDP command failed.
    Browser,
    /// The caller cancelled the scrape.
    Cancelled,
}

/// Errors that can occur while scraping a target.
#[derive(Error, Debug)]
pub enum ScrapeError {
    /// HTTP request failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Endpoint answered with a status that is neither success nor retryable.
    #[error("Unexpected HTTP status {status} from {url}")]
    Status { status: u16, url: String },

    /// A network operation exceeded its deadline.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Anti-bot challenge detected.
    #[error("Anti-bot challenge detected: {0}")]
    AntiBotChallenge(String),

    /// Backoff exhausted on 429 responses.
    #[error("Rate limited after {attempts} attempts: {url}")]
    RateLimited { attempts: u32, url: String },

    /// Session refresh through the browser failed.
    #[error("Session refresh failed for {marketplace}: {reason}")]
    SessionRefreshFailed { marketplace: String, reason: String },

    /// Failed to parse a payload or a whole item.
    #[error("Failed to parse response: {0}")]
    Parse(String),

    /// A configured CSS selector is not valid.
    #[error("Invalid selector '{0}'")]
    InvalidSelector(String),

    /// JSON decoding error.
    #[error("JSON decoding failed: {0}")]
    Json(#[from] serde_json::Error),

    /// URL parsing error.
    #[error("URL parsing error: {0}")]
    UrlParse(#[from] url::ParseError),

    /// Unknown marketplace or foreign target.
    #[error("Unsupported marketplace: {0}")]
    UnsupportedMarketplace(String),

    /// Browser launch or CDP failure.
    #[error("Browser error: {0}")]
    Browser(String),

    /// Scrape cancelled by the caller.
    #[error("Scrape cancelled")]
    Cancelled,

    /// Generic error.
    #[error("{0}")]
    Other(String),
}

impl ScrapeError {
    /// Returns the taxonomy kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Http(e) if e.is_decode() => ErrorKind::ParseError,
            Self::Http(_) | Self::Status { .. } | Self::Timeout(_) | Self::Other(_) => {
                ErrorKind::NetworkError
            }
            Self::AntiBotChallenge(_) => ErrorKind::AntiBotChallenge,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::SessionRefreshFailed { .. } => ErrorKind::SessionRefreshFailed,
            Self::Parse(_) | Self::InvalidSelector(_) | Self::Json(_) | Self::UrlParse(_) => {
                ErrorKind::ParseError
            }
            Self::UnsupportedMarketplace(_) => ErrorKind::UnsupportedMarketplace,
            Self::Browser(_) => ErrorKind::Browser,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Whether a direct-endpoint failure should hand the target to the browser.
    pub fn falls_back(&self) -> bool {
        !matches!(
            self.kind(),
            ErrorKind::Cancelled | ErrorKind::UnsupportedMarketplace
        )
    }
}
