//! Extraction strategy seams used by the orchestrator.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::SelectorSet;
use crate::target::ScrapeTarget;
use crate::{Marketplace, RawItem, Result};

/// Strategy for waiting until a page is considered ready to read.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum WaitStrategy {
    /// Wait for the page load event only.
    #[default]
    Load,
    /// Wait until network activity settles for the given duration.
    NetworkIdle {
        /// Milliseconds of network inactivity to wait for.
        idle_ms: u64,
    },
    /// Wait until a CSS selector matches an element on the page.
    Selector {
        css: String,
        /// Maximum time to wait in milliseconds before timing out.
        timeout_ms: u64,
    },
    /// Wait a fixed delay after the page load event.
    Delay { ms: u64 },
}

impl WaitStrategy {
    /// Waits for the marketplace's ready selector, or for the network to
    /// settle when none is configured.
    pub fn for_selectors(selectors: &SelectorSet, timeout_ms: u64) -> Self {
        if selectors.ready.trim().is_empty() {
            Self::NetworkIdle { idle_ms: 500 }
        } else {
            Self::Selector {
                css: selectors.ready.clone(),
                timeout_ms,
            }
        }
    }
}

/// Internal data endpoint strategy.
///
/// An endpoint that answers successfully with zero items yields an empty
/// list, not an error.
#[async_trait]
pub trait DirectSource: Send + Sync {
    /// Searches by text, returning at most `limit` items in source order.
    async fn search(&self, marketplace: Marketplace, query: &str, limit: usize)
        -> Result<Vec<RawItem>>;

    /// Looks a product up by article.
    async fn fetch_by_id(&self, marketplace: Marketplace, id: &str) -> Result<Option<RawItem>>;
}

/// What a rendered attempt should read.
#[derive(Debug, Clone)]
pub struct RenderRequest {
    pub target: ScrapeTarget,
    pub selectors: SelectorSet,
    /// Maximum number of cards enumerated on a listing page.
    pub fetch_limit: usize,
    /// 1-based attempt number; retries use a fresh identity and proxy.
    pub attempt: u32,
}

/// Items read from a rendered page plus the cookies the browser ended up with.
#[derive(Debug, Clone, Default)]
pub struct RenderOutput {
    pub items: Vec<RawItem>,
    pub cookies: BTreeMap<String, String>,
}

/// Full browser rendering strategy.
#[async_trait]
pub trait RenderedSource: Send + Sync {
    /// Renders the target and extracts raw items.
    ///
    /// Cancelling `cancel` aborts the attempt; the browser context is released
    /// either way.
    async fn render_and_extract(
        &self,
        request: &RenderRequest,
        cancel: &CancellationToken,
    ) -> Result<RenderOutput>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_strategy_default() {
        assert_eq!(WaitStrategy::default(), WaitStrategy::Load);
    }

    #[test]
    fn test_wait_strategy_for_selectors() {
        let selectors = SelectorSet {
            ready: "article.product-card".to_string(),
            ..Default::default()
        };
        assert_eq!(
            WaitStrategy::for_selectors(&selectors, 5000),
            WaitStrategy::Selector {
                css: "article.product-card".to_string(),
                timeout_ms: 5000
            }
        );
        assert_eq!(
            WaitStrategy::for_selectors(&SelectorSet::default(), 5000),
            WaitStrategy::NetworkIdle { idle_ms: 500 }
        );
    }
}
