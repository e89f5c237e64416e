//! Strategy orchestration.
//!
//! One call to [`Orchestrator::scrape`] runs the whole state machine for a
//! single target:
//!
//! ```text
//! Init -> ClassifyTarget -> DirectAttempt -> Normalize
//!                                 |  empty or failed
//!                                 v
//!                           BrowserAttempt -> Normalize
//!                                 |
//!                                 v
//!                               Failed
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::normalize::{finalize, normalize_all};
use crate::session::SessionStore;
use crate::source::{DirectSource, RenderRequest, RenderedSource};
use crate::timing::{Clock, SystemClock};
use crate::{
    ExtractionSource, Marketplace, MarketplaceAdapter, RawItem, Result, ScrapeError,
    ScrapeRequest, ScrapeResult, ScrapeTarget, TargetFailure, TargetKind, TargetOutcome,
};

/// Browser attempts per target; an anti-bot challenge earns one retry.
const BROWSER_ATTEMPTS: u32 = 2;

/// States of one orchestration run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Init,
    ClassifyTarget,
    DirectAttempt,
    BrowserAttempt,
    Normalize,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "Init",
            Self::ClassifyTarget => "ClassifyTarget",
            Self::DirectAttempt => "DirectAttempt",
            Self::BrowserAttempt => "BrowserAttempt",
            Self::Normalize => "Normalize",
            Self::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// Extraction engine that runs the direct and rendered strategies per target.
pub struct Orchestrator {
    adapters: HashMap<Marketplace, Arc<dyn MarketplaceAdapter>>,
    direct: Option<Arc<dyn DirectSource>>,
    rendered: Option<Arc<dyn RenderedSource>>,
    sessions: Option<Arc<SessionStore>>,
    clock: Arc<dyn Clock>,
    max_fetch: usize,
    concurrency: usize,
}

impl Orchestrator {
    /// Creates an orchestrator with no adapters and no strategies.
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
            direct: None,
            rendered: None,
            sessions: None,
            clock: Arc::new(SystemClock),
            max_fetch: 100,
            concurrency: 4,
        }
    }

    /// Builds the full engine from configuration.
    ///
    /// With the `headless` feature the rendered strategy also refreshes
    /// sessions; without it only the direct strategy is wired, sessionless.
    pub fn from_config(
        config: &crate::ScraperConfig,
        dump: Option<Arc<dyn crate::dump::HtmlDump>>,
    ) -> Self {
        use crate::direct::DirectClient;
        use crate::identity::IdentityPool;
        use crate::marketplaces::{Ozon, Wildberries};
        use crate::proxy::ProxyPool;

        let adapters: Vec<Arc<dyn MarketplaceAdapter>> = vec![
            Arc::new(
                config
                    .marketplace(Marketplace::Ozon)
                    .cloned()
                    .map(Ozon::with_settings)
                    .unwrap_or_default(),
            ),
            Arc::new(
                config
                    .marketplace(Marketplace::Wildberries)
                    .cloned()
                    .map(Wildberries::with_settings)
                    .unwrap_or_default(),
            ),
        ];
        let proxies = Arc::new(ProxyPool::new(config.proxy.clone()));
        let identities = IdentityPool::new(config.identity.clone());

        let mut orchestrator = Self::new();
        for adapter in &adapters {
            orchestrator.adapters.insert(adapter.marketplace(), adapter.clone());
        }
        orchestrator.set_max_fetch(config.max_fetch);
        orchestrator.set_concurrency(config.concurrency);

        let mut direct = DirectClient::new(adapters.clone())
            .with_proxies(proxies.clone())
            .with_identities(identities.clone())
            .with_retry(config.retry)
            .with_timeout(config.timeouts.request());
        if let Some(dump) = &dump {
            direct = direct.with_dump(dump.clone());
        }

        #[cfg(feature = "headless")]
        {
            use crate::browser::{BrowserPool, RenderedClient};

            let pool = Arc::new(BrowserPool::new(config.browser.clone()));
            let mut rendered = RenderedClient::new(pool, adapters)
                .with_proxies(proxies)
                .with_identities(identities)
                .with_emulation(config.emulation.clone())
                .with_timeouts(config.timeouts);
            if let Some(dump) = &dump {
                rendered = rendered.with_dump(dump.clone());
            }
            let rendered = Arc::new(rendered);
            let sessions = Arc::new(
                SessionStore::new(rendered.clone(), config.session_ttls())
                    .with_cooldown(config.timeouts.refresh_cooldown()),
            );
            direct = direct.with_sessions(sessions.clone());
            orchestrator.set_rendered(rendered);
            orchestrator.set_sessions(sessions);
        }
        #[cfg(not(feature = "headless"))]
        {
            let _ = (adapters, proxies, identities);
        }

        orchestrator.set_direct(Arc::new(direct));
        orchestrator
    }

    /// Registers a marketplace adapter, replacing any for the same marketplace.
    pub fn add_adapter<A: MarketplaceAdapter + 'static>(&mut self, adapter: A) {
        self.adapters.insert(adapter.marketplace(), Arc::new(adapter));
    }

    pub fn set_direct(&mut self, direct: Arc<dyn DirectSource>) {
        self.direct = Some(direct);
    }

    pub fn set_rendered(&mut self, rendered: Arc<dyn RenderedSource>) {
        self.rendered = Some(rendered);
    }

    /// Session store that receives cookies harvested by rendered attempts.
    pub fn set_sessions(&mut self, sessions: Arc<SessionStore>) {
        self.sessions = Some(sessions);
    }

    pub fn set_clock(&mut self, clock: Arc<dyn Clock>) {
        self.clock = clock;
    }

    /// Items fetched before filtering when a target has filters.
    pub fn set_max_fetch(&mut self, max_fetch: usize) {
        self.max_fetch = max_fetch;
    }

    /// Targets scraped at once by [`scrape_batch`](Self::scrape_batch).
    pub fn set_concurrency(&mut self, concurrency: usize) {
        self.concurrency = concurrency.max(1);
    }

    pub fn sessions(&self) -> Option<&Arc<SessionStore>> {
        self.sessions.as_ref()
    }

    /// Marketplaces with a registered adapter.
    pub fn marketplaces(&self) -> Vec<Marketplace> {
        Marketplace::ALL
            .iter()
            .copied()
            .filter(|m| self.adapters.contains_key(m))
            .collect()
    }

    /// Adapter for a marketplace.
    pub fn adapter(&self, marketplace: Marketplace) -> Result<&Arc<dyn MarketplaceAdapter>> {
        self.adapters
            .get(&marketplace)
            .ok_or_else(|| ScrapeError::UnsupportedMarketplace(marketplace.to_string()))
    }

    /// Scrapes one target.
    pub async fn scrape(
        &self,
        request: &ScrapeRequest,
        cancel: &CancellationToken,
    ) -> Result<ScrapeResult> {
        let result = self.run(request, cancel).await;
        if let Err(e) = &result {
            debug!(
                "{} {} -> {}: {}",
                request.marketplace,
                request.target.raw(),
                Stage::Failed,
                e
            );
        }
        result
    }

    async fn run(&self, request: &ScrapeRequest, cancel: &CancellationToken) -> Result<ScrapeResult> {
        let marketplace = request.marketplace;
        debug!("{} {} -> {}", marketplace, request.target.raw(), Stage::Init);
        if cancel.is_cancelled() {
            return Err(ScrapeError::Cancelled);
        }

        debug!("{} {} -> {}", marketplace, request.target.raw(), Stage::ClassifyTarget);
        let adapter = self.adapter(marketplace)?;
        let target = ScrapeTarget::new(request, adapter.classify(&request.target)?);
        let fetch_limit = target.fetch_limit(self.max_fetch);
        let captured_at = self.clock.now();

        let mut direct_error = None;
        let mut direct_ran = false;
        match &self.direct {
            Some(direct) if adapter.supports_direct(&target.kind) => {
                debug!("{} {} -> {}", marketplace, target.raw, Stage::DirectAttempt);
                direct_ran = true;
                match self.direct_attempt(direct.as_ref(), &target, fetch_limit, cancel).await {
                    Ok(items) if !items.is_empty() => {
                        debug!("{} {} -> {}", marketplace, target.raw, Stage::Normalize);
                        let products = normalize_all(&items, marketplace, captured_at);
                        if !products.is_empty() {
                            let products = finalize(products, &target);
                            info!(
                                "{} {}: {} products via direct endpoint",
                                marketplace,
                                target.raw,
                                products.len()
                            );
                            return Ok(ScrapeResult::new(products, ExtractionSource::Direct));
                        }
                        warn!(
                            "{} {}: no usable direct items, falling back to browser",
                            marketplace, target.raw
                        );
                    }
                    Ok(_) => debug!(
                        "{} {}: direct endpoint returned nothing, falling back to browser",
                        marketplace, target.raw
                    ),
                    Err(e) if e.falls_back() => {
                        warn!(
                            "{} {}: direct endpoint failed, falling back to browser: {}",
                            marketplace, target.raw, e
                        );
                        direct_error = Some(e);
                    }
                    Err(e) => return Err(e),
                }
            }
            _ => debug!(
                "{} {}: no usable data endpoint, skipping {}",
                marketplace,
                target.raw,
                Stage::DirectAttempt
            ),
        }

        let Some(rendered) = &self.rendered else {
            return match direct_error {
                Some(e) => Err(e),
                None if direct_ran => Ok(ScrapeResult {
                    products: Vec::new(),
                    source: Some(ExtractionSource::Direct),
                }),
                None => Err(ScrapeError::Browser(
                    "No rendered strategy configured".to_string(),
                )),
            };
        };

        let items = self
            .browser_attempt(rendered.as_ref(), adapter.as_ref(), &target, fetch_limit, cancel)
            .await?;

        debug!("{} {} -> {}", marketplace, target.raw, Stage::Normalize);
        let products = normalize_all(&items, marketplace, captured_at);
        if products.is_empty() && target.kind.is_product() {
            return Err(ScrapeError::Parse(format!(
                "No usable product data on {}",
                target.page_url
            )));
        }
        let products = finalize(products, &target);
        info!(
            "{} {}: {} products via browser",
            marketplace,
            target.raw,
            products.len()
        );
        Ok(ScrapeResult::new(products, ExtractionSource::Rendered))
    }

    async fn direct_attempt(
        &self,
        direct: &dyn DirectSource,
        target: &ScrapeTarget,
        fetch_limit: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<RawItem>> {
        let attempt = async {
            match &target.kind {
                TargetKind::ProductPage { article } => direct
                    .fetch_by_id(target.marketplace, article)
                    .await
                    .map(|item| item.into_iter().collect()),
                TargetKind::CategorySearch { query: Some(query) } => {
                    direct.search(target.marketplace, query, fetch_limit).await
                }
                TargetKind::CategorySearch { query: None } => Ok(Vec::new()),
            }
        };
        tokio::select! {
            _ = cancel.cancelled() => Err(ScrapeError::Cancelled),
            items = attempt => items,
        }
    }

    async fn browser_attempt(
        &self,
        rendered: &dyn RenderedSource,
        adapter: &dyn MarketplaceAdapter,
        target: &ScrapeTarget,
        fetch_limit: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<RawItem>> {
        let mut attempt = 1;
        loop {
            debug!(
                "{} {} -> {} (attempt {})",
                target.marketplace,
                target.raw,
                Stage::BrowserAttempt,
                attempt
            );
            let request = RenderRequest {
                target: target.clone(),
                selectors: adapter.selectors().clone(),
                fetch_limit,
                attempt,
            };
            match rendered.render_and_extract(&request, cancel).await {
                Ok(output) => {
                    if adapter.config().use_session {
                        if let Some(sessions) = &self.sessions {
                            sessions.absorb(target.marketplace, output.cookies).await;
                        }
                    }
                    return Ok(output.items);
                }
                Err(ScrapeError::AntiBotChallenge(reason)) if attempt < BROWSER_ATTEMPTS => {
                    warn!(
                        "{} {}: challenge during render ({}), retrying with a fresh identity",
                        target.marketplace, target.raw, reason
                    );
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Scrapes many targets concurrently.
    ///
    /// Returns one outcome per request, in input order. A failed target never
    /// affects its siblings.
    pub async fn scrape_batch(
        &self,
        requests: Vec<ScrapeRequest>,
        cancel: &CancellationToken,
    ) -> Vec<TargetOutcome> {
        stream::iter(requests)
            .map(|request| async move {
                let outcome = self.scrape(&request, cancel).await.map_err(|e| {
                    warn!("{} {} failed: {}", request.marketplace, request.target.raw(), e);
                    TargetFailure::from(&e)
                });
                TargetOutcome { request, outcome }
            })
            .buffered(self.concurrency)
            .collect()
            .await
    }
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marketplaces::{Ozon, Wildberries};
    use crate::session::SessionRefresher;
    use crate::source::RenderOutput;
    use crate::{ErrorKind, TargetInput};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingDirect {
        items: Vec<RawItem>,
        limits: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl DirectSource for RecordingDirect {
        async fn search(&self, _m: Marketplace, _q: &str, limit: usize) -> Result<Vec<RawItem>> {
            self.limits.lock().unwrap().push(limit);
            Ok(self.items.iter().take(limit).cloned().collect())
        }

        async fn fetch_by_id(&self, _m: Marketplace, _id: &str) -> Result<Option<RawItem>> {
            Ok(self.items.first().cloned())
        }
    }

    struct CookieRendered;

    #[async_trait]
    impl RenderedSource for CookieRendered {
        async fn render_and_extract(
            &self,
            _request: &RenderRequest,
            _cancel: &CancellationToken,
        ) -> Result<RenderOutput> {
            Ok(RenderOutput {
                items: Vec::new(),
                cookies: BTreeMap::from([("x_wbaas_token".to_string(), "fresh".to_string())]),
            })
        }
    }

    struct NeverRefresh;

    #[async_trait]
    impl SessionRefresher for NeverRefresh {
        async fn refresh(&self, m: Marketplace) -> Result<BTreeMap<String, String>> {
            Err(ScrapeError::SessionRefreshFailed {
                marketplace: m.to_string(),
                reason: "unused".into(),
            })
        }
    }

    fn wb_item(id: u64) -> RawItem {
        RawItem::json(json!({"id": id, "name": format!("Хлебцы {}", id), "salePriceU": 8900}))
    }

    #[test]
    fn test_stage_display() {
        assert_eq!(Stage::DirectAttempt.to_string(), "DirectAttempt");
        assert_eq!(Stage::Failed.to_string(), "Failed");
    }

    #[test]
    fn test_marketplaces_lists_registered_adapters() {
        let mut orchestrator = Orchestrator::new();
        assert!(orchestrator.marketplaces().is_empty());
        orchestrator.add_adapter(Wildberries::new());
        assert_eq!(orchestrator.marketplaces(), vec![Marketplace::Wildberries]);
        orchestrator.add_adapter(Ozon::new());
        assert_eq!(orchestrator.marketplaces().len(), 2);
    }

    #[tokio::test]
    async fn test_direct_fetch_covers_dropped_items() {
        let direct = Arc::new(RecordingDirect {
            items: (1..=30).map(wb_item).collect(),
            ..Default::default()
        });
        let mut orchestrator = Orchestrator::new();
        orchestrator.add_adapter(Wildberries::new());
        orchestrator.set_direct(direct.clone());
        orchestrator.set_max_fetch(50);

        let cancel = CancellationToken::new();
        let plain = ScrapeRequest::new(Marketplace::Wildberries, TargetInput::Query("хлебцы".into()))
            .with_limit(5);
        let result = orchestrator.scrape(&plain, &cancel).await.unwrap();
        assert_eq!(result.len(), 5);

        let filtered = plain.clone().with_article_filter(vec!["2".into()]);
        let result = orchestrator.scrape(&filtered, &cancel).await.unwrap();
        // 2, 12, 20..=29 all contain "2"; truncated after filtering.
        assert_eq!(result.len(), 5);
        assert_eq!(result.products[0].identifier, "2");
        assert_eq!(result.products[1].identifier, "12");

        assert_eq!(*direct.limits.lock().unwrap(), vec![50, 50]);
    }

    #[tokio::test]
    async fn test_limit_counts_usable_unique_products() {
        let mut items = vec![wb_item(1), wb_item(1), RawItem::json(json!({"id": 99, "name": "No price"}))];
        items.extend((2..=8).map(wb_item));
        let direct = Arc::new(RecordingDirect {
            items,
            ..Default::default()
        });
        let mut orchestrator = Orchestrator::new();
        orchestrator.add_adapter(Wildberries::new());
        orchestrator.set_direct(direct);

        let request = ScrapeRequest::new(Marketplace::Wildberries, TargetInput::Query("хлебцы".into()))
            .with_limit(5);
        let result = orchestrator
            .scrape(&request, &CancellationToken::new())
            .await
            .unwrap();
        let ids: Vec<&str> = result.products.iter().map(|p| p.identifier.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3", "4", "5"]);
    }

    #[tokio::test]
    async fn test_empty_direct_without_browser_is_empty_result() {
        let mut orchestrator = Orchestrator::new();
        orchestrator.add_adapter(Wildberries::new());
        orchestrator.set_direct(Arc::new(RecordingDirect::default()));

        let request = ScrapeRequest::new(Marketplace::Wildberries, TargetInput::Query("x".into()));
        let result = orchestrator
            .scrape(&request, &CancellationToken::new())
            .await
            .unwrap();
        assert!(result.is_empty());
        assert_eq!(result.source, Some(ExtractionSource::Direct));
    }

    #[tokio::test]
    async fn test_no_strategy_for_target() {
        let mut orchestrator = Orchestrator::new();
        orchestrator.add_adapter(Wildberries::new());
        let request = ScrapeRequest::new(
            Marketplace::Wildberries,
            TargetInput::Url("https://www.wildberries.ru/catalog/pitanie/hleb".into()),
        );
        let err = orchestrator
            .scrape(&request, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Browser);
    }

    #[tokio::test]
    async fn test_rendered_cookies_are_absorbed() {
        let sessions = Arc::new(SessionStore::new(Arc::new(NeverRefresh), HashMap::new()));
        let mut orchestrator = Orchestrator::new();
        orchestrator.add_adapter(Wildberries::new());
        orchestrator.set_rendered(Arc::new(CookieRendered));
        orchestrator.set_sessions(sessions.clone());

        let request = ScrapeRequest::new(
            Marketplace::Wildberries,
            TargetInput::Url("https://www.wildberries.ru/catalog/elektronika".into()),
        );
        let result = orchestrator
            .scrape(&request, &CancellationToken::new())
            .await
            .unwrap();
        assert!(result.is_empty());

        let session = sessions.peek(Marketplace::Wildberries).await.unwrap();
        assert_eq!(session.cookies.get("x_wbaas_token").map(String::as_str), Some("fresh"));
    }

    #[tokio::test]
    async fn test_unregistered_marketplace() {
        let orchestrator = Orchestrator::new();
        let request = ScrapeRequest::new(Marketplace::Ozon, TargetInput::Query("x".into()));
        let err = orchestrator
            .scrape(&request, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedMarketplace);
    }

    #[test]
    fn test_from_config_wires_both_marketplaces() {
        let orchestrator = Orchestrator::from_config(&crate::ScraperConfig::default(), None);
        assert_eq!(orchestrator.marketplaces().len(), 2);
        assert!(orchestrator.direct.is_some());
        #[cfg(feature = "headless")]
        {
            assert!(orchestrator.rendered.is_some());
            assert!(orchestrator.sessions().is_some());
        }
    }
}
