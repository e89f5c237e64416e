//! Rendered-browser extraction over Chrome/Chromium.
//!
//! This module is only available when the `headless` Cargo feature is enabled.
//! One browser process is shared; every attempt gets its own incognito
//! context with a fresh identity and, optionally, its own proxy. The context
//! is disposed on every exit path.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::emulation::{
    SetDeviceMetricsOverrideParams, SetLocaleOverrideParams, SetTimezoneOverrideParams,
};
use chromiumoxide::cdp::browser_protocol::input::{DispatchMouseEventParams, DispatchMouseEventType};
use chromiumoxide::cdp::browser_protocol::network::SetUserAgentOverrideParams;
use chromiumoxide::cdp::browser_protocol::page::AddScriptToEvaluateOnNewDocumentParams;
use chromiumoxide::cdp::browser_protocol::browser::BrowserContextId;
use chromiumoxide::cdp::browser_protocol::target::{
    CreateBrowserContextParams, CreateTargetParams, DisposeBrowserContextParams,
};
use chromiumoxide::Page;
use futures::StreamExt;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{BrowserSettings, SelectorSet, Timeouts};
use crate::dump::HtmlDump;
use crate::emulation::{EmulationPlan, EmulationSettings, Gesture};
use crate::extract::{detect_challenge, extract_cards, extract_product, merge_fields};
use crate::identity::{Identity, IdentityPool};
use crate::marketplace::MarketplaceAdapter;
use crate::proxy::{ProxyEndpoint, ProxyPool};
use crate::session::SessionRefresher;
use crate::source::{RenderOutput, RenderRequest, RenderedSource, WaitStrategy};
use crate::timing::{Sleeper, TokioSleeper};
use crate::{Marketplace, RawItem, RawPayload, Result, ScrapeError, TargetKind};

/// Hides the usual automation tells before any page script runs.
const STEALTH_SCRIPT: &str = r#"
Object.defineProperty(navigator, 'webdriver', { get: () => undefined });
Object.defineProperty(navigator, 'plugins', { get: () => [1, 2, 3, 4, 5] });
window.chrome = window.chrome || { runtime: {} };
const originalQuery = window.navigator.permissions && window.navigator.permissions.query;
if (originalQuery) {
  window.navigator.permissions.query = (parameters) =>
    parameters.name === 'notifications'
      ? Promise.resolve({ state: Notification.permission })
      : originalQuery(parameters);
}
"#;

/// Interval between content reads while a challenge page is showing.
const CHALLENGE_POLL: Duration = Duration::from_secs(1);

fn cdp_error(context: &str, e: impl std::fmt::Display) -> ScrapeError {
    ScrapeError::Browser(format!("{}: {}", context, e))
}

/// Waits for a page event, giving up quietly after `limit`.
///
/// Returns whether the event completed successfully.
async fn settle_within<T, E, F>(limit: Duration, event: F) -> bool
where
    E: std::fmt::Display,
    F: Future<Output = std::result::Result<T, E>>,
{
    match tokio::time::timeout(limit, event).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            debug!("Page wait failed: {}", e);
            false
        }
        Err(_) => {
            debug!("Page event not seen within {:?}", limit);
            false
        }
    }
}

/// Reads content until no challenge marker shows, polling within `budget`.
async fn await_clearance<F, Fut>(
    sleeper: &dyn Sleeper,
    budget: Duration,
    marketplace: Marketplace,
    markers: &[String],
    mut read: F,
) -> Result<String>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<String>>,
{
    let polls = budget.as_millis() / CHALLENGE_POLL.as_millis();
    let mut waited = 0;
    loop {
        let html = read().await?;
        let Some(marker) = detect_challenge(&html, markers) else {
            return Ok(html);
        };
        if waited >= polls {
            return Err(ScrapeError::AntiBotChallenge(format!(
                "{} challenge did not clear ({})",
                marketplace, marker
            )));
        }
        debug!("{} challenge showing ({}), waiting", marketplace, marker);
        sleeper.sleep(CHALLENGE_POLL).await;
        waited += 1;
    }
}

/// A shared browser process with a bound on concurrently open contexts.
///
/// The browser is lazily launched on the first `acquire_browser()` call.
pub struct BrowserPool {
    settings: BrowserSettings,
    browser: Mutex<Option<Arc<Browser>>>,
    contexts: Arc<Semaphore>,
}

impl BrowserPool {
    pub fn new(settings: BrowserSettings) -> Self {
        let max_contexts = settings.max_contexts.max(1);
        Self {
            settings,
            browser: Mutex::new(None),
            contexts: Arc::new(Semaphore::new(max_contexts)),
        }
    }

    pub fn settings(&self) -> &BrowserSettings {
        &self.settings
    }

    /// Contexts that can still be opened without waiting.
    pub fn available_contexts(&self) -> usize {
        self.contexts.available_permits()
    }

    async fn permit(&self) -> Result<OwnedSemaphorePermit> {
        self.contexts
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| cdp_error("Context semaphore closed", e))
    }

    /// Lazily launches the browser and returns a shared handle.
    pub async fn acquire_browser(&self) -> Result<Arc<Browser>> {
        let mut guard = self.browser.lock().await;

        if let Some(ref browser) = *guard {
            return Ok(Arc::clone(browser));
        }

        let chrome = crate::chrome::resolve_chrome(self.settings.chrome_path.as_deref().map(Path::new))?;
        info!("Launching browser {}", chrome.display());

        let mut builder = BrowserConfig::builder().chrome_executable(chrome);
        builder = if self.settings.headless {
            builder.arg("--headless=new")
        } else {
            builder.with_head()
        };
        builder = builder
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--disable-gpu")
            .arg("--no-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--disable-default-apps")
            .arg("--disable-sync")
            .arg("--mute-audio")
            .arg("--no-first-run")
            .arg("--lang=ru-RU");
        for arg in &self.settings.launch_args {
            builder = builder.arg(arg);
        }

        let config = builder
            .build()
            .map_err(|e| cdp_error("Failed to build browser config", e))?;
        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| cdp_error("Failed to launch browser", e))?;

        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("Browser CDP handler error: {}", e);
                }
            }
            debug!("Browser CDP handler exited");
        });

        let browser = Arc::new(browser);
        *guard = Some(Arc::clone(&browser));
        Ok(browser)
    }

    /// Drops the shared browser handle.
    pub async fn shutdown(&self) {
        if self.browser.lock().await.take().is_some() {
            debug!("Browser pool shut down");
        }
    }
}

/// An open incognito context plus its single page.
///
/// `close` disposes it; dropping an unclosed guard disposes it in the background.
struct ContextGuard {
    browser: Arc<Browser>,
    id: Option<BrowserContextId>,
    page: Option<Page>,
    _permit: OwnedSemaphorePermit,
}

impl ContextGuard {
    async fn open(pool: &BrowserPool, proxy: Option<&ProxyEndpoint>) -> Result<Self> {
        let permit = pool.permit().await?;
        let browser = pool.acquire_browser().await?;

        if proxy.is_some_and(|p| p.username.is_some()) {
            warn!("Browser contexts cannot authenticate to proxies; credentials are ignored");
        }
        let mut params = CreateBrowserContextParams::builder();
        if let Some(proxy) = proxy {
            params = params.proxy_server(proxy.server());
        }
        let id = browser
            .execute(params.build())
            .await
            .map_err(|e| cdp_error("Failed to create browser context", e))?
            .result
            .browser_context_id;

        let mut guard = Self {
            browser: browser.clone(),
            id: Some(id.clone()),
            page: None,
            _permit: permit,
        };

        let mut target = CreateTargetParams::new("about:blank");
        target.browser_context_id = Some(id);
        let page = browser
            .new_page(target)
            .await
            .map_err(|e| cdp_error("Failed to open page", e))?;
        guard.page = Some(page);
        Ok(guard)
    }

    fn page(&self) -> Result<&Page> {
        self.page
            .as_ref()
            .ok_or_else(|| ScrapeError::Browser("Context has no page".to_string()))
    }

    async fn close(mut self) {
        if let Some(page) = self.page.take() {
            if let Err(e) = page.close().await {
                debug!("Failed to close page: {}", e);
            }
        }
        if let Some(id) = self.id.take() {
            if let Err(e) = self.browser.execute(DisposeBrowserContextParams::new(id)).await {
                warn!("Failed to dispose browser context: {}", e);
            }
        }
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };
        let browser = self.browser.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = browser.execute(DisposeBrowserContextParams::new(id)).await {
                    warn!("Failed to dispose abandoned browser context: {}", e);
                }
            });
        }
    }
}

/// Resolves a possibly relative card link against the listing URL.
fn absolute_link(page_url: &str, link: &str) -> Option<String> {
    Url::parse(page_url)
        .and_then(|base| base.join(link))
        .ok()
        .map(String::from)
}

/// Rendered-browser strategy and session refresher.
pub struct RenderedClient {
    pool: Arc<BrowserPool>,
    adapters: HashMap<Marketplace, Arc<dyn MarketplaceAdapter>>,
    proxies: Arc<ProxyPool>,
    use_proxy: bool,
    identities: IdentityPool,
    emulation: EmulationSettings,
    timeouts: Timeouts,
    sleeper: Arc<dyn Sleeper>,
    dump: Option<Arc<dyn HtmlDump>>,
}

impl RenderedClient {
    pub fn new(pool: Arc<BrowserPool>, adapters: Vec<Arc<dyn MarketplaceAdapter>>) -> Self {
        let use_proxy = pool.settings().use_proxy;
        Self {
            pool,
            adapters: adapters.into_iter().map(|a| (a.marketplace(), a)).collect(),
            proxies: Arc::new(ProxyPool::disabled()),
            use_proxy,
            identities: IdentityPool::default(),
            emulation: EmulationSettings::default(),
            timeouts: Timeouts::default(),
            sleeper: Arc::new(TokioSleeper),
            dump: None,
        }
    }

    pub fn with_proxies(mut self, proxies: Arc<ProxyPool>) -> Self {
        self.proxies = proxies;
        self
    }

    pub fn with_identities(mut self, identities: IdentityPool) -> Self {
        self.identities = identities;
        self
    }

    pub fn with_emulation(mut self, emulation: EmulationSettings) -> Self {
        self.emulation = emulation;
        self
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Sleeper for emulation pauses, settle delays and challenge polling.
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_dump(mut self, dump: Arc<dyn HtmlDump>) -> Self {
        self.dump = Some(dump);
        self
    }

    pub fn pool(&self) -> &Arc<BrowserPool> {
        &self.pool
    }

    fn adapter(&self, marketplace: Marketplace) -> Result<&dyn MarketplaceAdapter> {
        self.adapters
            .get(&marketplace)
            .map(|a| a.as_ref())
            .ok_or_else(|| ScrapeError::UnsupportedMarketplace(marketplace.to_string()))
    }

    async fn open_context(&self) -> Result<(ContextGuard, Identity)> {
        let identity = self.identities.random_identity();
        let proxy = if self.use_proxy {
            self.proxies.select().await
        } else {
            None
        };
        match &proxy {
            Some(p) => debug!("Browser context via proxy {}", p.address()),
            None => debug!("Browser context without proxy"),
        }
        let guard = ContextGuard::open(&self.pool, proxy.as_ref()).await?;
        Ok((guard, identity))
    }

    /// Applies the identity to a fresh page.
    async fn prepare(&self, page: &Page, identity: &Identity) -> Result<()> {
        page.execute(AddScriptToEvaluateOnNewDocumentParams::new(STEALTH_SCRIPT))
            .await
            .map_err(|e| cdp_error("Failed to install stealth script", e))?;

        let mut user_agent = SetUserAgentOverrideParams::new(identity.user_agent.clone());
        user_agent.accept_language = Some(identity.accept_language());
        page.execute(user_agent)
            .await
            .map_err(|e| cdp_error("Failed to set user agent", e))?;

        page.execute(SetDeviceMetricsOverrideParams::new(
            i64::from(identity.viewport.width),
            i64::from(identity.viewport.height),
            1.0,
            false,
        ))
        .await
        .map_err(|e| cdp_error("Failed to set viewport", e))?;

        if let Err(e) = page
            .execute(SetTimezoneOverrideParams::new(identity.timezone.clone()))
            .await
        {
            warn!("Failed to set timezone {}: {}", identity.timezone, e);
        }
        if let Err(e) = page
            .execute(SetLocaleOverrideParams {
                locale: Some(identity.locale.clone()),
            })
            .await
        {
            warn!("Failed to set locale {}: {}", identity.locale, e);
        }
        Ok(())
    }

    async fn navigate(&self, page: &Page, url: &str) -> Result<()> {
        debug!("Navigating to {}", url);
        match tokio::time::timeout(self.timeouts.navigation(), page.goto(url)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(cdp_error(&format!("Navigation to {} failed", url), e)),
            Err(_) => Err(ScrapeError::Timeout(format!(
                "Navigation to {} exceeded {:?}",
                url,
                self.timeouts.navigation()
            ))),
        }
    }

    async fn wait_for_load(&self, page: &Page) {
        settle_within(self.timeouts.navigation(), page.wait_for_navigation()).await;
    }

    async fn wait(&self, page: &Page, wait: &WaitStrategy) {
        match wait {
            WaitStrategy::Load => self.wait_for_load(page).await,
            WaitStrategy::NetworkIdle { idle_ms } => {
                self.wait_for_load(page).await;
                self.sleeper.sleep(Duration::from_millis(*idle_ms)).await;
            }
            WaitStrategy::Selector { css, timeout_ms } => {
                // A challenge page never shows the selector; the caller
                // inspects the content either way.
                let found = tokio::time::timeout(Duration::from_millis(*timeout_ms), async {
                    page.find_element(css.as_str()).await
                })
                .await;
                if let Err(_) | Ok(Err(_)) = found {
                    debug!("Selector '{}' not found within {}ms", css, timeout_ms);
                }
            }
            WaitStrategy::Delay { ms } => {
                self.sleeper.sleep(Duration::from_millis(*ms)).await;
            }
        }
    }

    /// Scrolls, moves the pointer and pauses like a reader would.
    async fn emulate(&self, page: &Page, identity: &Identity) {
        let plan = {
            let mut rng = rand::thread_rng();
            EmulationPlan::sample(&self.emulation, identity.viewport, &mut rng)
        };
        for gesture in plan.gestures {
            match gesture {
                Gesture::Scroll { dy } => {
                    let script = format!("window.scrollBy({{top: {}, behavior: 'smooth'}});", dy);
                    if let Err(e) = page.evaluate(script).await {
                        debug!("Scroll failed: {}", e);
                    }
                }
                Gesture::Pointer { x, y } => {
                    let event = DispatchMouseEventParams::new(DispatchMouseEventType::MouseMoved, x, y);
                    if let Err(e) = page.execute(event).await {
                        debug!("Pointer move failed: {}", e);
                    }
                }
                Gesture::Pause(pause) => self.sleeper.sleep(pause).await,
            }
        }
    }

    /// Page content, waiting out an interstitial challenge if one is showing.
    async fn settled_content(
        &self,
        page: &Page,
        marketplace: Marketplace,
        selectors: &SelectorSet,
        kind: &str,
    ) -> Result<String> {
        await_clearance(
            self.sleeper.as_ref(),
            self.timeouts.challenge(),
            marketplace,
            &selectors.challenge_markers,
            || async move {
                let html = page
                    .content()
                    .await
                    .map_err(|e| cdp_error("Failed to read page content", e))?;
                self.dump(marketplace, kind, &html);
                Ok(html)
            },
        )
        .await
    }

    async fn cookies(&self, page: &Page) -> BTreeMap<String, String> {
        match page.get_cookies().await {
            Ok(cookies) => cookies.into_iter().map(|c| (c.name, c.value)).collect(),
            Err(e) => {
                warn!("Failed to read cookies: {}", e);
                BTreeMap::new()
            }
        }
    }

    async fn drive(
        &self,
        guard: &ContextGuard,
        adapter: &dyn MarketplaceAdapter,
        request: &RenderRequest,
        identity: &Identity,
    ) -> Result<RenderOutput> {
        let page = guard.page()?;
        let marketplace = adapter.marketplace();
        let selectors = &request.selectors;
        let url = request.target.page_url.as_str();

        self.prepare(page, identity).await?;
        self.navigate(page, url).await?;
        self.wait(page, &WaitStrategy::for_selectors(selectors, self.timeouts.ready_ms))
            .await;
        self.emulate(page, identity).await;

        let items = match &request.target.kind {
            TargetKind::ProductPage { .. } => {
                let html = self.settled_content(page, marketplace, selectors, "product").await?;
                match extract_product(&html, selectors, url)? {
                    Some(item) => vec![item],
                    None => {
                        return Err(ScrapeError::Parse(format!(
                            "No product data on {}",
                            url
                        )))
                    }
                }
            }
            TargetKind::CategorySearch { .. } => {
                let html = self.settled_content(page, marketplace, selectors, "listing").await?;
                let cards = extract_cards(&html, selectors, request.fetch_limit, url)?;
                if cards.is_empty() {
                    warn!("No cards found on {}", url);
                }
                if selectors.dereference_cards && !cards.is_empty() {
                    let wanted = request.target.wanted();
                    self.dereference(page, marketplace, selectors, url, cards, wanted)
                        .await
                } else {
                    cards
                }
            }
        };

        Ok(RenderOutput {
            items,
            cookies: self.cookies(page).await,
        })
    }

    /// Opens each card's product page to fill in fields the listing omits.
    ///
    /// Stops at the first challenge, or once `wanted` cards are complete, and
    /// keeps the remaining cards as read.
    async fn dereference(
        &self,
        page: &Page,
        marketplace: Marketplace,
        selectors: &SelectorSet,
        listing_url: &str,
        cards: Vec<RawItem>,
        wanted: Option<usize>,
    ) -> Vec<RawItem> {
        let mut items = Vec::with_capacity(cards.len());
        let mut blocked = false;
        let mut complete = 0;

        for card in cards {
            let fields = match &card.payload {
                RawPayload::Dom(fields) => fields.clone(),
                RawPayload::Json(_) => {
                    items.push(card);
                    continue;
                }
            };
            let link = fields.link.as_deref().and_then(|l| absolute_link(listing_url, l));
            let satisfied = wanted.is_some_and(|n| complete >= n);
            let (Some(link), false, false) = (link, blocked, satisfied) else {
                items.push(card);
                continue;
            };

            let pause = {
                let mut rng = rand::thread_rng();
                self.emulation.scroll_pause.sample(&mut rng)
            };
            self.sleeper.sleep(pause).await;

            match self.read_product(page, marketplace, selectors, &link).await {
                Ok(Some(RawItem {
                    payload: RawPayload::Dom(product),
                    ..
                })) => {
                    let merged = merge_fields(fields, product);
                    if merged.has_required() {
                        complete += 1;
                    }
                    items.push(RawItem::dom(merged).with_page_url(link));
                }
                Ok(_) => {
                    debug!("No product data on {}, keeping card", link);
                    items.push(card);
                }
                Err(e) => {
                    warn!("Failed to open {}: {}", link, e);
                    blocked = matches!(e, ScrapeError::AntiBotChallenge(_));
                    items.push(card);
                }
            }
        }
        items
    }

    async fn read_product(
        &self,
        page: &Page,
        marketplace: Marketplace,
        selectors: &SelectorSet,
        url: &str,
    ) -> Result<Option<RawItem>> {
        self.navigate(page, url).await?;
        self.wait(page, &WaitStrategy::for_selectors(selectors, self.timeouts.ready_ms))
            .await;
        let html = self.settled_content(page, marketplace, selectors, "product").await?;
        extract_product(&html, selectors, url)
    }

    fn dump(&self, marketplace: Marketplace, kind: &str, body: &str) {
        if let Some(dump) = &self.dump {
            dump.dump(marketplace, kind, body);
        }
    }

    async fn visit_landing(
        &self,
        guard: &ContextGuard,
        adapter: &dyn MarketplaceAdapter,
        identity: &Identity,
    ) -> Result<BTreeMap<String, String>> {
        let page = guard.page()?;
        let url = adapter.config().landing_url.clone();
        self.prepare(page, identity).await?;
        self.navigate(page, &url).await?;
        self.wait(page, &WaitStrategy::NetworkIdle { idle_ms: 1_500 }).await;
        self.emulate(page, identity).await;
        self.settled_content(page, adapter.marketplace(), adapter.selectors(), "landing")
            .await?;
        Ok(self.cookies(page).await)
    }
}

#[async_trait]
impl RenderedSource for RenderedClient {
    async fn render_and_extract(
        &self,
        request: &RenderRequest,
        cancel: &CancellationToken,
    ) -> Result<RenderOutput> {
        if cancel.is_cancelled() {
            return Err(ScrapeError::Cancelled);
        }
        let adapter = self.adapter(request.target.marketplace)?;
        info!(
            "Rendering {} (attempt {})",
            request.target.page_url, request.attempt
        );

        let (guard, identity) = tokio::select! {
            _ = cancel.cancelled() => return Err(ScrapeError::Cancelled),
            opened = self.open_context() => opened?,
        };
        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(ScrapeError::Cancelled),
            output = self.drive(&guard, adapter, request, &identity) => output,
        };
        guard.close().await;
        outcome
    }
}

#[async_trait]
impl SessionRefresher for RenderedClient {
    async fn refresh(&self, marketplace: Marketplace) -> Result<BTreeMap<String, String>> {
        let adapter = self.adapter(marketplace)?;
        info!("Refreshing {} session via {}", marketplace, adapter.config().landing_url);

        let (guard, identity) = self.open_context().await?;
        let cookies = tokio::time::timeout(
            self.timeouts.navigation() + self.timeouts.challenge(),
            self.visit_landing(&guard, adapter, &identity),
        )
        .await;
        guard.close().await;

        match cookies {
            Ok(cookies) => cookies,
            Err(_) => Err(ScrapeError::Timeout(format!(
                "{} session refresh timed out",
                marketplace
            ))),
        }
    }
}
