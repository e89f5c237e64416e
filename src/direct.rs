//! Direct-endpoint client.
//!
//! Calls the JSON endpoints a marketplace's own storefront script uses. Each
//! call carries the cached session cookies, a plausible referer and the
//! headers a same-site XHR would send.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, COOKIE, ORIGIN, REFERER};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::RetryPolicy;
use crate::dump::HtmlDump;
use crate::extract::detect_challenge;
use crate::identity::{Identity, IdentityPool};
use crate::marketplace::{EndpointRequest, MarketplaceAdapter};
use crate::proxy::ProxyPool;
use crate::session::SessionStore;
use crate::source::DirectSource;
use crate::timing::{Sleeper, TokioSleeper};
use crate::{Marketplace, RawItem, Result, ScrapeError};

/// Direct-endpoint strategy over reqwest.
pub struct DirectClient {
    adapters: HashMap<Marketplace, Arc<dyn MarketplaceAdapter>>,
    sessions: Option<Arc<SessionStore>>,
    proxies: Arc<ProxyPool>,
    identities: IdentityPool,
    retry: RetryPolicy,
    timeout: Duration,
    sleeper: Arc<dyn Sleeper>,
    dump: Option<Arc<dyn HtmlDump>>,
}

/// Per-call state: one identity, one client, one cookie header.
struct CallContext {
    client: Client,
    identity: Identity,
    cookie: Option<String>,
}

impl DirectClient {
    /// Creates a client for the given adapters with direct egress and no session.
    pub fn new(adapters: Vec<Arc<dyn MarketplaceAdapter>>) -> Self {
        Self {
            adapters: adapters.into_iter().map(|a| (a.marketplace(), a)).collect(),
            sessions: None,
            proxies: Arc::new(ProxyPool::disabled()),
            identities: IdentityPool::default(),
            retry: RetryPolicy::default(),
            timeout: Duration::from_secs(15),
            sleeper: Arc::new(TokioSleeper),
            dump: None,
        }
    }

    pub fn with_sessions(mut self, sessions: Arc<SessionStore>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    pub fn with_proxies(mut self, proxies: Arc<ProxyPool>) -> Self {
        self.proxies = proxies;
        self
    }

    pub fn with_identities(mut self, identities: IdentityPool) -> Self {
        self.identities = identities;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_dump(mut self, dump: Arc<dyn HtmlDump>) -> Self {
        self.dump = Some(dump);
        self
    }

    fn adapter(&self, marketplace: Marketplace) -> Result<&Arc<dyn MarketplaceAdapter>> {
        self.adapters
            .get(&marketplace)
            .ok_or_else(|| ScrapeError::UnsupportedMarketplace(marketplace.to_string()))
    }

    async fn context(&self, adapter: &dyn MarketplaceAdapter) -> Result<CallContext> {
        let identity = self.identities.random_identity();
        let mut builder = Client::builder()
            .user_agent(&identity.user_agent)
            .timeout(self.timeout)
            .gzip(true)
            .brotli(true);
        builder = match self.proxies.select().await {
            Some(proxy) => {
                debug!("Direct call via proxy {}", proxy.address());
                builder.proxy(proxy.to_reqwest()?)
            }
            None => builder.no_proxy(),
        };
        let client = builder
            .build()
            .map_err(|e| ScrapeError::Other(format!("Failed to create HTTP client: {}", e)))?;

        Ok(CallContext {
            client,
            identity,
            cookie: self.session_cookie(adapter).await,
        })
    }

    /// Cookie header for the marketplace, or `None` to proceed without a session.
    async fn session_cookie(&self, adapter: &dyn MarketplaceAdapter) -> Option<String> {
        if !adapter.config().use_session {
            return None;
        }
        let sessions = self.sessions.as_ref()?;
        match sessions.get_session(adapter.marketplace()).await {
            Ok(session) => Some(session.cookie_header()).filter(|h| !h.is_empty()),
            Err(e) => {
                warn!(
                    "Proceeding without {} session: {}",
                    adapter.marketplace(),
                    e
                );
                None
            }
        }
    }

    async fn get_json(
        &self,
        adapter: &dyn MarketplaceAdapter,
        ctx: &CallContext,
        request: &EndpointRequest,
    ) -> Result<Value> {
        let mut retry = 0;
        loop {
            let mut builder = ctx
                .client
                .get(&request.url)
                .header(ACCEPT, "application/json, text/plain, */*")
                .header(ACCEPT_LANGUAGE, ctx.identity.accept_language())
                .header(REFERER, &request.referer)
                .header(ORIGIN, &request.origin)
                .header("X-Requested-With", "XMLHttpRequest")
                .header("Sec-Fetch-Dest", "empty")
                .header("Sec-Fetch-Mode", "cors")
                .header("Sec-Fetch-Site", "same-site");
            if let Some(cookie) = &ctx.cookie {
                builder = builder.header(COOKIE, cookie);
            }

            let response = builder.send().await?;
            let status = response.status();

            if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                if retry < self.retry.max_retries {
                    let delay = self.retry.backoff(retry);
                    warn!(
                        "{} answered {}, retrying in {:?} ({}/{})",
                        request.url,
                        status.as_u16(),
                        delay,
                        retry + 1,
                        self.retry.max_retries
                    );
                    self.sleeper.sleep(delay).await;
                    retry += 1;
                    continue;
                }
                return Err(if status == StatusCode::TOO_MANY_REQUESTS {
                    ScrapeError::RateLimited {
                        attempts: retry + 1,
                        url: request.url.clone(),
                    }
                } else {
                    ScrapeError::Status {
                        status: status.as_u16(),
                        url: request.url.clone(),
                    }
                });
            }

            if status == StatusCode::FORBIDDEN || status == StatusCode::UNAUTHORIZED {
                self.invalidate(adapter.marketplace()).await;
                return Err(ScrapeError::AntiBotChallenge(format!(
                    "{} answered {}",
                    request.url,
                    status.as_u16()
                )));
            }
            if !status.is_success() {
                return Err(ScrapeError::Status {
                    status: status.as_u16(),
                    url: request.url.clone(),
                });
            }

            let body = response.text().await?;
            return match serde_json::from_str::<Value>(&body) {
                Ok(value) => Ok(value),
                Err(e) => {
                    self.dump(adapter.marketplace(), "direct", &body);
                    match detect_challenge(&body, &adapter.selectors().challenge_markers) {
                        Some(marker) => {
                            self.invalidate(adapter.marketplace()).await;
                            Err(ScrapeError::AntiBotChallenge(format!(
                                "{} served a challenge page ({})",
                                request.url, marker
                            )))
                        }
                        None => Err(ScrapeError::Json(e)),
                    }
                }
            };
        }
    }

    async fn invalidate(&self, marketplace: Marketplace) {
        if let Some(sessions) = &self.sessions {
            sessions.invalidate(marketplace).await;
        }
    }

    fn dump(&self, marketplace: Marketplace, kind: &str, body: &str) {
        if let Some(dump) = &self.dump {
            dump.dump(marketplace, kind, body);
        }
    }
}

#[async_trait]
impl DirectSource for DirectClient {
    async fn search(
        &self,
        marketplace: Marketplace,
        query: &str,
        limit: usize,
    ) -> Result<Vec<RawItem>> {
        let adapter = self.adapter(marketplace)?.as_ref();
        let ctx = self.context(adapter).await?;
        let max_pages = adapter.config().max_pages.max(1);

        let mut items = Vec::new();
        for page in 1..=max_pages {
            let request = adapter.search_request(query, page)?;
            let body = match self.get_json(adapter, &ctx, &request).await {
                Ok(body) => body,
                Err(e) if !items.is_empty() => {
                    warn!("Stopping {} search at page {}: {}", marketplace, page, e);
                    break;
                }
                Err(e) => return Err(e),
            };
            let page_items = match adapter.parse_search(&body) {
                Ok(page_items) => page_items,
                Err(e) => {
                    self.dump(marketplace, "direct_search", &body.to_string());
                    if items.is_empty() {
                        return Err(e);
                    }
                    warn!("Stopping {} search at page {}: {}", marketplace, page, e);
                    break;
                }
            };
            debug!(
                "{} search '{}' page {}: {} items",
                marketplace,
                query,
                page,
                page_items.len()
            );
            if page_items.is_empty() {
                break;
            }
            items.extend(page_items);
            if limit > 0 && items.len() >= limit {
                break;
            }
        }

        if limit > 0 {
            items.truncate(limit);
        }
        Ok(items)
    }

    async fn fetch_by_id(&self, marketplace: Marketplace, id: &str) -> Result<Option<RawItem>> {
        let adapter = self.adapter(marketplace)?.as_ref();
        let ctx = self.context(adapter).await?;
        let request = adapter.product_request(id)?;
        let body = self.get_json(adapter, &ctx, &request).await?;
        adapter.parse_product(id, &body).inspect_err(|_| {
            self.dump(marketplace, "direct_product", &body.to_string());
        })
    }
}
