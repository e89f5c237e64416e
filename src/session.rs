//! Per-marketplace anti-bot session cache.
//!
//! A session is the cookie set a browser collected after passing a
//! marketplace's challenge. Sessions are reused until their TTL expires; a
//! stale session is refreshed through a [`SessionRefresher`] under a
//! per-marketplace lock, so concurrent callers trigger at most one refresh.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::timing::{Clock, SystemClock};
use crate::{Marketplace, Result, ScrapeError};

/// TTL used for marketplaces without a configured one.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(600);

/// Harvested cookies for one marketplace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub marketplace: Marketplace,
    pub cookies: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub ttl: Duration,
}

impl Session {
    pub fn new(
        marketplace: Marketplace,
        cookies: BTreeMap<String, String>,
        created_at: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        Self {
            marketplace,
            cookies,
            created_at,
            ttl,
        }
    }

    /// Age at `now`; a creation time in the future counts as zero.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).to_std().unwrap_or(Duration::ZERO)
    }

    /// A session is fresh while its age is below the TTL.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.age(now) < self.ttl
    }

    /// Value for a `Cookie` request header.
    pub fn cookie_header(&self) -> String {
        self.cookies
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Solves a marketplace's challenge and returns the resulting cookies.
#[async_trait]
pub trait SessionRefresher: Send + Sync {
    async fn refresh(&self, marketplace: Marketplace) -> Result<BTreeMap<String, String>>;
}

/// Session cache shared by every worker.
pub struct SessionStore {
    sessions: RwLock<HashMap<Marketplace, Arc<Session>>>,
    /// Last failed refresh per marketplace, for the cooldown window.
    failures: RwLock<HashMap<Marketplace, (DateTime<Utc>, String)>>,
    locks: HashMap<Marketplace, Arc<Mutex<()>>>,
    ttls: HashMap<Marketplace, Duration>,
    refresher: Arc<dyn SessionRefresher>,
    clock: Arc<dyn Clock>,
    cooldown: Duration,
}

impl SessionStore {
    pub fn new(refresher: Arc<dyn SessionRefresher>, ttls: HashMap<Marketplace, Duration>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            failures: RwLock::new(HashMap::new()),
            locks: Marketplace::ALL
                .iter()
                .map(|m| (*m, Arc::new(Mutex::new(()))))
                .collect(),
            ttls,
            refresher,
            clock: Arc::new(SystemClock),
            cooldown: Duration::from_secs(30),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Fail-fast window after a failed refresh.
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn ttl(&self, marketplace: Marketplace) -> Duration {
        self.ttls
            .get(&marketplace)
            .copied()
            .unwrap_or(DEFAULT_SESSION_TTL)
    }

    /// Returns a fresh session, refreshing it if needed.
    ///
    /// Fails with [`ScrapeError::SessionRefreshFailed`] when challenge solving
    /// fails, or while the cooldown after such a failure is running.
    pub async fn get_session(&self, marketplace: Marketplace) -> Result<Arc<Session>> {
        if let Some(session) = self.fresh(marketplace).await {
            return Ok(session);
        }

        let lock = self
            .locks
            .get(&marketplace)
            .cloned()
            .unwrap_or_else(|| Arc::new(Mutex::new(())));
        let _guard = lock.lock().await;

        // Another caller may have refreshed while we waited.
        if let Some(session) = self.fresh(marketplace).await {
            debug!("Reusing {} session refreshed by another worker", marketplace);
            return Ok(session);
        }
        if let Some(reason) = self.cooling_down(marketplace).await {
            return Err(ScrapeError::SessionRefreshFailed {
                marketplace: marketplace.to_string(),
                reason: format!("recent refresh failed: {}", reason),
            });
        }

        info!("Refreshing {} session", marketplace);
        let outcome = match self.refresher.refresh(marketplace).await {
            Ok(cookies) if cookies.is_empty() => Err(ScrapeError::SessionRefreshFailed {
                marketplace: marketplace.to_string(),
                reason: "no cookies harvested".to_string(),
            }),
            Ok(cookies) => Ok(cookies),
            Err(e @ ScrapeError::SessionRefreshFailed { .. }) | Err(e @ ScrapeError::Cancelled) => {
                Err(e)
            }
            Err(e) => Err(ScrapeError::SessionRefreshFailed {
                marketplace: marketplace.to_string(),
                reason: e.to_string(),
            }),
        };

        match outcome {
            Ok(cookies) => {
                let session = Arc::new(Session::new(
                    marketplace,
                    cookies,
                    self.clock.now(),
                    self.ttl(marketplace),
                ));
                self.failures.write().await.remove(&marketplace);
                self.sessions
                    .write()
                    .await
                    .insert(marketplace, session.clone());
                debug!(
                    "Stored {} session with {} cookies",
                    marketplace,
                    session.cookies.len()
                );
                Ok(session)
            }
            Err(e) => {
                if !matches!(e, ScrapeError::Cancelled) {
                    warn!("{} session refresh failed: {}", marketplace, e);
                    self.failures
                        .write()
                        .await
                        .insert(marketplace, (self.clock.now(), e.to_string()));
                }
                Err(e)
            }
        }
    }

    /// The cached session, fresh or not.
    pub async fn peek(&self, marketplace: Marketplace) -> Option<Arc<Session>> {
        self.sessions.read().await.get(&marketplace).cloned()
    }

    /// Drops the cached session, forcing a refresh on next use.
    pub async fn invalidate(&self, marketplace: Marketplace) {
        if self.sessions.write().await.remove(&marketplace).is_some() {
            debug!("Invalidated {} session", marketplace);
        }
    }

    /// Stores cookies harvested during a rendered extraction.
    ///
    /// The new cookies overlay those of the current session and the result is
    /// a new session stamped now.
    pub async fn absorb(&self, marketplace: Marketplace, cookies: BTreeMap<String, String>) {
        if cookies.is_empty() {
            return;
        }
        let mut sessions = self.sessions.write().await;
        let mut merged = sessions
            .get(&marketplace)
            .map(|s| s.cookies.clone())
            .unwrap_or_default();
        merged.extend(cookies);
        let session = Session::new(marketplace, merged, self.clock.now(), self.ttl(marketplace));
        sessions.insert(marketplace, Arc::new(session));
        drop(sessions);
        self.failures.write().await.remove(&marketplace);
    }

    async fn fresh(&self, marketplace: Marketplace) -> Option<Arc<Session>> {
        let sessions = self.sessions.read().await;
        let session = sessions.get(&marketplace)?;
        session.is_fresh(self.clock.now()).then(|| session.clone())
    }

    async fn cooling_down(&self, marketplace: Marketplace) -> Option<String> {
        let failures = self.failures.read().await;
        let (failed_at, reason) = failures.get(&marketplace)?;
        let since = (self.clock.now() - *failed_at).to_std().unwrap_or(Duration::ZERO);
        (since < self.cooldown).then(|| reason.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timing::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingRefresher {
        calls: AtomicUsize,
        fail: bool,
        delay: Duration,
    }

    impl CountingRefresher {
        fn ok() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail: false,
                delay: Duration::from_millis(20),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail: true,
                delay: Duration::ZERO,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SessionRefresher for CountingRefresher {
        async fn refresh(&self, _marketplace: Marketplace) -> Result<BTreeMap<String, String>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(ScrapeError::AntiBotChallenge("challenge did not clear".into()));
            }
            Ok(BTreeMap::from([
                ("__Secure-ab".to_string(), format!("token{}", n)),
                ("abt_data".to_string(), "x".to_string()),
            ]))
        }
    }

    fn ttls() -> HashMap<Marketplace, Duration> {
        HashMap::from([
            (Marketplace::Ozon, Duration::from_secs(3600)),
            (Marketplace::Wildberries, Duration::from_secs(600)),
        ])
    }

    fn store(refresher: Arc<CountingRefresher>, clock: Arc<ManualClock>) -> SessionStore {
        SessionStore::new(refresher, ttls()).with_clock(clock)
    }

    #[test]
    fn test_session_freshness_and_header() {
        let now = Utc::now();
        let session = Session::new(
            Marketplace::Ozon,
            BTreeMap::from([("a".to_string(), "1".to_string()), ("b".to_string(), "2".to_string())]),
            now,
            Duration::from_secs(10),
        );
        assert!(session.is_fresh(now));
        assert!(session.is_fresh(now + chrono::Duration::seconds(9)));
        assert!(!session.is_fresh(now + chrono::Duration::seconds(10)));
        assert_eq!(session.cookie_header(), "a=1; b=2");
    }

    #[tokio::test]
    async fn test_fresh_session_is_reused_without_refresh() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let refresher = CountingRefresher::ok();
        let store = store(refresher.clone(), clock.clone());

        let first = store.get_session(Marketplace::Ozon).await.unwrap();
        clock.advance(Duration::from_secs(60));
        let second = store.get_session(Marketplace::Ozon).await.unwrap();

        assert_eq!(refresher.calls(), 1);
        assert_eq!(first.cookies, second.cookies);
    }

    #[tokio::test]
    async fn test_stale_session_is_refreshed() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let refresher = CountingRefresher::ok();
        let store = store(refresher.clone(), clock.clone());

        store.get_session(Marketplace::Wildberries).await.unwrap();
        clock.advance(Duration::from_secs(601));
        let refreshed = store.get_session(Marketplace::Wildberries).await.unwrap();

        assert_eq!(refresher.calls(), 2);
        assert_eq!(refreshed.cookies["__Secure-ab"], "token2");
        assert_eq!(refreshed.ttl, Duration::from_secs(600));
    }

    #[tokio::test]
    async fn test_concurrent_stale_callers_refresh_once() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let refresher = CountingRefresher::ok();
        let store = Arc::new(store(refresher.clone(), clock));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.get_session(Marketplace::Ozon).await })
            })
            .collect();
        for result in futures::future::join_all(handles).await {
            assert!(result.unwrap().is_ok());
        }
        assert_eq!(refresher.calls(), 1);
    }

    #[tokio::test]
    async fn test_refresh_failure_and_cooldown() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let refresher = CountingRefresher::failing();
        let store = store(refresher.clone(), clock.clone()).with_cooldown(Duration::from_secs(30));

        let err = store.get_session(Marketplace::Ozon).await.unwrap_err();
        assert!(matches!(err, ScrapeError::SessionRefreshFailed { .. }));

        // Within the cooldown the refresher is not called again.
        let err = store.get_session(Marketplace::Ozon).await.unwrap_err();
        assert!(matches!(err, ScrapeError::SessionRefreshFailed { .. }));
        assert_eq!(refresher.calls(), 1);

        clock.advance(Duration::from_secs(31));
        let _ = store.get_session(Marketplace::Ozon).await;
        assert_eq!(refresher.calls(), 2);
    }

    #[tokio::test]
    async fn test_invalidate_forces_refresh() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let refresher = CountingRefresher::ok();
        let store = store(refresher.clone(), clock);

        store.get_session(Marketplace::Ozon).await.unwrap();
        store.invalidate(Marketplace::Ozon).await;
        assert!(store.peek(Marketplace::Ozon).await.is_none());
        store.get_session(Marketplace::Ozon).await.unwrap();
        assert_eq!(refresher.calls(), 2);
    }

    #[tokio::test]
    async fn test_absorb_merges_cookies() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let refresher = CountingRefresher::ok();
        let store = store(refresher.clone(), clock);

        store.get_session(Marketplace::Ozon).await.unwrap();
        store
            .absorb(
                Marketplace::Ozon,
                BTreeMap::from([("__Secure-ab".to_string(), "fromBrowser".to_string())]),
            )
            .await;
        let session = store.get_session(Marketplace::Ozon).await.unwrap();
        assert_eq!(session.cookies["__Secure-ab"], "fromBrowser");
        assert_eq!(session.cookies["abt_data"], "x");
        assert_eq!(refresher.calls(), 1);
    }

    #[tokio::test]
    async fn test_default_ttl_for_unconfigured_marketplace() {
        let store = SessionStore::new(CountingRefresher::ok(), HashMap::new());
        assert_eq!(store.ttl(Marketplace::Ozon), DEFAULT_SESSION_TTL);
    }
}
