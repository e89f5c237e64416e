//! # shelfwatch
//!
//! A product extraction engine for marketplaces that guard their pages with
//! anti-bot challenges.
//!
//! For every target the engine tries the marketplace's own JSON data endpoint
//! first and falls back to rendering the page in a real browser:
//!
//! - Geo-validated proxy selection
//! - Rotating browser identities and human-like page interaction
//! - A shared anti-bot session cache with serialized refreshes
//! - One canonical [`Product`] record regardless of source payload
//!
//! ## Example
//!
//! ```rust,no_run
//! use shelfwatch::{Marketplace, Orchestrator, ScrapeRequest, ScraperConfig, TargetInput};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let engine = Orchestrator::from_config(&ScraperConfig::default(), None);
//!
//!     let request = ScrapeRequest::new(Marketplace::Wildberries, TargetInput::Query("хлебцы".into()))
//!         .with_category_filter(vec!["ржаные".into()])
//!         .with_limit(10);
//!     let result = engine.scrape(&request, &CancellationToken::new()).await?;
//!
//!     for product in &result.products {
//!         println!("{} {} {}", product.identifier, product.name, product.price);
//!     }
//!     Ok(())
//! }
//! ```

mod error;
mod marketplace;
mod orchestrator;
mod product;
mod target;

pub mod config;
pub mod direct;
pub mod dump;
pub mod emulation;
pub mod extract;
pub mod identity;
pub mod marketplaces;
pub mod normalize;
pub mod proxy;
pub mod session;
pub mod source;
pub mod timing;

#[cfg(feature = "headless")]
pub mod browser;
#[cfg(feature = "headless")]
pub mod chrome;

pub use config::{
    BrowserSettings, FieldSelectors, MarketplaceSettings, RetryPolicy, ScraperConfig, SelectorSet,
    Timeouts,
};
pub use error::{ErrorKind, Result, ScrapeError};
pub use marketplace::{EndpointRequest, Marketplace, MarketplaceAdapter};
pub use orchestrator::{Orchestrator, Stage};
pub use product::{
    DomFields, ExtractionSource, PricePair, Product, RawItem, RawPayload, ScrapeResult,
    TargetFailure, TargetOutcome,
};
pub use proxy::{ProxyEndpoint, ProxyPool};
pub use session::{Session, SessionStore};
pub use target::{Classified, ScrapeRequest, ScrapeTarget, TargetInput, TargetKind, DEFAULT_LIMIT};
