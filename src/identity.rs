//! Browser fingerprint rotation.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Window size presented to the site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Viewport {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// One fingerprint, drawn fresh for every attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_agent: String,
    pub viewport: Viewport,
    /// BCP 47 locale, e.g. `ru-RU`.
    pub locale: String,
    /// IANA timezone, e.g. `Europe/Moscow`.
    pub timezone: String,
}

impl Identity {
    /// `Accept-Language` header matching the locale.
    pub fn accept_language(&self) -> String {
        let primary = self.locale.split('-').next().unwrap_or(&self.locale);
        if primary == self.locale {
            format!("{},en;q=0.8", self.locale)
        } else {
            format!("{},{};q=0.9,en-US;q=0.8,en;q=0.7", self.locale, primary)
        }
    }
}

/// Pools an identity is drawn from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentitySettings {
    pub user_agents: Vec<String>,
    pub viewports: Vec<Viewport>,
    pub locales: Vec<String>,
    pub timezones: Vec<String>,
}

impl Default for IdentitySettings {
    fn default() -> Self {
        Self {
            user_agents: vec![
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36".to_string(),
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36".to_string(),
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36".to_string(),
                "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36".to_string(),
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 YaBrowser/24.4.0.0 Safari/537.36".to_string(),
            ],
            viewports: vec![
                Viewport::new(1920, 1080),
                Viewport::new(1536, 864),
                Viewport::new(1440, 900),
                Viewport::new(1366, 768),
            ],
            locales: vec!["ru-RU".to_string()],
            timezones: vec!["Europe/Moscow".to_string()],
        }
    }
}

/// Selects random identities from configured pools.
#[derive(Debug, Clone)]
pub struct IdentityPool {
    settings: IdentitySettings,
}

impl IdentityPool {
    /// Creates a pool; any empty list falls back to the built-in defaults.
    pub fn new(settings: IdentitySettings) -> Self {
        let defaults = IdentitySettings::default();
        let pick = |list: Vec<String>, default: Vec<String>| {
            if list.is_empty() {
                default
            } else {
                list
            }
        };
        Self {
            settings: IdentitySettings {
                viewports: if settings.viewports.is_empty() {
                    defaults.viewports
                } else {
                    settings.viewports
                },
                user_agents: pick(settings.user_agents, defaults.user_agents),
                locales: pick(settings.locales, defaults.locales),
                timezones: pick(settings.timezones, defaults.timezones),
            },
        }
    }

    /// Draws an identity using the thread-local generator.
    pub fn random_identity(&self) -> Identity {
        self.random_identity_with(&mut rand::thread_rng())
    }

    /// Draws an identity from a caller-supplied generator.
    pub fn random_identity_with<R: Rng + ?Sized>(&self, rng: &mut R) -> Identity {
        let s = &self.settings;
        Identity {
            user_agent: s.user_agents.choose(rng).cloned().unwrap_or_default(),
            viewport: s
                .viewports
                .choose(rng)
                .copied()
                .unwrap_or(Viewport::new(1920, 1080)),
            locale: s.locales.choose(rng).cloned().unwrap_or_default(),
            timezone: s.timezones.choose(rng).cloned().unwrap_or_default(),
        }
    }
}

impl Default for IdentityPool {
    fn default() -> Self {
        Self::new(IdentitySettings::default())
    }
}
