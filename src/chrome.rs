//! Locating a Chrome/Chromium executable for the browser pool.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::{Result, ScrapeError};

/// Environment variable that overrides detection.
pub const CHROME_ENV: &str = "SHELFWATCH_CHROME";

#[cfg(target_os = "macos")]
const INSTALL_PATHS: &[&str] = &[
    "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
    "/Applications/Chromium.app/Contents/MacOS/Chromium",
];

#[cfg(not(target_os = "macos"))]
const INSTALL_PATHS: &[&str] = &[
    "/usr/bin/chromium",
    "/usr/bin/chromium-browser",
    "/usr/bin/google-chrome-stable",
    "/usr/bin/google-chrome",
    "/opt/google/chrome/chrome",
    "/snap/bin/chromium",
];

const COMMANDS: &[&str] = &[
    "chromium",
    "chromium-browser",
    "google-chrome-stable",
    "google-chrome",
    "chrome",
];

/// Finds an installed browser: `SHELFWATCH_CHROME`, then `PATH`, then the
/// usual install locations.
pub fn detect_chrome() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os(CHROME_ENV).map(PathBuf::from) {
        if path.is_file() {
            debug!("Chrome from {}: {}", CHROME_ENV, path.display());
            return Some(path);
        }
    }

    if let Some(path) = COMMANDS.iter().find_map(|cmd| which::which(cmd).ok()) {
        debug!("Chrome on PATH: {}", path.display());
        return Some(path);
    }

    INSTALL_PATHS
        .iter()
        .map(Path::new)
        .find(|p| p.is_file())
        .map(|p| {
            debug!("Chrome at {}", p.display());
            p.to_path_buf()
        })
}

/// Uses `configured` when given, otherwise detects one.
pub fn resolve_chrome(configured: Option<&Path>) -> Result<PathBuf> {
    match configured {
        Some(path) if path.is_file() => Ok(path.to_path_buf()),
        Some(path) => Err(ScrapeError::Browser(format!(
            "Configured Chrome executable does not exist: {}",
            path.display()
        ))),
        None => detect_chrome().ok_or_else(|| {
            ScrapeError::Browser(format!(
                "No Chrome/Chromium installation found; install one or set {}",
                CHROME_ENV
            ))
        }),
    }
}
