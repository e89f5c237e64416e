//! Raw page dumps for diagnosing selector drift.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use tracing::{debug, warn};

use crate::Marketplace;

/// Receives raw page bodies as they are fetched.
pub trait HtmlDump: Send + Sync {
    /// Records one body. `kind` describes what was fetched, e.g. `listing`.
    fn dump(&self, marketplace: Marketplace, kind: &str, body: &str);
}

/// Writes each body to `<marketplace>-<kind>-<timestamp>-<seq>.html` in a directory.
pub struct FileDump {
    dir: PathBuf,
    seq: AtomicU64,
}

impl FileDump {
    /// Creates the directory if needed.
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            seq: AtomicU64::new(0),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Writes one body and returns the file path.
    pub fn write(&self, marketplace: Marketplace, kind: &str, body: &str) -> io::Result<PathBuf> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let kind: String = kind
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        let name = format!(
            "{}-{}-{}-{:04}.html",
            marketplace,
            kind,
            Utc::now().format("%Y%m%dT%H%M%S"),
            seq
        );
        let path = self.dir.join(name);
        fs::write(&path, body)?;
        Ok(path)
    }
}

impl HtmlDump for FileDump {
    fn dump(&self, marketplace: Marketplace, kind: &str, body: &str) {
        match self.write(marketplace, kind, body) {
            Ok(path) => debug!("Dumped {} {} page to {}", marketplace, kind, path.display()),
            Err(e) => warn!("Failed to dump {} {} page: {}", marketplace, kind, e),
        }
    }
}
