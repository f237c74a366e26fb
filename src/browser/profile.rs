//! Browser profiles and on-disk profile directories.
//!
//! A [`BrowserProfile`] describes how a context is built: fingerprint, proxy
//! and cookie policy. The on-disk user-data directory is UUID-named to avoid
//! SingletonLock contention between concurrent contexts.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

/// Rotation set for `rotate_user_agent`. Current stable desktop Chrome UAs.
pub const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/130.0.0.0 Safari/537.36",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub user_agent: String,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub locale: String,
    pub timezone: String,
}

impl Default for Fingerprint {
    fn default() -> Self {
        Self {
            user_agent: USER_AGENTS[0].to_string(),
            viewport_width: 1920,
            viewport_height: 1080,
            locale: "en-US".to_string(),
            timezone: "UTC".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CookiesPolicy {
    /// Cookie jar scoped to the lease, wiped on recycle
    Fresh,
    /// Cookies survive for the context's lifetime
    Persist,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserProfile {
    pub id: Uuid,
    pub browser_type: String,
    pub fingerprint: Fingerprint,
    #[serde(default)]
    pub proxy: Option<String>,
    pub cookies_policy: CookiesPolicy,
}

impl Default for BrowserProfile {
    fn default() -> Self {
        Self {
            id: Uuid::new_v4(),
            browser_type: "chromium".to_string(),
            fingerprint: Fingerprint::default(),
            proxy: None,
            cookies_policy: CookiesPolicy::Fresh,
        }
    }
}

impl BrowserProfile {
    #[must_use]
    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    /// Swap in a different user agent than the current one.
    pub fn rotate_user_agent(&mut self) {
        use rand::prelude::IndexedRandom;
        let mut rng = rand::rng();
        let next = USER_AGENTS
            .iter()
            .filter(|ua| **ua != self.fingerprint.user_agent)
            .collect::<Vec<_>>();
        if let Some(ua) = next.choose(&mut rng) {
            self.fingerprint.user_agent = (**ua).to_string();
        }
    }
}

// =============================================================================
// ProfileDir - RAII wrapper for the user-data directory
// =============================================================================

/// RAII wrapper for a context's user-data directory.
///
/// Cleans up on drop unless `into_path()` transfers ownership to another
/// cleanup mechanism (the pool's context teardown).
#[derive(Debug)]
pub struct ProfileDir {
    path: PathBuf,
    cleanup_on_drop: bool,
}

impl ProfileDir {
    /// Create a unique user-data directory under the system temp dir.
    pub fn create() -> Result<Self> {
        let path = std::env::temp_dir().join(format!("crawlflow_ctx_{}", Uuid::new_v4()));
        debug!("creating browser profile dir: {}", path.display());
        std::fs::create_dir_all(&path).context("Failed to create profile directory")?;
        Ok(Self {
            path,
            cleanup_on_drop: true,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Consume and return the path, disabling auto-cleanup.
    #[must_use]
    pub fn into_path(mut self) -> PathBuf {
        self.cleanup_on_drop = false;
        std::mem::take(&mut self.path)
    }
}

impl Drop for ProfileDir {
    fn drop(&mut self) {
        if self.cleanup_on_drop && self.path.exists() {
            if let Err(e) = std::fs::remove_dir_all(&self.path) {
                warn!("failed to clean up profile dir {}: {e}", self.path.display());
            }
        }
    }
}

/// Remove a user-data directory that outlived its ProfileDir wrapper.
pub fn remove_profile_dir(path: &Path) {
    if path.exists() {
        if let Err(e) = std::fs::remove_dir_all(path) {
            warn!("failed to remove profile dir {}: {e}", path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotate_changes_user_agent() {
        let mut profile = BrowserProfile::default();
        let before = profile.fingerprint.user_agent.clone();
        profile.rotate_user_agent();
        assert_ne!(profile.fingerprint.user_agent, before);
    }

    #[test]
    fn profile_dir_cleans_up_on_drop() {
        let dir = ProfileDir::create().unwrap();
        let path = dir.path().to_path_buf();
        assert!(path.exists());
        drop(dir);
        assert!(!path.exists());
    }

    #[test]
    fn into_path_disables_cleanup() {
        let dir = ProfileDir::create().unwrap();
        let path = dir.into_path();
        assert!(path.exists());
        std::fs::remove_dir_all(&path).unwrap();
    }
}
