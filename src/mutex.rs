//! Named exclusion locks shared across plugins, e.g. `pkgmgr:apt`.
//!
//! Acquisition of a plugin's whole mutex set is atomic: either every
//! requested name becomes held by the caller, or none do.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep, Instant};
use tracing::debug;

/// Who holds a mutex and since when.
#[derive(Debug, Clone)]
pub struct MutexInfo {
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
}

const RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Tracks the table of held mutexes and arbitrates acquisition.
pub struct MutexManager {
    held: AsyncMutex<HashMap<String, MutexInfo>>,
}

impl MutexManager {
    pub fn new() -> Self {
        Self { held: AsyncMutex::new(HashMap::new()) }
    }

    /// Attempts to acquire every name in `mutexes` for `plugin`, retrying
    /// until `timeout` elapses. Returns `true` iff the whole set was
    /// acquired atomically.
    pub async fn acquire(&self, plugin: &str, mutexes: &[String], timeout: Duration) -> bool {
        if mutexes.is_empty() {
            return true;
        }
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut held = self.held.lock().await;
                if !self.has_conflict(&held, mutexes) {
                    let now = Utc::now();
                    for name in mutexes {
                        held.insert(name.clone(), MutexInfo { holder: plugin.to_string(), acquired_at: now });
                    }
                    debug!(plugin, ?mutexes, "acquired mutex set");
                    return true;
                }
            }
            if Instant::now() >= deadline {
                debug!(plugin, ?mutexes, "mutex acquisition timed out");
                return false;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            sleep(remaining.min(RETRY_INTERVAL)).await;
        }
    }

    fn has_conflict(&self, held: &HashMap<String, MutexInfo>, mutexes: &[String]) -> bool {
        mutexes.iter().any(|m| held.contains_key(m))
    }

    /// Releases every mutex held by `plugin` within `mutexes`, or all of
    /// `plugin`'s mutexes if `mutexes` is `None`.
    pub async fn release(&self, plugin: &str, mutexes: Option<&[String]>) {
        let mut held = self.held.lock().await;
        match mutexes {
            Some(names) => {
                for name in names {
                    if held.get(name).map(|info| info.holder == plugin).unwrap_or(false) {
                        held.remove(name);
                    }
                }
            }
            None => {
                held.retain(|_, info| info.holder != plugin);
            }
        }
    }

    pub async fn holder(&self, mutex: &str) -> Option<String> {
        self.held.lock().await.get(mutex).map(|i| i.holder.clone())
    }

    pub async fn is_held(&self, mutex: &str) -> bool {
        self.held.lock().await.contains_key(mutex)
    }

    pub async fn held_by(&self, plugin: &str) -> Vec<String> {
        self.held.lock().await.iter().filter(|(_, i)| i.holder == plugin).map(|(name, _)| name.clone()).collect()
    }

    pub async fn all_held(&self) -> HashMap<String, MutexInfo> {
        self.held.lock().await.clone()
    }
}

impl Default for MutexManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Conventional mutex names. Advisory only — the manager treats every name
/// opaquely; these constants exist purely for callers to share naming.
pub mod standard {
    pub const APT: &str = "pkgmgr:apt";
    pub const DPKG: &str = "pkgmgr:dpkg";
    pub const SNAP: &str = "pkgmgr:snap";
    pub const FLATPAK: &str = "pkgmgr:flatpak";
    pub const PIPX: &str = "pkgmgr:pipx";
    pub const CARGO: &str = "pkgmgr:cargo";
    pub const NPM: &str = "pkgmgr:npm";
    pub const RUSTUP: &str = "pkgmgr:rustup";

    pub const PYTHON: &str = "runtime:python";
    pub const NODE: &str = "runtime:node";
    pub const RUST: &str = "runtime:rust";

    pub const NETWORK: &str = "system:network";
    pub const DISK: &str = "system:disk";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn exclusive_acquire_blocks_second_holder() {
        let mgr = MutexManager::new();
        assert!(mgr.acquire("a", &["pkgmgr:dpkg".to_string()], Duration::from_millis(50)).await);
        assert!(!mgr.acquire("b", &["pkgmgr:dpkg".to_string()], Duration::from_millis(50)).await);
        mgr.release("a", None).await;
        assert!(mgr.acquire("b", &["pkgmgr:dpkg".to_string()], Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn acquire_is_atomic_across_the_set() {
        let mgr = MutexManager::new();
        assert!(mgr.acquire("a", &["x".to_string()], Duration::from_millis(50)).await);
        // "y" is free but "x" is held, so the whole set must fail.
        let ok = mgr.acquire("b", &["x".to_string(), "y".to_string()], Duration::from_millis(50)).await;
        assert!(!ok);
        assert!(!mgr.is_held("y").await);
    }

    #[tokio::test]
    async fn release_subset_only_releases_named() {
        let mgr = MutexManager::new();
        mgr.acquire("a", &["x".to_string(), "y".to_string()], Duration::from_millis(50)).await;
        mgr.release("a", Some(&["x".to_string()])).await;
        assert!(!mgr.is_held("x").await);
        assert!(mgr.is_held("y").await);
    }
}
