//! URL dedup cache: per-execution URL state with TTL-based expiry.
//!
//! Maps `(execution_id, url_hash)` to a small state machine
//! seen → processing → completed/failed. `try_claim` is the atomic gate that
//! guarantees at most one worker opens a node-execution root for a URL at a
//! time; the unique constraint in the metadata store remains the correctness
//! fallback.

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::error::EngineResult;

/// TTL for `processing` entries: a claim owned by a dead worker expires and
/// the URL becomes claimable again.
pub const PROCESSING_TTL: Duration = Duration::from_secs(24 * 60 * 60);
/// TTL for `completed` entries.
pub const COMPLETED_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlState {
    Seen,
    Processing,
    Completed,
    Failed,
}

#[async_trait]
pub trait DedupCache: Send + Sync {
    /// Atomically transition absent/seen → processing. Returns `true` when
    /// this caller won the claim.
    async fn try_claim(&self, execution_id: Uuid, url_hash: &str) -> EngineResult<bool>;

    /// Idempotent.
    async fn mark_completed(&self, execution_id: Uuid, url_hash: &str) -> EngineResult<()>;

    async fn mark_failed(&self, execution_id: Uuid, url_hash: &str) -> EngineResult<()>;

    /// Release a claim back to `seen` so a recovery retry can re-claim.
    async fn release(&self, execution_id: Uuid, url_hash: &str) -> EngineResult<()>;

    async fn state(&self, execution_id: Uuid, url_hash: &str) -> EngineResult<Option<UrlState>>;

    /// Drop every entry belonging to an execution (stop/terminal cleanup).
    async fn clear_execution(&self, execution_id: Uuid) -> EngineResult<()>;
}

#[derive(Debug, Clone)]
struct CacheEntry {
    state: UrlState,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// In-process dedup cache. Shard-level locking through the map's entry API
/// makes each transition atomic.
#[derive(Debug, Default)]
pub struct MemoryDedupCache {
    entries: DashMap<(Uuid, String), CacheEntry>,
}

impl MemoryDedupCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn key(execution_id: Uuid, url_hash: &str) -> (Uuid, String) {
        (execution_id, url_hash.to_string())
    }
}

#[async_trait]
impl DedupCache for MemoryDedupCache {
    async fn try_claim(&self, execution_id: Uuid, url_hash: &str) -> EngineResult<bool> {
        let claimed = CacheEntry {
            state: UrlState::Processing,
            expires_at: Some(Instant::now() + PROCESSING_TTL),
        };
        match self.entries.entry(Self::key(execution_id, url_hash)) {
            Entry::Vacant(slot) => {
                slot.insert(claimed);
                Ok(true)
            }
            Entry::Occupied(mut slot) => {
                let entry = slot.get();
                // An expired claim belongs to a dead lease and is reclaimable.
                if entry.expired() || entry.state == UrlState::Seen {
                    slot.insert(claimed);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
        }
    }

    async fn mark_completed(&self, execution_id: Uuid, url_hash: &str) -> EngineResult<()> {
        self.entries.insert(
            Self::key(execution_id, url_hash),
            CacheEntry {
                state: UrlState::Completed,
                expires_at: Some(Instant::now() + COMPLETED_TTL),
            },
        );
        Ok(())
    }

    async fn mark_failed(&self, execution_id: Uuid, url_hash: &str) -> EngineResult<()> {
        self.entries.insert(
            Self::key(execution_id, url_hash),
            CacheEntry {
                state: UrlState::Failed,
                expires_at: Some(Instant::now() + COMPLETED_TTL),
            },
        );
        Ok(())
    }

    async fn release(&self, execution_id: Uuid, url_hash: &str) -> EngineResult<()> {
        if let Some(mut entry) = self.entries.get_mut(&Self::key(execution_id, url_hash)) {
            entry.state = UrlState::Seen;
            entry.expires_at = None;
        }
        Ok(())
    }

    async fn state(&self, execution_id: Uuid, url_hash: &str) -> EngineResult<Option<UrlState>> {
        Ok(self
            .entries
            .get(&Self::key(execution_id, url_hash))
            .filter(|e| !e.expired())
            .map(|e| e.state))
    }

    async fn clear_execution(&self, execution_id: Uuid) -> EngineResult<()> {
        self.entries.retain(|(exec, _), _| *exec != execution_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn claim_is_exclusive_until_released() {
        let cache = MemoryDedupCache::new();
        let exec = Uuid::new_v4();

        assert!(cache.try_claim(exec, "h1").await.unwrap());
        assert!(!cache.try_claim(exec, "h1").await.unwrap());
        assert_eq!(
            cache.state(exec, "h1").await.unwrap(),
            Some(UrlState::Processing)
        );

        cache.release(exec, "h1").await.unwrap();
        assert!(cache.try_claim(exec, "h1").await.unwrap());
    }

    #[tokio::test]
    async fn completed_blocks_reclaim() {
        let cache = MemoryDedupCache::new();
        let exec = Uuid::new_v4();

        assert!(cache.try_claim(exec, "h1").await.unwrap());
        cache.mark_completed(exec, "h1").await.unwrap();
        assert!(!cache.try_claim(exec, "h1").await.unwrap());
        // mark_completed is idempotent
        cache.mark_completed(exec, "h1").await.unwrap();
        assert_eq!(
            cache.state(exec, "h1").await.unwrap(),
            Some(UrlState::Completed)
        );
    }

    #[tokio::test]
    async fn executions_are_isolated() {
        let cache = MemoryDedupCache::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        assert!(cache.try_claim(a, "h1").await.unwrap());
        assert!(cache.try_claim(b, "h1").await.unwrap());

        cache.clear_execution(a).await.unwrap();
        assert_eq!(cache.state(a, "h1").await.unwrap(), None);
        assert_eq!(
            cache.state(b, "h1").await.unwrap(),
            Some(UrlState::Processing)
        );
    }
}
