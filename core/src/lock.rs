/// In-memory per-key lock table with TTL semantics.
///
/// Locks are re-entrant only for the same owner and expire after their TTL,
/// so a crashed holder cannot wedge a key forever. Waiters poll with a
/// bounded jittered backoff.
use crate::errors::{StateError, StateResult};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// A held lock on one (namespace, key).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyLock {
    pub id: Uuid,
    pub namespace: String,
    pub key: String,
    pub owner: Uuid,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl KeyLock {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Lock table keyed by (namespace, key). At most one live lock per key.
pub struct LockManager {
    locks: DashMap<(String, String), KeyLock>,
    /// Poll interval bounds for waiters, milliseconds
    poll_min_ms: u64,
    poll_max_ms: u64,
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
            poll_min_ms: 5,
            poll_max_ms: 20,
        }
    }

    /// Try to take the lock once. Returns the lock id on success, the
    /// current holder on contention. Re-entrant for the same owner.
    fn try_acquire(
        &self,
        namespace: &str,
        key: &str,
        owner: Uuid,
        ttl: Duration,
    ) -> Result<Uuid, Uuid> {
        let now = Utc::now();
        let map_key = (namespace.to_string(), key.to_string());
        let mut entry = self.locks.entry(map_key).or_insert_with(|| KeyLock {
            id: Uuid::new_v4(),
            namespace: namespace.to_string(),
            key: key.to_string(),
            owner,
            acquired_at: now,
            expires_at: now + ChronoDuration::from_std(ttl).unwrap_or(ChronoDuration::seconds(30)),
        });

        if entry.owner == owner && !entry.is_expired(now) {
            // Fresh insert above, or re-entrant acquisition.
            return Ok(entry.id);
        }
        if entry.is_expired(now) {
            // Take over an expired lock.
            entry.id = Uuid::new_v4();
            entry.owner = owner;
            entry.acquired_at = now;
            entry.expires_at =
                now + ChronoDuration::from_std(ttl).unwrap_or(ChronoDuration::seconds(30));
            return Ok(entry.id);
        }
        Err(entry.owner)
    }

    /// Acquire the lock, waiting up to `wait_timeout` with jittered polling.
    /// The lock itself expires after `ttl`.
    pub async fn acquire(
        &self,
        namespace: &str,
        key: &str,
        owner: Uuid,
        ttl: Duration,
        wait_timeout: Duration,
    ) -> StateResult<Uuid> {
        let deadline = std::time::Instant::now() + wait_timeout;
        loop {
            match self.try_acquire(namespace, key, owner, ttl) {
                Ok(lock_id) => {
                    debug!(namespace, key, lock = %lock_id, "lock acquired");
                    return Ok(lock_id);
                }
                Err(_holder) => {
                    if std::time::Instant::now() >= deadline {
                        return Err(StateError::LockTimeout {
                            namespace: namespace.to_string(),
                            key: key.to_string(),
                        });
                    }
                    let wait = rand::thread_rng().gen_range(self.poll_min_ms..=self.poll_max_ms);
                    tokio::time::sleep(Duration::from_millis(wait)).await;
                }
            }
        }
    }

    /// Release a lock. When `lock_id` is given it must match the held lock.
    pub fn release(&self, namespace: &str, key: &str, lock_id: Option<Uuid>) -> bool {
        let map_key = (namespace.to_string(), key.to_string());
        match lock_id {
            Some(id) => self
                .locks
                .remove_if(&map_key, |_, held| held.id == id)
                .is_some(),
            None => self.locks.remove(&map_key).is_some(),
        }
    }

    /// Release every lock held by an owner (owner death, transaction end).
    pub fn release_owner(&self, owner: Uuid) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, held| held.owner != owner);
        before - self.locks.len()
    }

    /// Whether a live (non-expired) lock exists on the key.
    pub fn is_locked(&self, namespace: &str, key: &str) -> bool {
        let map_key = (namespace.to_string(), key.to_string());
        self.locks
            .get(&map_key)
            .map(|held| !held.is_expired(Utc::now()))
            .unwrap_or(false)
    }

    /// Whether a write under `lock_id` (possibly none) would be rejected by
    /// a lock held by someone else.
    pub fn is_locked_by_other(&self, namespace: &str, key: &str, lock_id: Option<Uuid>) -> bool {
        let map_key = (namespace.to_string(), key.to_string());
        match self.locks.get(&map_key) {
            Some(held) if !held.is_expired(Utc::now()) => Some(held.id) != lock_id,
            _ => false,
        }
    }

    /// Current live lock on a key, if any.
    pub fn get(&self, namespace: &str, key: &str) -> Option<KeyLock> {
        let map_key = (namespace.to_string(), key.to_string());
        self.locks
            .get(&map_key)
            .filter(|held| !held.is_expired(Utc::now()))
            .map(|held| held.clone())
    }

    /// Number of live locks.
    pub fn active_count(&self) -> usize {
        let now = Utc::now();
        self.locks.iter().filter(|l| !l.is_expired(now)).count()
    }

    /// Drop expired locks. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let before = self.locks.len();
        self.locks.retain(|_, held| !held.is_expired(now));
        before - self.locks.len()
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_and_release() {
        let locks = LockManager::new();
        let owner = Uuid::new_v4();
        let id = locks
            .acquire("ns", "k", owner, Duration::from_secs(5), Duration::from_millis(50))
            .await
            .unwrap();
        assert!(locks.is_locked("ns", "k"));
        assert!(locks.release("ns", "k", Some(id)));
        assert!(!locks.is_locked("ns", "k"));
    }

    #[tokio::test]
    async fn test_contended_acquire_times_out() {
        let locks = LockManager::new();
        locks
            .acquire("ns", "k", Uuid::new_v4(), Duration::from_secs(5), Duration::from_millis(20))
            .await
            .unwrap();

        let result = locks
            .acquire("ns", "k", Uuid::new_v4(), Duration::from_secs(5), Duration::from_millis(60))
            .await;
        assert!(matches!(result, Err(StateError::LockTimeout { .. })));
    }

    #[tokio::test]
    async fn test_reentrant_for_same_owner_only() {
        let locks = LockManager::new();
        let owner = Uuid::new_v4();
        let first = locks
            .acquire("ns", "k", owner, Duration::from_secs(5), Duration::from_millis(20))
            .await
            .unwrap();
        let again = locks
            .acquire("ns", "k", owner, Duration::from_secs(5), Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(first, again);
    }

    #[tokio::test]
    async fn test_expired_lock_can_be_taken_over() {
        let locks = LockManager::new();
        locks
            .acquire("ns", "k", Uuid::new_v4(), Duration::from_millis(10), Duration::from_millis(20))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let second_owner = Uuid::new_v4();
        let id = locks
            .acquire("ns", "k", second_owner, Duration::from_secs(5), Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(locks.get("ns", "k").unwrap().id, id);
        assert_eq!(locks.get("ns", "k").unwrap().owner, second_owner);
    }

    #[tokio::test]
    async fn test_release_owner_clears_all() {
        let locks = LockManager::new();
        let owner = Uuid::new_v4();
        for key in ["a", "b", "c"] {
            locks
                .acquire("ns", key, owner, Duration::from_secs(5), Duration::from_millis(20))
                .await
                .unwrap();
        }
        assert_eq!(locks.active_count(), 3);
        assert_eq!(locks.release_owner(owner), 3);
        assert_eq!(locks.active_count(), 0);
    }

    #[tokio::test]
    async fn test_wrong_lock_id_does_not_release() {
        let locks = LockManager::new();
        let owner = Uuid::new_v4();
        locks
            .acquire("ns", "k", owner, Duration::from_secs(5), Duration::from_millis(20))
            .await
            .unwrap();
        assert!(!locks.release("ns", "k", Some(Uuid::new_v4())));
        assert!(locks.is_locked("ns", "k"));
    }
}
