//! Shared KV store abstraction.
//!
//! Rate-limit counters, approval confirmation markers, notice cooldowns, and
//! chat locks all go through this trait. Each operation is a single atomic
//! step against the backing store; the in-process implementation gets this
//! from dashmap's per-entry locking; a networked implementation would use
//! the store's atomic primitives or a server-side script.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::Result;

/// Result of an increment: the post-increment count and the remaining
/// window in whole seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Counter {
    pub count: u64,
    pub ttl_secs: u64,
}

#[async_trait]
pub trait KvStore: Send + Sync {
    /// Increment the counter at `key`, setting `ttl` only when the key is
    /// created (or had expired). One round trip.
    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<Counter>;

    /// SET if-not-exists with TTL. Returns `true` when this call set the value.
    async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Read the live value at `key`.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Extend the TTL iff the stored value equals `expected`.
    /// Returns `true` when extended.
    async fn expire_if_eq(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool>;

    /// Delete iff the stored value equals `expected` (compare-and-delete).
    /// Returns `true` when deleted.
    async fn delete_if_eq(&self, key: &str, expected: &str) -> Result<bool>;

    /// Unconditional delete.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Liveness check for readiness probes.
    async fn ping(&self) -> Result<()>;
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    count: u64,
    expires_at: Instant,
}

/// In-process KV store. Entries are reaped lazily: an expired entry is
/// treated as absent and replaced on the next write.
#[derive(Default)]
pub struct MemoryKv {
    map: DashMap<String, Entry>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn live<'a>(entry: &'a Entry, now: Instant) -> Option<&'a Entry> {
        (entry.expires_at > now).then_some(entry)
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<Counter> {
        let now = Instant::now();
        let mut entry = self.map.entry(key.to_string()).or_insert_with(|| Entry {
            value: String::new(),
            count: 0,
            expires_at: now + ttl,
        });
        if entry.expires_at <= now {
            // Window elapsed: start a fresh one.
            entry.count = 0;
            entry.expires_at = now + ttl;
        }
        entry.count += 1;
        Ok(Counter {
            count: entry.count,
            ttl_secs: entry.expires_at.saturating_duration_since(now).as_secs(),
        })
    }

    async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut set = false;
        let mut entry = self.map.entry(key.to_string()).or_insert_with(|| {
            set = true;
            Entry {
                value: value.to_string(),
                count: 0,
                expires_at: now + ttl,
            }
        });
        if !set && entry.expires_at <= now {
            entry.value = value.to_string();
            entry.expires_at = now + ttl;
            set = true;
        }
        Ok(set)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        Ok(self
            .map
            .get(key)
            .and_then(|e| Self::live(&e, now).map(|e| e.value.clone())))
    }

    async fn expire_if_eq(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        if let Some(mut entry) = self.map.get_mut(key) {
            if entry.expires_at > now && entry.value == expected {
                entry.expires_at = now + ttl;
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn delete_if_eq(&self, key: &str, expected: &str) -> Result<bool> {
        let now = Instant::now();
        let removed = self
            .map
            .remove_if(key, |_, e| e.expires_at > now && e.value == expected);
        Ok(removed.is_some())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.map.remove(key);
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn incr_counts_within_window() {
        let kv = MemoryKv::new();
        let ttl = Duration::from_secs(60);
        assert_eq!(kv.incr_with_ttl("k", ttl).await.unwrap().count, 1);
        assert_eq!(kv.incr_with_ttl("k", ttl).await.unwrap().count, 2);
        assert_eq!(kv.incr_with_ttl("k", ttl).await.unwrap().count, 3);
    }

    #[tokio::test]
    async fn incr_resets_after_expiry() {
        let kv = MemoryKv::new();
        let ttl = Duration::from_millis(20);
        assert_eq!(kv.incr_with_ttl("k", ttl).await.unwrap().count, 1);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(kv.incr_with_ttl("k", ttl).await.unwrap().count, 1);
    }

    #[tokio::test]
    async fn set_nx_px_only_first_wins() {
        let kv = MemoryKv::new();
        let ttl = Duration::from_secs(30);
        assert!(kv.set_nx_px("m", "a", ttl).await.unwrap());
        assert!(!kv.set_nx_px("m", "b", ttl).await.unwrap());
        assert_eq!(kv.get("m").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn set_nx_px_succeeds_after_expiry() {
        let kv = MemoryKv::new();
        assert!(kv
            .set_nx_px("m", "a", Duration::from_millis(10))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(kv.set_nx_px("m", "b", Duration::from_secs(5)).await.unwrap());
        assert_eq!(kv.get("m").await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn expired_key_reads_as_absent() {
        let kv = MemoryKv::new();
        kv.set_nx_px("m", "a", Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(kv.get("m").await.unwrap(), None);
    }

    #[tokio::test]
    async fn delete_if_eq_respects_value() {
        let kv = MemoryKv::new();
        kv.set_nx_px("m", "mine", Duration::from_secs(30))
            .await
            .unwrap();
        assert!(!kv.delete_if_eq("m", "other").await.unwrap());
        assert!(kv.delete_if_eq("m", "mine").await.unwrap());
        assert_eq!(kv.get("m").await.unwrap(), None);
    }

    #[tokio::test]
    async fn expire_if_eq_extends_only_own_value() {
        let kv = MemoryKv::new();
        kv.set_nx_px("m", "mine", Duration::from_millis(50))
            .await
            .unwrap();
        assert!(!kv
            .expire_if_eq("m", "other", Duration::from_secs(60))
            .await
            .unwrap());
        assert!(kv
            .expire_if_eq("m", "mine", Duration::from_secs(60))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(kv.get("m").await.unwrap().as_deref(), Some("mine"));
    }
}
