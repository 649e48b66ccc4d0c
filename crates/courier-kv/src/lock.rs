//! Per-conversation distributed mutex.
//!
//! Acquire = SET NX PX with a fencing token; heartbeat extends the TTL every
//! 10 s while the token still matches; release = compare-and-delete. If the
//! holder dies, the TTL expires the lock and a waiter takes over.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::store::KvStore;
use crate::token::lock_token;

pub const LOCK_TTL: Duration = Duration::from_secs(90);
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
pub const ACQUIRE_RETRIES: u32 = 60;
pub const ACQUIRE_RETRY_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum LockError {
    /// All acquisition retries exhausted. The enclosing job should fail so
    /// its queue retries it. Backpressure, not a user error.
    #[error("lock contended: {key}")]
    Contended { key: String },

    #[error(transparent)]
    Kv(#[from] crate::error::KvError),
}

/// Held lock. Keeps a heartbeat task alive until released or dropped.
/// Dropping without `release()` stops the heartbeat and lets the TTL expire
/// the lock; explicit release frees it immediately.
pub struct ChatLockGuard {
    kv: Arc<dyn KvStore>,
    key: String,
    token: String,
    heartbeat_stop: CancellationToken,
}

impl ChatLockGuard {
    /// Acquire the lock at `key`, retrying up to 60 times at 250 ms.
    pub async fn acquire(kv: Arc<dyn KvStore>, key: &str) -> Result<Self, LockError> {
        let token = lock_token()?;

        for attempt in 0..ACQUIRE_RETRIES {
            if kv.set_nx_px(key, &token, LOCK_TTL).await? {
                debug!(key, attempt, "chat lock acquired");
                let guard = Self {
                    kv: Arc::clone(&kv),
                    key: key.to_string(),
                    token,
                    heartbeat_stop: CancellationToken::new(),
                };
                guard.spawn_heartbeat();
                return Ok(guard);
            }
            tokio::time::sleep(ACQUIRE_RETRY_INTERVAL).await;
        }

        Err(LockError::Contended {
            key: key.to_string(),
        })
    }

    fn spawn_heartbeat(&self) {
        let kv = Arc::clone(&self.kv);
        let key = self.key.clone();
        let token = self.token.clone();
        let stop = self.heartbeat_stop.clone();

        tokio::spawn(async move {
            let mut warned = false;
            let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
            interval.tick().await; // first tick fires immediately; skip it
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match kv.expire_if_eq(&key, &token, LOCK_TTL).await {
                            Ok(true) => {}
                            Ok(false) => {
                                // Token no longer ours: lock expired or was
                                // taken over. The work continues; the next
                                // cycle reacquires.
                                if !warned {
                                    warn!(key, "chat lock heartbeat lost ownership");
                                    warned = true;
                                }
                            }
                            Err(e) => {
                                if !warned {
                                    warn!(key, error = %e, "chat lock heartbeat failed");
                                    warned = true;
                                }
                            }
                        }
                    }
                    _ = stop.cancelled() => break,
                }
            }
        });
    }

    /// Release the lock. Only deletes when the stored token is still ours;
    /// failures are non-fatal (the TTL cleans up).
    pub async fn release(self) {
        self.heartbeat_stop.cancel();
        match self.kv.delete_if_eq(&self.key, &self.token).await {
            Ok(true) => debug!(key = %self.key, "chat lock released"),
            Ok(false) => debug!(key = %self.key, "chat lock already expired at release"),
            Err(e) => warn!(key = %self.key, error = %e, "chat lock release failed"),
        }
    }
}

impl Drop for ChatLockGuard {
    fn drop(&mut self) {
        self.heartbeat_stop.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKv;

    #[tokio::test]
    async fn acquire_and_release() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let guard = ChatLockGuard::acquire(Arc::clone(&kv), "lock:chat:1")
            .await
            .unwrap();
        assert!(kv.get("lock:chat:1").await.unwrap().is_some());
        guard.release().await;
        assert!(kv.get("lock:chat:1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn second_acquire_waits_for_release() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let first = ChatLockGuard::acquire(Arc::clone(&kv), "lock:chat:2")
            .await
            .unwrap();

        let kv2 = Arc::clone(&kv);
        let waiter = tokio::spawn(async move {
            ChatLockGuard::acquire(kv2, "lock:chat:2").await.unwrap()
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!waiter.is_finished());

        first.release().await;
        let second = waiter.await.unwrap();
        second.release().await;
    }

    #[tokio::test]
    async fn release_does_not_delete_foreign_token() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let guard = ChatLockGuard::acquire(Arc::clone(&kv), "lock:chat:3")
            .await
            .unwrap();
        // Simulate expiry + takeover by another holder.
        kv.delete("lock:chat:3").await.unwrap();
        kv.set_nx_px("lock:chat:3", "other", LOCK_TTL).await.unwrap();
        guard.release().await;
        assert_eq!(
            kv.get("lock:chat:3").await.unwrap().as_deref(),
            Some("other")
        );
    }
}
