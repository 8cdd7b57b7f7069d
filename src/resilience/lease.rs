//! Lease locks for cross-store writes
//!
//! A lease is a KV key `lock:{resource}` holding a random token with a TTL.
//! Only the token holder can renew or release it (compare-and-swap on the
//! token), and a crashed holder's lease simply expires.
//!
//! Leases:
//! - Acquire with `set_if_absent`, retrying with exponential backoff + jitter
//! - Renew in a background task at a fraction of the TTL
//! - Release on completion or failure; `Drop` releases as a safety net

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::constants::{LOCK_ACQUIRE_ATTEMPTS, LOCK_BACKOFF_MS, LOCK_RENEW_FRACTION, LOCK_TTL_MS};
use crate::errors::{MemoryError, Result};
use crate::metrics::LOCK_ACQUISITIONS_TOTAL;
use crate::storage::KvStore;

#[derive(Debug, Clone)]
pub struct LeaseConfig {
    pub ttl: Duration,
    pub renew_interval: Duration,
    pub acquire_attempts: u32,
    pub backoff: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self::with_ttl(Duration::from_millis(LOCK_TTL_MS))
    }
}

impl LeaseConfig {
    /// Renewal interval derived from the TTL
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            renew_interval: ttl.mul_f64(LOCK_RENEW_FRACTION),
            acquire_attempts: LOCK_ACQUIRE_ATTEMPTS,
            backoff: Duration::from_millis(LOCK_BACKOFF_MS),
        }
    }
}

#[derive(Clone)]
pub struct LeaseLock {
    kv: Arc<dyn KvStore>,
    config: LeaseConfig,
}

impl LeaseLock {
    pub fn new(kv: Arc<dyn KvStore>, config: LeaseConfig) -> Self {
        Self { kv, config }
    }

    fn key(resource: &str) -> String {
        format!("lock:{resource}")
    }

    /// Single acquisition attempt
    pub async fn try_acquire(&self, resource: &str) -> Result<Option<LeaseGuard>> {
        let key = Self::key(resource);
        let token = uuid::Uuid::new_v4().to_string();
        if !self
            .kv
            .set_if_absent(&key, token.as_bytes(), Some(self.config.ttl))
            .await?
        {
            return Ok(None);
        }
        debug!(resource, "Lease acquired");
        Ok(Some(LeaseGuard::start(
            resource.to_string(),
            key,
            token,
            self.kv.clone(),
            self.config.clone(),
        )))
    }

    /// Acquire with backoff, failing with `LockAcquisition` once attempts run out
    pub async fn acquire(&self, resource: &str) -> Result<LeaseGuard> {
        let attempts = self.config.acquire_attempts.max(1);
        for attempt in 0..attempts {
            if let Some(guard) = self.try_acquire(resource).await? {
                LOCK_ACQUISITIONS_TOTAL.with_label_values(&["acquired"]).inc();
                return Ok(guard);
            }
            if attempt + 1 < attempts {
                let base = self.config.backoff.as_millis() as u64;
                let jitter = rand::thread_rng().gen_range(0..=base.max(1));
                let delay = base.saturating_mul(1 << attempt.min(10)) + jitter;
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
        }
        LOCK_ACQUISITIONS_TOTAL.with_label_values(&["contended"]).inc();
        Err(MemoryError::lock_failed(
            resource,
            &format!("held by another worker after {attempts} attempts"),
        ))
    }
}

/// Held lease; renews itself until released or dropped
pub struct LeaseGuard {
    resource: String,
    key: String,
    token: String,
    kv: Arc<dyn KvStore>,
    stop_tx: Option<watch::Sender<bool>>,
    renewal: Option<JoinHandle<()>>,
}

impl LeaseGuard {
    fn start(
        resource: String,
        key: String,
        token: String,
        kv: Arc<dyn KvStore>,
        config: LeaseConfig,
    ) -> Self {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let renew_kv = kv.clone();
        let renew_key = key.clone();
        let renew_token = token.clone();

        let renewal = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(config.renew_interval) => {}
                    _ = stop_rx.changed() => break,
                }
                if *stop_rx.borrow() {
                    break;
                }
                let token = renew_token.as_bytes();
                match renew_kv
                    .compare_and_swap(&renew_key, Some(token), Some(token), Some(config.ttl))
                    .await
                {
                    Ok(true) => debug!(key = %renew_key, "Lease renewed"),
                    Ok(false) => {
                        warn!(key = %renew_key, "Lease lost before renewal");
                        break;
                    }
                    Err(e) => warn!(key = %renew_key, error = %e, "Lease renewal failed"),
                }
            }
        });

        Self {
            resource,
            key,
            token,
            kv,
            stop_tx: Some(stop_tx),
            renewal: Some(renewal),
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    fn stop_renewal(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(true);
        }
        if let Some(handle) = self.renewal.take() {
            handle.abort();
        }
    }

    /// Release the lease; returns false if it had already expired or changed hands
    pub async fn release(mut self) -> Result<bool> {
        self.stop_renewal();
        let released = self
            .kv
            .compare_and_swap(&self.key, Some(self.token.as_bytes()), None, None)
            .await?;
        if !released {
            warn!(resource = %self.resource, "Lease was no longer held at release");
        }
        // Mark as released so Drop does nothing
        self.token.clear();
        Ok(released)
    }
}

impl std::fmt::Debug for LeaseGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseGuard")
            .field("resource", &self.resource)
            .field("key", &self.key)
            .field("released", &self.token.is_empty())
            .finish()
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.stop_renewal();
        if self.token.is_empty() {
            return;
        }
        let kv = self.kv.clone();
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = kv
                    .compare_and_swap(&key, Some(token.as_bytes()), None, None)
                    .await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::MemoryKv;

    fn lock() -> (LeaseLock, Arc<MemoryKv>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        let kv = Arc::new(MemoryKv::new(clock.clone()));
        let config = LeaseConfig {
            ttl: Duration::from_secs(10),
            renew_interval: Duration::from_secs(5),
            acquire_attempts: 2,
            backoff: Duration::from_millis(1),
        };
        (LeaseLock::new(kv.clone(), config), kv, clock)
    }

    #[tokio::test]
    async fn test_exclusive_until_released() {
        let (lock, _, _) = lock();
        let guard = lock.acquire("episode:s1").await.unwrap();

        let err = lock.acquire("episode:s1").await.unwrap_err();
        assert_eq!(err.code(), "LOCK_ACQUISITION_FAILED");
        assert!(lock.acquire("episode:s2").await.is_ok());

        assert!(guard.release().await.unwrap());
        assert!(lock.acquire("episode:s1").await.is_ok());
    }

    #[tokio::test]
    async fn test_expired_lease_is_claimable() {
        let (lock, _, clock) = lock();
        let stale = lock.acquire("episode:s1").await.unwrap();
        clock.advance(chrono::Duration::seconds(11));

        let fresh = lock.acquire("episode:s1").await.unwrap();
        assert_ne!(fresh.token(), stale.token());
        // The stale holder cannot release the new holder's lease
        assert!(!stale.release().await.unwrap());
        assert!(fresh.release().await.unwrap());
    }

    #[tokio::test]
    async fn test_drop_releases() {
        let (lock, kv, _) = lock();
        {
            let _guard = lock.acquire("episode:s1").await.unwrap();
        }
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(kv.get("lock:episode:s1").await.unwrap().is_none());
    }
}
