//! Per-user advisory round lock
//!
//! Keeps one user from running two instant rounds at once. A lease expires
//! after its TTL instead of blocking forever; the holder renews it right
//! before commit and aborts if another round has taken it over.

use crate::errors::{LedgerError, LedgerResult};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct Lease {
    token: u64,
    expires_at: Instant,
}

#[derive(Clone)]
pub struct RoundLocks {
    leases: Arc<DashMap<String, Lease>>,
    next_token: Arc<AtomicU64>,
    ttl: Duration,
}

impl RoundLocks {
    pub fn new(ttl: Duration) -> Self {
        Self {
            leases: Arc::new(DashMap::new()),
            next_token: Arc::new(AtomicU64::new(1)),
            ttl,
        }
    }

    /// Take the lease for `user_id`, or fail with `RoundInProgress` while a
    /// live lease exists.
    pub fn acquire(&self, user_id: &str) -> LedgerResult<RoundLockGuard> {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        let lease = Lease {
            token,
            expires_at: now + self.ttl,
        };

        match self.leases.entry(user_id.to_string()) {
            Entry::Occupied(mut held) => {
                if held.get().expires_at > now {
                    return Err(LedgerError::RoundInProgress(user_id.to_string()));
                }
                tracing::debug!(user_id, "Taking over expired round lock");
                held.insert(lease);
            }
            Entry::Vacant(slot) => {
                slot.insert(lease);
            }
        }

        Ok(RoundLockGuard {
            leases: self.leases.clone(),
            user_id: user_id.to_string(),
            token,
            ttl: self.ttl,
        })
    }

    pub fn is_locked(&self, user_id: &str) -> bool {
        self.leases
            .get(user_id)
            .map(|lease| lease.expires_at > Instant::now())
            .unwrap_or(false)
    }
}

/// Held lease; released on drop
pub struct RoundLockGuard {
    leases: Arc<DashMap<String, Lease>>,
    user_id: String,
    token: u64,
    ttl: Duration,
}

impl RoundLockGuard {
    /// Extend the lease if it is still ours.
    pub fn renew(&self) -> LedgerResult<()> {
        match self.leases.get_mut(&self.user_id) {
            Some(mut lease) if lease.token == self.token => {
                lease.expires_at = Instant::now() + self.ttl;
                Ok(())
            }
            _ => {
                tracing::warn!(user_id = %self.user_id, "Round lock lost before commit");
                Err(LedgerError::RoundInProgress(self.user_id.clone()))
            }
        }
    }
}

impl Drop for RoundLockGuard {
    fn drop(&mut self) {
        self.leases.remove_if(&self.user_id, |_, lease| lease.token == self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_is_rejected() {
        let locks = RoundLocks::new(Duration::from_secs(3));
        let _guard = locks.acquire("alice").unwrap();

        let err = locks.acquire("alice").err().unwrap();
        assert!(matches!(err, LedgerError::RoundInProgress(_)));
        assert!(locks.acquire("bob").is_ok());
    }

    #[test]
    fn test_drop_releases() {
        let locks = RoundLocks::new(Duration::from_secs(3));
        {
            let _guard = locks.acquire("alice").unwrap();
            assert!(locks.is_locked("alice"));
        }
        assert!(!locks.is_locked("alice"));
        assert!(locks.acquire("alice").is_ok());
    }

    #[test]
    fn test_expired_lease_is_taken_over_and_old_holder_cannot_renew() {
        let locks = RoundLocks::new(Duration::from_millis(10));
        let stale = locks.acquire("alice").unwrap();
        std::thread::sleep(Duration::from_millis(25));

        let fresh = locks.acquire("alice").unwrap();
        assert!(stale.renew().is_err());
        assert!(fresh.renew().is_ok());

        // Dropping the stale guard must not release the new lease.
        drop(stale);
        assert!(locks.is_locked("alice"));
    }
}
