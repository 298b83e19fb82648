//! Transaction coordinator
//!
//! Runs a unit of work inside one RocksDB transaction. Every balance mutation,
//! journal append and index update made through the [`Scope`] commits together
//! or not at all. Row locks are taken with `get_for_update`, so two scopes
//! touching the same wallet serialize instead of overwriting each other.
//!
//! Lock timeouts, deadlocks and busy results surface as
//! [`LedgerError::Conflict`]; the whole unit is then re-run from scratch with
//! exponential backoff until the attempt budget is spent.

use crate::config::CoordinatorConfig;
use crate::errors::{LedgerError, LedgerResult};
use crate::events::{EventBus, PlatformEvent};
use crate::metrics::LedgerMetrics;
use crate::storage::{decode, encode, LedgerStorage};
use rand::Rng;
use rocksdb::{Transaction, TransactionDB};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// One attempt of a unit of work
pub struct Scope<'a> {
    txn: Transaction<'a, TransactionDB>,
    events: Vec<PlatformEvent>,
    now: i64,
    attempt: u32,
}

impl<'a> Scope<'a> {
    fn new(txn: Transaction<'a, TransactionDB>, attempt: u32) -> Self {
        Self {
            txn,
            events: Vec::new(),
            now: crate::now_millis(),
            attempt,
        }
    }

    /// Wall-clock time fixed when the attempt started.
    pub fn now(&self) -> i64 {
        self.now
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Read and exclusively lock `key` until the scope ends.
    pub fn get_for_update<T: DeserializeOwned>(&self, key: &str) -> LedgerResult<Option<T>> {
        match self.txn.get_for_update(key.as_bytes(), true)? {
            Some(bytes) => Ok(Some(decode(key.as_bytes(), &bytes)?)),
            None => Ok(None),
        }
    }

    /// Read without locking. Sees this scope's own writes.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> LedgerResult<Option<T>> {
        match self.txn.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(decode(key.as_bytes(), &bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put<T: Serialize>(&self, key: &str, value: &T) -> LedgerResult<()> {
        self.txn.put(key.as_bytes(), encode(value)?)?;
        Ok(())
    }

    /// Index entries carry no value.
    pub fn put_marker(&self, key: &str) -> LedgerResult<()> {
        self.txn.put(key.as_bytes(), b"")?;
        Ok(())
    }

    pub fn delete(&self, key: &str) -> LedgerResult<()> {
        self.txn.delete(key.as_bytes())?;
        Ok(())
    }

    /// Queue an event for publication after a successful commit.
    pub fn emit(&mut self, event: PlatformEvent) {
        self.events.push(event);
    }

    fn commit(self) -> LedgerResult<Vec<PlatformEvent>> {
        self.txn.commit()?;
        Ok(self.events)
    }

    fn rollback(self) {
        if let Err(e) = self.txn.rollback() {
            tracing::trace!(error = %e, "Rollback of aborted scope failed");
        }
    }
}

/// All-or-nothing executor shared by every engine
#[derive(Clone)]
pub struct TransactionCoordinator {
    storage: LedgerStorage,
    config: CoordinatorConfig,
    events: EventBus,
    metrics: Arc<LedgerMetrics>,
}

impl TransactionCoordinator {
    pub fn new(
        storage: LedgerStorage,
        config: CoordinatorConfig,
        events: EventBus,
        metrics: Arc<LedgerMetrics>,
    ) -> Self {
        Self {
            storage,
            config,
            events,
            metrics,
        }
    }

    pub fn storage(&self) -> &LedgerStorage {
        &self.storage
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn metrics(&self) -> &Arc<LedgerMetrics> {
        &self.metrics
    }

    /// Run `work` atomically, retrying the whole unit on write conflicts.
    ///
    /// `work` may run more than once and must not have side effects outside
    /// the scope. Events emitted on the scope are published only once the
    /// attempt that produced them has committed.
    pub fn execute<T, F>(&self, label: &str, mut work: F) -> LedgerResult<T>
    where
        F: FnMut(&mut Scope<'_>) -> LedgerResult<T>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut scope = Scope::new(self.storage.begin(), attempt);

            let outcome = match work(&mut scope) {
                Ok(value) => scope.commit().map(|events| (value, events)),
                Err(e) => {
                    scope.rollback();
                    Err(e)
                }
            };

            match outcome {
                Ok((value, events)) => {
                    LedgerMetrics::inc(&self.metrics.commits_total);
                    if attempt > 1 {
                        tracing::debug!(unit = label, attempt, "Committed after retry");
                    }
                    self.events.publish_all(events);
                    return Ok(value);
                }
                Err(LedgerError::Conflict { reason, .. }) if attempt < self.config.max_attempts => {
                    LedgerMetrics::inc(&self.metrics.conflicts_retried_total);
                    let delay = self.backoff(attempt);
                    tracing::debug!(unit = label, attempt, delay_ms = delay.as_millis() as u64, %reason, "Write conflict, retrying");
                    std::thread::sleep(delay);
                }
                Err(LedgerError::Conflict { reason, .. }) => {
                    LedgerMetrics::inc(&self.metrics.conflicts_surfaced_total);
                    tracing::warn!(unit = label, attempts = attempt, %reason, "Write conflict, giving up");
                    return Err(LedgerError::Conflict {
                        attempts: attempt,
                        reason,
                    });
                }
                Err(e) => {
                    LedgerMetrics::inc(&self.metrics.aborts_total);
                    tracing::debug!(unit = label, error = %e, "Scope aborted");
                    return Err(e);
                }
            }
        }
    }

    /// Exponential backoff with up to 50% random jitter.
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .config
            .base_backoff_ms
            .saturating_mul(1u64 << attempt.saturating_sub(1).min(16));
        let capped = exp.min(self.config.max_backoff_ms);
        let jitter = if capped > 1 {
            rand::thread_rng().gen_range(0..=capped / 2)
        } else {
            0
        };
        Duration::from_millis(capped + jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn coordinator(dir: &std::path::Path, max_attempts: u32) -> TransactionCoordinator {
        let storage = LedgerStorage::open_path(dir).unwrap();
        let metrics = LedgerMetrics::new();
        let config = CoordinatorConfig {
            max_attempts,
            base_backoff_ms: 1,
            max_backoff_ms: 2,
        };
        TransactionCoordinator::new(storage, config, EventBus::new(metrics.clone()), metrics)
    }

    #[test]
    fn test_commit_is_visible() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = coordinator(dir.path(), 3);

        coordinator
            .execute("put", |scope| scope.put("k", &42_u32))
            .unwrap();

        let value: Option<u32> = coordinator.storage().get_json(b"k").unwrap();
        assert_eq!(value, Some(42));
    }

    #[test]
    fn test_error_rolls_back_every_write() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = coordinator(dir.path(), 3);

        let result: LedgerResult<()> = coordinator.execute("fail", |scope| {
            scope.put("a", &1_u32)?;
            scope.put("b", &2_u32)?;
            Err(LedgerError::invalid("boom"))
        });

        assert!(result.is_err());
        assert!(coordinator.storage().get(b"a").unwrap().is_none());
        assert!(coordinator.storage().get(b"b").unwrap().is_none());
    }

    #[test]
    fn test_conflict_is_retried_then_surfaced() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = coordinator(dir.path(), 3);
        let calls = AtomicU32::new(0);

        let result: LedgerResult<()> = coordinator.execute("always-conflict", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(LedgerError::Conflict {
                attempts: 1,
                reason: "busy".to_string(),
            })
        });

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result {
            Err(LedgerError::Conflict { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected conflict, got {:?}", other.map(|_| ())),
        }
        assert_eq!(LedgerMetrics::get(&coordinator.metrics().conflicts_retried_total), 2);
    }

    #[test]
    fn test_conflict_then_success() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = coordinator(dir.path(), 3);
        let calls = AtomicU32::new(0);

        let value = coordinator
            .execute("flaky", |scope| {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    scope.put("partial", &1_u32)?;
                    return Err(LedgerError::Conflict {
                        attempts: 1,
                        reason: "busy".to_string(),
                    });
                }
                scope.put("done", &scope.attempt())?;
                Ok(scope.attempt())
            })
            .unwrap();

        assert_eq!(value, 2);
        assert!(coordinator.storage().get(b"partial").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_events_published_only_after_commit() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = coordinator(dir.path(), 1);
        let mut rx = coordinator.events().subscribe();

        let event = PlatformEvent::LotteryDrawStart {
            slot_id: "s".to_string(),
            tier: "quick".to_string(),
            reveal_at: 0,
        };

        let _ = coordinator.execute("aborted", |scope| -> LedgerResult<()> {
            scope.emit(event.clone());
            Err(LedgerError::invalid("no"))
        });
        assert!(rx.try_recv().is_err());

        coordinator
            .execute("committed", |scope| {
                scope.emit(event.clone());
                Ok(())
            })
            .unwrap();
        assert_eq!(rx.recv().await.unwrap(), event);
    }
}
