//! Registry of running operations and their cooperative cancellation flags.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use billsync_core::{CancellationToken, Clock, OperationKey, SyncError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveOperation {
    pub operation_key: OperationKey,
    pub started_at: DateTime<Utc>,
    pub cancel_requested: bool,
}

pub struct CancellationRegistry {
    clock: Arc<dyn Clock>,
    active: Mutex<HashMap<OperationKey, Arc<CancellationToken>>>,
}

impl CancellationRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            active: Mutex::new(HashMap::new()),
        }
    }

    fn active_map(&self) -> MutexGuard<'_, HashMap<OperationKey, Arc<CancellationToken>>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers a run. The returned guard releases the key when dropped.
    pub fn register(self: &Arc<Self>, key: OperationKey) -> Result<RunGuard, SyncError> {
        let mut active = self.active_map();
        if active.contains_key(&key) {
            return Err(SyncError::AlreadyRunning(key.to_string()));
        }
        let token = Arc::new(CancellationToken::new(key.clone(), self.clock.now()));
        active.insert(key.clone(), token.clone());
        debug!(operation_key = %key, "operation registered");
        Ok(RunGuard {
            registry: self.clone(),
            token,
        })
    }

    /// Returns false when nothing is running under `key`.
    pub fn cancel(&self, key: &OperationKey) -> bool {
        match self.active_map().get(key) {
            Some(token) => {
                token.cancel();
                info!(operation_key = %key, "cancellation requested");
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) -> Vec<OperationKey> {
        let active = self.active_map();
        let mut keys: Vec<OperationKey> = active
            .iter()
            .map(|(key, token)| {
                token.cancel();
                key.clone()
            })
            .collect();
        keys.sort();
        if !keys.is_empty() {
            info!(count = keys.len(), "cancellation requested for all operations");
        }
        keys
    }

    pub fn is_cancelled(&self, key: &OperationKey) -> bool {
        self.active_map()
            .get(key)
            .is_some_and(|token| token.is_cancelled())
    }

    pub fn release(&self, key: &OperationKey) {
        self.active_map().remove(key);
    }

    /// Running operations, oldest first.
    pub fn active(&self) -> Vec<ActiveOperation> {
        let mut out: Vec<ActiveOperation> = self
            .active_map()
            .values()
            .map(|token| ActiveOperation {
                operation_key: token.operation_key().clone(),
                started_at: token.started_at(),
                cancel_requested: token.is_cancelled(),
            })
            .collect();
        out.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.operation_key.cmp(&b.operation_key))
        });
        out
    }

    fn release_token(&self, token: &Arc<CancellationToken>) {
        let mut active = self.active_map();
        let ours = active
            .get(token.operation_key())
            .is_some_and(|current| Arc::ptr_eq(current, token));
        if ours {
            active.remove(token.operation_key());
        }
    }
}

/// Keeps an operation registered for exactly as long as the run lives.
pub struct RunGuard {
    registry: Arc<CancellationRegistry>,
    token: Arc<CancellationToken>,
}

impl RunGuard {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn operation_key(&self) -> &OperationKey {
        self.token.operation_key()
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.registry.release_token(&self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use billsync_core::{EntityKind, FixedClock, Tier};
    use chrono::TimeZone;

    fn registry() -> Arc<CancellationRegistry> {
        Arc::new(CancellationRegistry::new(Arc::new(FixedClock(
            Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).unwrap(),
        ))))
    }

    #[test]
    fn guard_releases_on_drop() {
        let registry = registry();
        let key = OperationKey::scheduled(EntityKind::Payments, Tier::Hot);
        {
            let _guard = registry.register(key.clone()).unwrap();
            assert_eq!(registry.active().len(), 1);
            assert!(matches!(
                registry.register(key.clone()),
                Err(SyncError::AlreadyRunning(_))
            ));
        }
        assert!(registry.active().is_empty());
        assert!(registry.register(key).is_ok());
    }

    #[test]
    fn cancel_reaches_the_running_token() {
        let registry = registry();
        let key = OperationKey::scheduled(EntityKind::TimeEntries, Tier::Warm);
        let guard = registry.register(key.clone()).unwrap();
        assert!(!registry.is_cancelled(&key));
        assert!(registry.cancel(&key));
        assert!(registry.is_cancelled(&key));
        assert!(guard.token().check().unwrap_err().is_cancelled());
        assert!(!registry.cancel(&OperationKey::from("payments:cold")));
    }

    #[test]
    fn cancel_all_flags_every_operation() {
        let registry = registry();
        let a = registry
            .register(OperationKey::scheduled(EntityKind::Payments, Tier::Hot))
            .unwrap();
        let b = registry
            .register(OperationKey::scheduled(EntityKind::Payments, Tier::Cold))
            .unwrap();
        let keys = registry.cancel_all();
        assert_eq!(keys.len(), 2);
        assert!(a.token().is_cancelled());
        assert!(b.token().is_cancelled());
        assert!(registry.active().iter().all(|op| op.cancel_requested));
    }

    #[test]
    fn explicit_release_does_not_let_old_guard_evict_new_run() {
        let registry = registry();
        let key = OperationKey::from("payments:custom:2026-01-01..2026-01-31");
        let first = registry.register(key.clone()).unwrap();
        registry.release(&key);
        let second = registry.register(key.clone()).unwrap();
        drop(first);
        assert_eq!(registry.active().len(), 1);
        drop(second);
        assert!(registry.active().is_empty());
    }
}
