//! Facade the control plane and the scheduler drive.

use std::sync::Arc;

use async_trait::async_trait;
use billsync_core::{
    Clock, DateRange, EntityKind, OperationKey, OperationLogEntry, SyncError, SyncMode, SyncWindow,
    Tier,
};
use billsync_storage::LedgerStore;
use billsync_upstream::RecordSource;
use chrono::NaiveDate;
use serde::Serialize;
use tracing::{info, warn};

use crate::cancel::{ActiveOperation, CancellationRegistry};
use crate::engine::{EngineConfig, ReconcileOutcome, ReconciliationEngine};
use crate::oplog::{MonthCoverage, OperationLog};
use crate::scheduler::TierRunner;
use crate::validation::{Certification, DriftReport, ValidationReport, ValidationService};

/// A window given as dates or as days before today.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowSpec {
    Explicit { start: NaiveDate, end: NaiveDate },
    Relative { start_days_back: u32, end_days_back: u32 },
}

impl WindowSpec {
    /// Explicit dates win; otherwise both relative bounds are required.
    pub fn from_parts(
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
        start_days_back: Option<u32>,
        end_days_back: Option<u32>,
    ) -> Result<Self, SyncError> {
        match (start, end, start_days_back, end_days_back) {
            (Some(start), Some(end), _, _) => Ok(WindowSpec::Explicit { start, end }),
            (None, None, Some(start_days_back), Some(end_days_back)) => Ok(WindowSpec::Relative {
                start_days_back,
                end_days_back,
            }),
            _ => Err(SyncError::InvalidRequest(
                "give start and end, or days_back_start and days_back_end".into(),
            )),
        }
    }

    pub fn resolve(&self, today: NaiveDate) -> Result<DateRange, SyncError> {
        match *self {
            WindowSpec::Explicit { start, end } => DateRange::new(start, end),
            WindowSpec::Relative {
                start_days_back,
                end_days_back,
            } => DateRange::days_back(today, start_days_back, end_days_back),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerRequest {
    pub kind: EntityKind,
    pub window: WindowSpec,
    pub mode: SyncMode,
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CancelSummary {
    pub cancelled: Vec<OperationKey>,
}

pub struct SyncService {
    engine: ReconciliationEngine,
    validation: ValidationService,
    registry: Arc<CancellationRegistry>,
    log: Arc<OperationLog>,
    clock: Arc<dyn Clock>,
    deep_validate_after_sync: bool,
}

impl SyncService {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        source: Arc<dyn RecordSource>,
        log: Arc<OperationLog>,
        clock: Arc<dyn Clock>,
        engine_config: EngineConfig,
    ) -> Self {
        Self {
            engine: ReconciliationEngine::new(
                store.clone(),
                source.clone(),
                log.clone(),
                clock.clone(),
                engine_config,
            ),
            validation: ValidationService::new(store, source, log.clone(), clock.clone()),
            registry: Arc::new(CancellationRegistry::new(clock.clone())),
            log,
            clock,
            deep_validate_after_sync: false,
        }
    }

    pub fn with_deep_validation_after_sync(mut self, deep: bool) -> Self {
        self.deep_validate_after_sync = deep;
        self
    }

    pub fn log(&self) -> &Arc<OperationLog> {
        &self.log
    }

    pub fn registry(&self) -> &Arc<CancellationRegistry> {
        &self.registry
    }

    pub fn today(&self) -> NaiveDate {
        self.clock.today()
    }

    /// On-demand run under a custom key derived from kind and range.
    pub async fn trigger(&self, request: TriggerRequest) -> Result<ReconcileOutcome, SyncError> {
        let range = request.window.resolve(self.clock.today())?;
        let key = OperationKey::custom(request.kind, &range);
        let window = SyncWindow::new(request.kind, range, request.mode);
        self.run(key, window, request.dry_run).await
    }

    async fn run(
        &self,
        key: OperationKey,
        window: SyncWindow,
        dry_run: bool,
    ) -> Result<ReconcileOutcome, SyncError> {
        let guard = self.registry.register(key)?;
        let outcome = self.engine.reconcile(window, dry_run, guard.token()).await?;
        if outcome.committed && outcome.mode.inserts() {
            match self
                .validation
                .certify(&outcome, self.deep_validate_after_sync, guard.token())
                .await
            {
                Ok(Certification { certified: true, .. }) => {}
                Ok(cert) => warn!(
                    operation_key = %outcome.operation_key,
                    expected = cert.expected_rows,
                    found = cert.local_rows,
                    "run committed but did not certify"
                ),
                Err(err) => warn!(operation_key = %outcome.operation_key, error = %err, "certification failed"),
            }
        }
        Ok(outcome)
    }

    /// Cancels one operation, or every running one when `key` is `None`.
    pub fn cancel(&self, key: Option<&OperationKey>) -> CancelSummary {
        let cancelled = match key {
            Some(key) if self.registry.cancel(key) => vec![key.clone()],
            Some(_) => Vec::new(),
            None => self.registry.cancel_all(),
        };
        CancelSummary { cancelled }
    }

    pub fn active(&self) -> Vec<ActiveOperation> {
        self.registry.active()
    }

    pub fn recent(&self, prefix: Option<&str>, limit: usize) -> Vec<OperationLogEntry> {
        self.log.recent(prefix, limit)
    }

    pub async fn validate(
        &self,
        kind: EntityKind,
        range: DateRange,
        deep: bool,
    ) -> Result<ValidationReport, SyncError> {
        if !deep {
            return self.validation.cheap(kind, &range).await;
        }
        let guard = self.registry.register(OperationKey::validation(kind, &range))?;
        self.validation.deep(kind, &range, guard.token()).await
    }

    pub async fn drift(&self, kind: EntityKind, range: DateRange) -> Result<DriftReport, SyncError> {
        let key = OperationKey::from(format!("{}:drift:{}", kind.as_str(), range));
        let guard = self.registry.register(key)?;
        self.validation.drift(kind, &range, guard.token()).await
    }

    pub async fn coverage(
        &self,
        kind: Option<EntityKind>,
        months: u32,
    ) -> Result<Vec<MonthCoverage>, SyncError> {
        self.log.coverage(kind, months, self.clock.today()).await
    }
}

#[async_trait]
impl TierRunner for SyncService {
    async fn run_tier(&self, kind: EntityKind, tier: Tier, range: DateRange) -> Result<(), SyncError> {
        let key = OperationKey::scheduled(kind, tier);
        let window = SyncWindow::new(kind, range, SyncMode::ReplaceAll);
        let outcome = self.run(key, window, false).await?;
        info!(
            operation_key = %outcome.operation_key,
            deleted = outcome.deleted_rows,
            inserted = outcome.inserted_rows,
            no_data = outcome.no_data,
            "scheduled run finished"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::{clock, day, payments, seed_provenance, ScriptedSource};
    use billsync_core::OperationStatus;
    use billsync_storage::MemoryLedgerStore;

    fn service(store: Arc<MemoryLedgerStore>, source: Arc<ScriptedSource>) -> SyncService {
        SyncService::new(
            store,
            source,
            Arc::new(OperationLog::in_memory(100)),
            clock(),
            EngineConfig::default(),
        )
    }

    fn explicit(mode: SyncMode, dry_run: bool) -> TriggerRequest {
        TriggerRequest {
            kind: EntityKind::Payments,
            window: WindowSpec::Explicit {
                start: day(),
                end: day(),
            },
            mode,
            dry_run,
        }
    }

    #[test]
    fn window_spec_needs_a_full_pair() {
        assert!(WindowSpec::from_parts(Some(day()), None, Some(7), Some(1)).is_err());
        assert_eq!(
            WindowSpec::from_parts(None, None, Some(7), Some(1)).unwrap(),
            WindowSpec::Relative {
                start_days_back: 7,
                end_days_back: 1
            }
        );
        let today = NaiveDate::from_ymd_opt(2026, 3, 11).unwrap();
        let range = WindowSpec::Relative {
            start_days_back: 7,
            end_days_back: 1,
        }
        .resolve(today)
        .unwrap();
        assert_eq!(range.start, NaiveDate::from_ymd_opt(2026, 3, 4).unwrap());
        assert!(WindowSpec::Explicit {
            start: today,
            end: day()
        }
        .resolve(today)
        .is_err());
    }

    #[tokio::test]
    async fn trigger_runs_under_custom_key_and_certifies() {
        let store = Arc::new(MemoryLedgerStore::new());
        let service = service(store.clone(), ScriptedSource::records(payments(5)));
        let outcome = service.trigger(explicit(SyncMode::ReplaceAll, false)).await.unwrap();
        assert_eq!(
            outcome.operation_key.as_str(),
            "payments:custom:2026-02-10..2026-02-10"
        );
        assert_eq!(outcome.inserted_rows, 5);
        let statuses: Vec<OperationStatus> = service
            .recent(Some("payments:custom"), 10)
            .iter()
            .map(|e| e.status)
            .collect();
        assert_eq!(statuses[0], OperationStatus::Validated);
        assert!(statuses.contains(&OperationStatus::Completed));
        assert!(service.active().is_empty());
    }

    #[tokio::test]
    async fn dry_run_trigger_is_not_certified() {
        let store = Arc::new(MemoryLedgerStore::new());
        store.seed(payments(10), &seed_provenance()).await;
        let service = service(store, ScriptedSource::records(payments(12)));
        let outcome = service.trigger(explicit(SyncMode::ReplaceAll, true)).await.unwrap();
        assert_eq!(outcome.plan.map(|p| p.rows_to_insert), Some(12));
        assert!(service
            .recent(None, 10)
            .iter()
            .all(|e| e.status != OperationStatus::Validated));
    }

    #[tokio::test]
    async fn scheduled_runs_use_tier_keys() {
        let store = Arc::new(MemoryLedgerStore::new());
        let service = service(store.clone(), ScriptedSource::records(payments(3)));
        service
            .run_tier(EntityKind::Payments, Tier::Cold, DateRange::new(day(), day()).unwrap())
            .await
            .unwrap();
        assert!(!service.recent(Some("payments:cold"), 10).is_empty());
        assert_eq!(store.rows(EntityKind::Payments).await.len(), 3);
    }

    #[test]
    fn cancel_without_running_operation_is_empty() {
        let service = service(
            Arc::new(MemoryLedgerStore::new()),
            ScriptedSource::records(Vec::new()),
        );
        assert!(service
            .cancel(Some(&OperationKey::from("payments:hot")))
            .cancelled
            .is_empty());
        assert!(service.cancel(None).cancelled.is_empty());
    }
}
