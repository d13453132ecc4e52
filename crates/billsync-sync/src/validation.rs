//! Local/upstream aggregate checks: cheap, deep, drift and post-sync certification.

use std::collections::HashSet;
use std::sync::Arc;

use billsync_core::{
    CancellationToken, Clock, DateRange, EntityKind, ExternalRecord, LogMetrics, OperationKey,
    OperationLogEntry, OperationStatus, SyncError, SyncMode,
};
use billsync_storage::{LedgerStore, WindowAggregate};
use billsync_upstream::{FetchOutcome, RecordSource};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::engine::ReconcileOutcome;
use crate::oplog::OperationLog;

/// Cent-level tolerance for sum comparisons.
pub const SUM_EPSILON: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationDepth {
    Cheap,
    Deep,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationReport {
    pub kind: EntityKind,
    pub range: DateRange,
    pub depth: ValidationDepth,
    pub local: WindowAggregate,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream: Option<WindowAggregate>,
    #[serde(rename = "match", skip_serializing_if = "Option::is_none")]
    pub matches: Option<bool>,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriftReport {
    pub kind: EntityKind,
    pub range: DateRange,
    pub local_count: u64,
    pub upstream_count: u64,
    /// Upstream minus local.
    pub difference: i64,
    pub in_sync: bool,
    pub upstream_no_data: bool,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Certification {
    pub expected_rows: u64,
    pub local_rows: u64,
    pub certified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deep: Option<ValidationReport>,
}

pub fn aggregates_match(local: &WindowAggregate, upstream: &WindowAggregate) -> bool {
    local.row_count == upstream.row_count
        && (local.amount_sum - upstream.amount_sum).abs() <= SUM_EPSILON
        && (local.hours_sum - upstream.hours_sum).abs() <= SUM_EPSILON
}

/// Upstream aggregate after the same natural-key dedup the store applies.
pub fn upstream_aggregate(records: &[ExternalRecord]) -> WindowAggregate {
    let mut seen = HashSet::new();
    WindowAggregate::from_records(records.iter().filter(|r| seen.insert(r.natural_key())))
}

pub struct ValidationService {
    store: Arc<dyn LedgerStore>,
    source: Arc<dyn RecordSource>,
    log: Arc<OperationLog>,
    clock: Arc<dyn Clock>,
}

impl ValidationService {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        source: Arc<dyn RecordSource>,
        log: Arc<OperationLog>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            source,
            log,
            clock,
        }
    }

    pub async fn cheap(&self, kind: EntityKind, range: &DateRange) -> Result<ValidationReport, SyncError> {
        let local = self.store.aggregate(kind, range).await?;
        Ok(ValidationReport {
            kind,
            range: *range,
            depth: ValidationDepth::Cheap,
            local,
            upstream: None,
            matches: None,
            checked_at: self.clock.now(),
        })
    }

    async fn fetch_upstream(
        &self,
        kind: EntityKind,
        range: &DateRange,
        cancel: &CancellationToken,
    ) -> Result<(Vec<ExternalRecord>, bool), SyncError> {
        Ok(match self.source.fetch_window(kind, range, cancel).await? {
            FetchOutcome::Records(records) => (records, false),
            FetchOutcome::NoData(_) => (Vec::new(), true),
        })
    }

    async fn compare(
        &self,
        kind: EntityKind,
        range: &DateRange,
        cancel: &CancellationToken,
    ) -> Result<ValidationReport, SyncError> {
        let (records, _) = self.fetch_upstream(kind, range, cancel).await?;
        let upstream = upstream_aggregate(&records);
        let local = self.store.aggregate(kind, range).await?;
        Ok(ValidationReport {
            kind,
            range: *range,
            depth: ValidationDepth::Deep,
            local,
            upstream: Some(upstream),
            matches: Some(aggregates_match(&local, &upstream)),
            checked_at: self.clock.now(),
        })
    }

    /// Re-derives the window from upstream and records the verdict as a `validated` entry.
    #[instrument(skip_all, fields(kind = kind.as_str(), %range))]
    pub async fn deep(
        &self,
        kind: EntityKind,
        range: &DateRange,
        cancel: &CancellationToken,
    ) -> Result<ValidationReport, SyncError> {
        let report = self.compare(kind, range, cancel).await?;
        let local = report.local;
        let upstream = report.upstream.unwrap_or_default();
        let matches = report.matches.unwrap_or(false);
        let message = if matches {
            format!("local matches upstream ({} rows)", local.row_count)
        } else {
            format!(
                "mismatch: local {} rows / {:.2}, upstream {} rows / {:.2}",
                local.row_count, local.amount_sum, upstream.row_count, upstream.amount_sum
            )
        };
        self.log
            .emit(
                OperationLogEntry::new(
                    report.checked_at,
                    &OperationKey::validation(kind, range),
                    OperationStatus::Validated,
                    message,
                )
                .with_window(kind, range)
                .with_metrics(LogMetrics {
                    local_count: Some(local.row_count),
                    upstream_count: Some(upstream.row_count),
                    validation_match: Some(matches),
                    ..LogMetrics::default()
                }),
            )
            .await;
        Ok(report)
    }

    /// Count-only comparison; not tied to any run and not persisted.
    pub async fn drift(
        &self,
        kind: EntityKind,
        range: &DateRange,
        cancel: &CancellationToken,
    ) -> Result<DriftReport, SyncError> {
        let (records, upstream_no_data) = self.fetch_upstream(kind, range, cancel).await?;
        let upstream_count = upstream_aggregate(&records).row_count;
        let local_count = self.store.aggregate(kind, range).await?.row_count;
        let difference = upstream_count as i64 - local_count as i64;
        info!(kind = kind.as_str(), %range, local_count, upstream_count, difference, "drift checked");
        Ok(DriftReport {
            kind,
            range: *range,
            local_count,
            upstream_count,
            difference,
            in_sync: difference == 0,
            upstream_no_data,
            checked_at: self.clock.now(),
        })
    }

    /// Confirms a committed run is visible in the store, optionally with a deep check.
    ///
    /// Writes exactly one `validated` entry, under the run's own key.
    pub async fn certify(
        &self,
        outcome: &ReconcileOutcome,
        deep: bool,
        cancel: &CancellationToken,
    ) -> Result<Certification, SyncError> {
        let local_rows = self.store.aggregate(outcome.kind, &outcome.range).await?.row_count;
        let expected_rows = outcome.rows_after;
        let mut certified = local_rows == expected_rows;
        let deep_report = if deep && outcome.mode != SyncMode::DeleteOnly {
            let report = self.compare(outcome.kind, &outcome.range, cancel).await?;
            certified &= report.matches.unwrap_or(false);
            Some(report)
        } else {
            None
        };
        if !certified {
            warn!(
                operation_key = %outcome.operation_key,
                expected_rows,
                local_rows,
                "post-sync certification failed"
            );
        }
        self.log
            .emit(
                OperationLogEntry::new(
                    self.clock.now(),
                    &outcome.operation_key,
                    OperationStatus::Validated,
                    if certified {
                        format!("certified {local_rows} rows")
                    } else {
                        format!("expected {expected_rows} rows, found {local_rows}")
                    },
                )
                .with_window(outcome.kind, &outcome.range)
                .with_metrics(LogMetrics {
                    local_count: Some(local_rows),
                    upstream_count: deep_report
                        .as_ref()
                        .and_then(|r| r.upstream)
                        .map(|u| u.row_count),
                    validation_match: Some(certified),
                    ..LogMetrics::default()
                }),
            )
            .await;
        Ok(Certification {
            expected_rows,
            local_rows,
            certified,
            deep: deep_report,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::{clock, day, payment, payments, seed_provenance, ScriptedSource};
    use crate::engine::{EngineConfig, ReconciliationEngine};
    use billsync_core::{SyncWindow, TimeActivity};
    use billsync_storage::MemoryLedgerStore;
    use billsync_upstream::NoDataReason;

    fn range() -> DateRange {
        DateRange::new(day(), day()).unwrap()
    }

    fn token() -> CancellationToken {
        CancellationToken::detached(OperationKey::validation(EntityKind::Payments, &range()))
    }

    fn service(store: Arc<MemoryLedgerStore>, source: Arc<ScriptedSource>) -> (ValidationService, Arc<OperationLog>) {
        let log = Arc::new(OperationLog::in_memory(50));
        (ValidationService::new(store, source, log.clone(), clock()), log)
    }

    #[test]
    fn sums_within_a_cent_match() {
        let local = WindowAggregate {
            row_count: 3,
            amount_sum: 100.004,
            hours_sum: 2.0,
        };
        let close = WindowAggregate {
            amount_sum: 100.0,
            ..local
        };
        let far = WindowAggregate {
            amount_sum: 100.05,
            ..local
        };
        assert!(aggregates_match(&local, &close));
        assert!(!aggregates_match(&local, &far));
        assert!(!aggregates_match(&local, &WindowAggregate { row_count: 4, ..local }));
    }

    #[test]
    fn upstream_aggregate_dedups_by_natural_key() {
        let mut records = payments(3);
        records.push(payment("1001", 101.0, "INV-other"));
        records.push(payment("1001", 5.0, "INV-split"));
        let agg = upstream_aggregate(&records);
        assert_eq!(agg.row_count, 4);
        assert!((agg.amount_sum - (100.0 + 101.0 + 102.0 + 5.0)).abs() < 1e-9);

        let time = |id: &str, hours: f64| {
            ExternalRecord::Time(TimeActivity {
                upstream_id: id.into(),
                user_name: "A".into(),
                kind: "TimeEntry".into(),
                hours,
                amount: 10.0,
                activity_date: day(),
                matter: None,
                note: None,
            })
        };
        assert_eq!(upstream_aggregate(&[time("1", 1.0), time("1", 2.0)]).row_count, 1);
    }

    #[tokio::test]
    async fn cheap_reports_local_aggregate_only() {
        let store = Arc::new(MemoryLedgerStore::new());
        store.seed(payments(4), &seed_provenance()).await;
        let source = ScriptedSource::records(payments(4));
        let (service, _log) = service(store, source.clone());
        let report = service.cheap(EntityKind::Payments, &range()).await.unwrap();
        assert_eq!(report.local.row_count, 4);
        assert!(report.upstream.is_none());
        assert_eq!(source.calls(), 0);
    }

    #[tokio::test]
    async fn deep_validation_persists_a_verdict() {
        let store = Arc::new(MemoryLedgerStore::new());
        store.seed(payments(6), &seed_provenance()).await;
        let (service, log) = service(store, ScriptedSource::records(payments(6)));
        let report = service.deep(EntityKind::Payments, &range(), &token()).await.unwrap();
        assert_eq!(report.matches, Some(true));

        let entry = &log.recent(None, 1)[0];
        assert_eq!(entry.status, OperationStatus::Validated);
        assert_eq!(entry.metrics.validation_match, Some(true));
        assert_eq!(entry.operation_key.as_str(), "payments:validate:2026-02-10..2026-02-10");
    }

    #[tokio::test]
    async fn drift_compares_counts() {
        let store = Arc::new(MemoryLedgerStore::new());
        store.seed(payments(6), &seed_provenance()).await;
        let (service, _log) = service(store, ScriptedSource::records(payments(9)));
        let drift = service.drift(EntityKind::Payments, &range(), &token()).await.unwrap();
        assert_eq!(drift.local_count, 6);
        assert_eq!(drift.upstream_count, 9);
        assert_eq!(drift.difference, 3);
        assert!(!drift.in_sync);
    }

    #[tokio::test]
    async fn drift_treats_no_data_as_zero_upstream() {
        let store = Arc::new(MemoryLedgerStore::new());
        store.seed(payments(2), &seed_provenance()).await;
        let source = ScriptedSource::with(Ok(FetchOutcome::NoData(NoDataReason::PollBudgetExhausted)));
        let (service, _log) = service(store, source);
        let drift = service.drift(EntityKind::Payments, &range(), &token()).await.unwrap();
        assert!(drift.upstream_no_data);
        assert_eq!(drift.difference, -2);
    }

    #[tokio::test]
    async fn certification_checks_committed_rows() {
        let store = Arc::new(MemoryLedgerStore::new());
        let source = ScriptedSource::records(payments(7));
        let log = Arc::new(OperationLog::in_memory(50));
        let engine = ReconciliationEngine::new(
            store.clone(),
            source.clone(),
            log.clone(),
            clock(),
            EngineConfig::default(),
        );
        let window = SyncWindow::new(EntityKind::Payments, range(), SyncMode::ReplaceAll);
        let outcome = engine.reconcile(window, false, &token()).await.unwrap();

        let service = ValidationService::new(store, source, log.clone(), clock());
        let cert = service.certify(&outcome, true, &token()).await.unwrap();
        assert!(cert.certified);
        assert_eq!(cert.local_rows, 7);
        assert_eq!(cert.deep.and_then(|r| r.matches), Some(true));
        let validated: Vec<OperationLogEntry> = log
            .recent(None, 50)
            .into_iter()
            .filter(|e| e.status == OperationStatus::Validated)
            .collect();
        assert_eq!(validated.len(), 1);
        assert_eq!(validated[0].operation_key, outcome.operation_key);
        assert_eq!(validated[0].metrics.upstream_count, Some(7));
    }
}
