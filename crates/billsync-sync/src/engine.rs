//! Window reconciliation: delete, insert, dedup, guard, commit, all in one transaction.

use std::sync::Arc;
use std::time::Instant;

use billsync_core::{
    current_week_start, last_completed_period_end, CancellationToken, Clock, DateRange,
    EntityKind, ExternalRecord, LogMetrics, OperationKey, OperationLogEntry, OperationStatus,
    Provenance, SyncError, SyncMode, SyncWindow,
};
use billsync_storage::{LedgerStore, LedgerTx};
use billsync_upstream::{FetchOutcome, NoDataReason, RecordSource};
use chrono::NaiveDate;
use serde::Serialize;
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

use crate::oplog::OperationLog;

pub const DEFAULT_INSERT_BATCH_SIZE: usize = 1_000;

/// Blocks a commit that would replace many rows with disproportionately few.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SanityGuard {
    /// Deletions at or below this count are never blocked.
    pub min_deleted: u64,
    /// Minimum surviving rows as a fraction of deleted rows.
    pub min_ratio: f64,
}

impl Default for SanityGuard {
    fn default() -> Self {
        Self {
            min_deleted: 50,
            min_ratio: 0.30,
        }
    }
}

impl SanityGuard {
    pub fn check(&self, deleted: u64, inserted: u64, deduped: u64) -> Result<(), SyncError> {
        if deleted <= self.min_deleted {
            return Ok(());
        }
        let net_inserted = inserted.saturating_sub(deduped);
        if (net_inserted as f64) < self.min_ratio * deleted as f64 {
            return Err(SyncError::SanityViolation {
                deleted,
                net_inserted,
                ratio: net_inserted as f64 / deleted as f64,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub insert_batch_size: usize,
    pub guard: SanityGuard,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            insert_batch_size: DEFAULT_INSERT_BATCH_SIZE,
            guard: SanityGuard::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DryRunPlan {
    pub rows_to_delete: u64,
    pub rows_to_insert: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconcileOutcome {
    pub run_id: Uuid,
    pub operation_key: OperationKey,
    pub kind: EntityKind,
    pub mode: SyncMode,
    /// Effective range after any current-period cap.
    pub range: DateRange,
    pub dry_run: bool,
    pub deleted_rows: u64,
    pub inserted_rows: u64,
    pub deduped_rows: u64,
    pub failed_rows: u64,
    /// Rows in the window at commit time.
    pub rows_after: u64,
    pub no_data: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub no_data_reason: Option<NoDataReason>,
    pub preserved: bool,
    pub skipped: bool,
    pub committed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capped_end: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<DryRunPlan>,
    pub duration_ms: u64,
}

impl ReconcileOutcome {
    fn new(run_id: Uuid, key: &OperationKey, window: &SyncWindow, dry_run: bool) -> Self {
        Self {
            run_id,
            operation_key: key.clone(),
            kind: window.kind,
            mode: window.mode,
            range: window.range,
            dry_run,
            deleted_rows: 0,
            inserted_rows: 0,
            deduped_rows: 0,
            failed_rows: 0,
            rows_after: 0,
            no_data: false,
            no_data_reason: None,
            preserved: false,
            skipped: false,
            committed: false,
            capped_end: None,
            plan: None,
            duration_ms: 0,
        }
    }

    fn metrics(&self) -> LogMetrics {
        LogMetrics {
            deleted_rows: Some(self.deleted_rows),
            inserted_rows: Some(self.inserted_rows),
            deduped_rows: Some(self.deduped_rows),
            failed_rows: Some(self.failed_rows),
            duration_ms: Some(self.duration_ms),
            preserved: Some(self.preserved),
            local_count: Some(self.rows_after),
            ..LogMetrics::default()
        }
    }
}

/// Where a TimeEntries window sits relative to the still-open current week.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriodFit {
    Closed,
    Capped(DateRange),
    Open,
}

pub fn fit_to_closed_periods(range: &DateRange, today: NaiveDate) -> PeriodFit {
    let week_start = current_week_start(today);
    if range.start >= week_start {
        return PeriodFit::Open;
    }
    if range.end >= week_start {
        let end = last_completed_period_end(today);
        return PeriodFit::Capped(DateRange {
            start: range.start,
            end,
        });
    }
    PeriodFit::Closed
}

#[derive(Debug, Default)]
struct Applied {
    deleted: u64,
    inserted: u64,
    deduped: u64,
    failed: u64,
    rows_after: u64,
}

pub struct ReconciliationEngine {
    store: Arc<dyn LedgerStore>,
    source: Arc<dyn RecordSource>,
    log: Arc<OperationLog>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl ReconciliationEngine {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        source: Arc<dyn RecordSource>,
        log: Arc<OperationLog>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            source,
            log,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn entry(
        &self,
        key: &OperationKey,
        window: &SyncWindow,
        status: OperationStatus,
        message: impl Into<String>,
    ) -> OperationLogEntry {
        OperationLogEntry::new(self.clock.now(), key, status, message).with_window(window.kind, &window.range)
    }

    /// Reconciles one window under the operation identified by `cancel`.
    pub async fn reconcile(
        &self,
        window: SyncWindow,
        dry_run: bool,
        cancel: &CancellationToken,
    ) -> Result<ReconcileOutcome, SyncError> {
        let run_id = Uuid::new_v4();
        let key = cancel.operation_key().clone();
        let span = info_span!(
            "reconcile",
            %run_id,
            operation_key = %key,
            kind = window.kind.as_str(),
            mode = window.mode.as_str(),
            dry_run
        );
        self.reconcile_inner(run_id, key, window, dry_run, cancel)
            .instrument(span)
            .await
    }

    async fn reconcile_inner(
        &self,
        run_id: Uuid,
        key: OperationKey,
        mut window: SyncWindow,
        dry_run: bool,
        cancel: &CancellationToken,
    ) -> Result<ReconcileOutcome, SyncError> {
        let started = Instant::now();
        let mut outcome = ReconcileOutcome::new(run_id, &key, &window, dry_run);

        if window.kind == EntityKind::TimeEntries {
            match fit_to_closed_periods(&window.range, self.clock.today()) {
                PeriodFit::Closed => {}
                PeriodFit::Open => {
                    outcome.skipped = true;
                    outcome.duration_ms = elapsed_ms(started);
                    self.log
                        .emit(self.entry(
                            &key,
                            &window,
                            OperationStatus::Skipped,
                            format!("window {} lies inside the current week", window.range),
                        ))
                        .await;
                    return Ok(outcome);
                }
                PeriodFit::Capped(range) => {
                    self.log
                        .emit(self.entry(
                            &key,
                            &window,
                            OperationStatus::Progress,
                            format!("end capped from {} to {}", window.range.end, range.end),
                        ))
                        .await;
                    outcome.capped_end = Some(range.end);
                    outcome.range = range;
                    window = window.with_range(range);
                }
            }
        }

        self.log
            .emit(self.entry(
                &key,
                &window,
                OperationStatus::Started,
                format!(
                    "{} {} {}{}",
                    window.mode.as_str(),
                    window.kind,
                    window.range,
                    if dry_run { " (dry run)" } else { "" }
                ),
            ))
            .await;

        let result = self
            .run_window(&key, &window, dry_run, cancel, &mut outcome, run_id)
            .await;
        outcome.duration_ms = elapsed_ms(started);
        match result {
            Ok(()) => Ok(outcome),
            Err(err) => {
                let status = if err.is_cancelled() {
                    OperationStatus::Cancelled
                } else {
                    OperationStatus::Error
                };
                self.log
                    .emit(
                        self.entry(&key, &window, status, err.to_string())
                            .with_metrics(outcome.metrics()),
                    )
                    .await;
                Err(err)
            }
        }
    }

    async fn fetch(
        &self,
        window: &SyncWindow,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome, SyncError> {
        if !window.mode.inserts() {
            // Purges never consult upstream.
            return Ok(FetchOutcome::Records(Vec::new()));
        }
        self.source.fetch_window(window.kind, &window.range, cancel).await
    }

    async fn run_window(
        &self,
        key: &OperationKey,
        window: &SyncWindow,
        dry_run: bool,
        cancel: &CancellationToken,
        outcome: &mut ReconcileOutcome,
        run_id: Uuid,
    ) -> Result<(), SyncError> {
        let records = match self.fetch(window, cancel).await? {
            FetchOutcome::Records(records) => records,
            FetchOutcome::NoData(reason) => {
                outcome.no_data = true;
                outcome.no_data_reason = Some(reason);
                Vec::new()
            }
        };
        cancel.check()?;

        if dry_run {
            return self.plan(key, window, records.len() as u64, outcome).await;
        }

        if records.is_empty() && window.mode.inserts() {
            outcome.no_data = true;
            outcome.preserved = window.mode.deletes();
            let reason = outcome
                .no_data_reason
                .map_or("upstream returned no qualifying records", |r| r.as_str());
            let message = if outcome.preserved {
                format!("{reason}; existing rows preserved")
            } else {
                reason.to_string()
            };
            self.log
                .emit(
                    self.entry(key, window, OperationStatus::NoData, message)
                        .with_metrics(LogMetrics {
                            deleted_rows: Some(0),
                            inserted_rows: Some(0),
                            preserved: Some(outcome.preserved),
                            ..LogMetrics::default()
                        }),
                )
                .await;
            return Ok(());
        }

        let provenance = Provenance {
            run_id,
            operation_key: key.clone(),
            synced_at: self.clock.now(),
        };
        let mut tx = self.store.begin().await?;
        let mut applied = Applied::default();
        let result = self
            .apply(tx.as_mut(), key, window, &records, &provenance, cancel, &mut applied)
            .await;

        outcome.deleted_rows = applied.deleted;
        outcome.inserted_rows = applied.inserted;
        outcome.deduped_rows = applied.deduped;
        outcome.failed_rows = applied.failed;
        outcome.rows_after = applied.rows_after;

        match result {
            Ok(()) => {
                tx.commit().await?;
                outcome.committed = true;
                self.log
                    .emit(
                        self.entry(
                            key,
                            window,
                            OperationStatus::Completed,
                            format!(
                                "deleted {}, inserted {}, deduped {}, failed {}",
                                applied.deleted, applied.inserted, applied.deduped, applied.failed
                            ),
                        )
                        .with_metrics(outcome.metrics()),
                    )
                    .await;
                Ok(())
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "rollback failed");
                }
                Err(err)
            }
        }
    }

    async fn plan(
        &self,
        key: &OperationKey,
        window: &SyncWindow,
        upstream_rows: u64,
        outcome: &mut ReconcileOutcome,
    ) -> Result<(), SyncError> {
        let local = self.store.aggregate(window.kind, &window.range).await?;
        let gated = upstream_rows == 0 && window.mode.inserts();
        let rows_to_delete = if window.mode.deletes() && !gated {
            local.row_count
        } else {
            0
        };
        let plan = DryRunPlan {
            rows_to_delete,
            rows_to_insert: upstream_rows,
        };
        outcome.no_data = outcome.no_data || gated;
        outcome.preserved = gated && window.mode.deletes();
        outcome.plan = Some(plan);
        outcome.rows_after = local.row_count;
        self.log
            .emit(
                self.entry(
                    key,
                    window,
                    OperationStatus::Completed,
                    format!(
                        "dry run: would delete {} and insert {}",
                        plan.rows_to_delete, plan.rows_to_insert
                    ),
                )
                .with_metrics(LogMetrics {
                    deleted_rows: Some(plan.rows_to_delete),
                    inserted_rows: Some(plan.rows_to_insert),
                    local_count: Some(local.row_count),
                    preserved: Some(outcome.preserved),
                    ..LogMetrics::default()
                }),
            )
            .await;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn apply(
        &self,
        tx: &mut dyn LedgerTx,
        key: &OperationKey,
        window: &SyncWindow,
        records: &[ExternalRecord],
        provenance: &Provenance,
        cancel: &CancellationToken,
        applied: &mut Applied,
    ) -> Result<(), SyncError> {
        if window.mode.deletes() {
            applied.deleted = tx.delete_window(window.kind, &window.range).await?;
            self.log
                .emit(self.entry(
                    key,
                    window,
                    OperationStatus::Progress,
                    format!("deleted {} rows", applied.deleted),
                ))
                .await;
        }

        if window.mode.inserts() {
            let batch_size = self
                .config
                .insert_batch_size
                .min(self.store.max_batch_rows(window.kind))
                .max(1);
            for batch in records.chunks(batch_size) {
                cancel.check()?;
                match tx.insert_batch(batch, provenance).await {
                    Ok(inserted) => applied.inserted += inserted,
                    Err(err) => {
                        warn!(rows = batch.len(), error = %err, "batch insert failed, retrying row by row");
                        for record in batch {
                            match tx.insert_batch(std::slice::from_ref(record), provenance).await {
                                Ok(inserted) => applied.inserted += inserted,
                                Err(err) => {
                                    applied.failed += 1;
                                    warn!(
                                        upstream_id = record.upstream_id(),
                                        error = %err,
                                        "skipping row that failed to insert"
                                    );
                                }
                            }
                        }
                    }
                }
            }
            cancel.check()?;
            applied.deduped = tx.dedup_window(window.kind, &window.range).await?;
            self.log
                .emit(self.entry(
                    key,
                    window,
                    OperationStatus::Progress,
                    format!(
                        "inserted {} rows ({} failed), removed {} duplicates",
                        applied.inserted, applied.failed, applied.deduped
                    ),
                ))
                .await;
        }

        if window.mode == SyncMode::ReplaceAll {
            self.config
                .guard
                .check(applied.deleted, applied.inserted, applied.deduped)?;
        }
        cancel.check()?;
        applied.rows_after = tx.aggregate(window.kind, &window.range).await?.row_count;
        Ok(())
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
