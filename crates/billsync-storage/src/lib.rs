//! Relational store for the mirrored billing ledger and the operation audit log.

use async_trait::async_trait;
use billsync_core::{
    DateRange, EntityKind, ExternalRecord, OperationLogEntry, OperationStatus, Provenance,
    SyncError,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

pub mod memory;
pub mod postgres;

pub use memory::MemoryLedgerStore;
pub use postgres::PgLedgerStore;

pub const CRATE_NAME: &str = "billsync-storage";

/// Postgres caps a single statement at 65 535 bind parameters.
pub const PG_MAX_BIND_PARAMS: usize = 65_535;

pub const PAYMENT_INSERT_COLUMNS: usize = 11;
pub const TIME_ENTRY_INSERT_COLUMNS: usize = 11;

pub fn max_rows_per_statement(kind: EntityKind) -> usize {
    let columns = match kind {
        EntityKind::Payments => PAYMENT_INSERT_COLUMNS,
        EntityKind::TimeEntries => TIME_ENTRY_INSERT_COLUMNS,
    };
    PG_MAX_BIND_PARAMS / columns
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("constraint violated: {0}")]
    Constraint(String),
    #[error("stored value could not be decoded: {0}")]
    Decode(String),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        SyncError::Persistence(err.to_string())
    }
}

/// Local aggregates for one entity kind over a window.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct WindowAggregate {
    pub row_count: u64,
    pub amount_sum: f64,
    pub hours_sum: f64,
}

impl WindowAggregate {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a ExternalRecord>) -> Self {
        records.into_iter().fold(Self::default(), |mut acc, record| {
            acc.row_count += 1;
            acc.amount_sum += record.amount();
            acc.hours_sum += record.hours();
            acc
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct LogQuery {
    pub operation_prefix: Option<String>,
    pub kind: Option<EntityKind>,
    pub since: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `logged_at`, for paging backwards.
    pub before: Option<DateTime<Utc>>,
    /// Empty matches every status.
    pub statuses: Vec<OperationStatus>,
    pub limit: usize,
}

impl LogQuery {
    pub fn matches(&self, entry: &OperationLogEntry) -> bool {
        self.operation_prefix
            .as_deref()
            .map_or(true, |p| entry.operation_key.as_str().starts_with(p))
            && self.kind.map_or(true, |k| entry.kind == Some(k))
            && self.since.map_or(true, |since| entry.timestamp >= since)
            && self.before.map_or(true, |before| entry.timestamp <= before)
            && (self.statuses.is_empty() || self.statuses.contains(&entry.status))
    }
}

/// Row-level checks the SQL schema enforces with CHECK/NOT NULL constraints.
pub fn check_record(record: &ExternalRecord) -> Result<(), StoreError> {
    let (upstream_id, user_name, numbers) = match record {
        ExternalRecord::Payment(p) => (&p.upstream_id, &p.user_name, vec![p.amount]),
        ExternalRecord::Time(t) => (&t.upstream_id, &t.user_name, vec![t.hours, t.amount]),
    };
    if upstream_id.trim().is_empty() {
        return Err(StoreError::Constraint("upstream_id must not be blank".into()));
    }
    if user_name.trim().is_empty() {
        return Err(StoreError::Constraint(format!(
            "user_name must not be blank (upstream_id {upstream_id})"
        )));
    }
    if numbers.iter().any(|n| !n.is_finite()) {
        return Err(StoreError::Constraint(format!(
            "non-finite amount or hours (upstream_id {upstream_id})"
        )));
    }
    Ok(())
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Largest number of rows one insert statement may carry for `kind`.
    fn max_batch_rows(&self, kind: EntityKind) -> usize;

    async fn begin(&self) -> Result<Box<dyn LedgerTx>, StoreError>;

    async fn aggregate(&self, kind: EntityKind, range: &DateRange) -> Result<WindowAggregate, StoreError>;
}

/// One write transaction. Dropping it without `commit` discards its writes.
#[async_trait]
pub trait LedgerTx: Send {
    async fn delete_window(&mut self, kind: EntityKind, range: &DateRange) -> Result<u64, StoreError>;

    /// Inserts every record or none of them. Records must share one kind.
    async fn insert_batch(
        &mut self,
        records: &[ExternalRecord],
        provenance: &Provenance,
    ) -> Result<u64, StoreError>;

    /// Keeps the first row per natural key inside the window, deletes the rest.
    async fn dedup_window(&mut self, kind: EntityKind, range: &DateRange) -> Result<u64, StoreError>;

    async fn aggregate(&mut self, kind: EntityKind, range: &DateRange) -> Result<WindowAggregate, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

#[async_trait]
pub trait OperationLogStore: Send + Sync {
    async fn append(&self, entry: &OperationLogEntry) -> Result<(), StoreError>;

    /// Newest first.
    async fn query(&self, query: &LogQuery) -> Result<Vec<OperationLogEntry>, StoreError>;
}

fn single_kind(records: &[ExternalRecord]) -> Result<Option<EntityKind>, StoreError> {
    let Some(first) = records.first() else {
        return Ok(None);
    };
    let kind = first.kind();
    if records.iter().any(|r| r.kind() != kind) {
        return Err(StoreError::Constraint("insert batch mixes entity kinds".into()));
    }
    Ok(Some(kind))
}
