//! Core domain model for billing ledger reconciliation.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "billsync-core";

/// The two record families mirrored from the billing system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Payments,
    TimeEntries,
}

impl EntityKind {
    pub const ALL: [EntityKind; 2] = [EntityKind::Payments, EntityKind::TimeEntries];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Payments => "payments",
            EntityKind::TimeEntries => "time_entries",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "payments" | "payment" => Ok(EntityKind::Payments),
            "time_entries" | "time-entries" | "timeentries" | "wip" => Ok(EntityKind::TimeEntries),
            other => Err(SyncError::InvalidRequest(format!("unknown entity kind `{other}`"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    #[default]
    ReplaceAll,
    InsertOnly,
    DeleteOnly,
}

impl SyncMode {
    pub fn deletes(&self) -> bool {
        matches!(self, SyncMode::ReplaceAll | SyncMode::DeleteOnly)
    }

    pub fn inserts(&self) -> bool {
        matches!(self, SyncMode::ReplaceAll | SyncMode::InsertOnly)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::ReplaceAll => "replace_all",
            SyncMode::InsertOnly => "insert_only",
            SyncMode::DeleteOnly => "delete_only",
        }
    }
}

impl FromStr for SyncMode {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "replace" | "replace_all" | "replace-all" => Ok(SyncMode::ReplaceAll),
            "insert" | "insert_only" | "insert-only" => Ok(SyncMode::InsertOnly),
            "delete" | "delete_only" | "delete-only" => Ok(SyncMode::DeleteOnly),
            other => Err(SyncError::InvalidRequest(format!("unknown sync mode `{other}`"))),
        }
    }
}

/// Inclusive calendar-day range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, SyncError> {
        if start > end {
            return Err(SyncError::InvalidWindow(format!(
                "start {start} is after end {end}"
            )));
        }
        Ok(Self { start, end })
    }

    /// Range expressed as days before `today`, e.g. `(7, 1)` is the week ending yesterday.
    pub fn days_back(today: NaiveDate, start_days_back: u32, end_days_back: u32) -> Result<Self, SyncError> {
        let back = |days: u32| {
            today
                .checked_sub_signed(Duration::days(i64::from(days)))
                .ok_or_else(|| SyncError::InvalidWindow(format!("{days} days before {today} is out of range")))
        };
        Self::new(back(start_days_back)?, back(end_days_back)?)
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    /// Number of calendar days covered, counting both ends.
    pub fn len_days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// Target of one reconciliation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncWindow {
    pub kind: EntityKind,
    pub range: DateRange,
    pub mode: SyncMode,
}

impl SyncWindow {
    pub fn new(kind: EntityKind, range: DateRange, mode: SyncMode) -> Self {
        Self { kind, range, mode }
    }

    pub fn with_range(&self, range: DateRange) -> Self {
        Self { range, ..*self }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Hot,
    Warm,
    Cold,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Hot, Tier::Warm, Tier::Cold];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Hot => "hot",
            Tier::Warm => "warm",
            Tier::Cold => "cold",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity used for cancellation, tier exclusivity and log correlation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationKey(String);

impl OperationKey {
    pub fn scheduled(kind: EntityKind, tier: Tier) -> Self {
        Self(format!("{}:{}", kind.as_str(), tier.as_str()))
    }

    /// Custom runs carry their range so they never collide with tiers or each other.
    pub fn custom(kind: EntityKind, range: &DateRange) -> Self {
        Self(format!("{}:custom:{}", kind.as_str(), range))
    }

    pub fn validation(kind: EntityKind, range: &DateRange) -> Self {
        Self(format!("{}:validate:{}", kind.as_str(), range))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OperationKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for OperationKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// One payment allocation line from the collections report.
///
/// `upstream_id` is the billed line item id and repeats when one line is
/// split across invoices or partial payments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentAllocation {
    pub upstream_id: String,
    pub user_name: String,
    pub kind: String,
    pub amount: f64,
    pub activity_date: NaiveDate,
    pub payment_date: NaiveDate,
    #[serde(default)]
    pub matter: Option<String>,
    #[serde(default)]
    pub invoice_number: Option<String>,
}

/// One time or expense activity. `upstream_id` is unique per activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeActivity {
    pub upstream_id: String,
    pub user_name: String,
    pub kind: String,
    pub hours: f64,
    pub amount: f64,
    pub activity_date: NaiveDate,
    #[serde(default)]
    pub matter: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entity", rename_all = "snake_case")]
pub enum ExternalRecord {
    Payment(PaymentAllocation),
    Time(TimeActivity),
}

impl ExternalRecord {
    pub fn kind(&self) -> EntityKind {
        match self {
            ExternalRecord::Payment(_) => EntityKind::Payments,
            ExternalRecord::Time(_) => EntityKind::TimeEntries,
        }
    }

    pub fn upstream_id(&self) -> &str {
        match self {
            ExternalRecord::Payment(p) => &p.upstream_id,
            ExternalRecord::Time(t) => &t.upstream_id,
        }
    }

    /// Date that places the record inside a sync window.
    pub fn window_date(&self) -> NaiveDate {
        match self {
            ExternalRecord::Payment(p) => p.payment_date,
            ExternalRecord::Time(t) => t.activity_date,
        }
    }

    pub fn amount(&self) -> f64 {
        match self {
            ExternalRecord::Payment(p) => p.amount,
            ExternalRecord::Time(t) => t.amount,
        }
    }

    pub fn hours(&self) -> f64 {
        match self {
            ExternalRecord::Payment(_) => 0.0,
            ExternalRecord::Time(t) => t.hours,
        }
    }

    pub fn natural_key(&self) -> NaturalKey {
        match self {
            ExternalRecord::Payment(p) => NaturalKey::Payment {
                upstream_id: p.upstream_id.clone(),
                user_name: p.user_name.clone(),
                kind: p.kind.clone(),
                amount_bits: p.amount.to_bits(),
                activity_date: p.activity_date,
                payment_date: p.payment_date,
            },
            ExternalRecord::Time(t) => NaturalKey::Time {
                upstream_id: t.upstream_id.clone(),
            },
        }
    }
}

/// Identity of "the same real-world row" used by deduplication.
///
/// Payments need the full tuple because split allocations share an upstream id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NaturalKey {
    Payment {
        upstream_id: String,
        user_name: String,
        kind: String,
        amount_bits: u64,
        activity_date: NaiveDate,
        payment_date: NaiveDate,
    },
    Time {
        upstream_id: String,
    },
}

/// Which run wrote a stored row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub run_id: Uuid,
    pub operation_key: OperationKey,
    pub synced_at: DateTime<Utc>,
}

/// Persisted projection of an [`ExternalRecord`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRow {
    pub id: i64,
    pub record: ExternalRecord,
    pub provenance: Provenance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationStatus {
    Started,
    Progress,
    NoData,
    Skipped,
    Completed,
    Validated,
    Error,
    Cancelled,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Started => "started",
            OperationStatus::Progress => "progress",
            OperationStatus::NoData => "no-data",
            OperationStatus::Skipped => "skipped",
            OperationStatus::Completed => "completed",
            OperationStatus::Validated => "validated",
            OperationStatus::Error => "error",
            OperationStatus::Cancelled => "cancelled",
        }
    }
}

impl FromStr for OperationStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "started" => OperationStatus::Started,
            "progress" => OperationStatus::Progress,
            "no-data" => OperationStatus::NoData,
            "skipped" => OperationStatus::Skipped,
            "completed" => OperationStatus::Completed,
            "validated" => OperationStatus::Validated,
            "error" => OperationStatus::Error,
            "cancelled" => OperationStatus::Cancelled,
            other => {
                return Err(SyncError::InvalidRequest(format!(
                    "unknown operation status `{other}`"
                )))
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LogMetrics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_rows: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inserted_rows: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deduped_rows: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_rows: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preserved: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_match: Option<bool>,
}

/// Immutable lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationLogEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub operation_key: OperationKey,
    pub status: OperationStatus,
    pub message: String,
    #[serde(default)]
    pub kind: Option<EntityKind>,
    #[serde(default)]
    pub window_start: Option<NaiveDate>,
    #[serde(default)]
    pub window_end: Option<NaiveDate>,
    #[serde(default)]
    pub metrics: LogMetrics,
}

impl OperationLogEntry {
    pub fn new(
        timestamp: DateTime<Utc>,
        operation_key: &OperationKey,
        status: OperationStatus,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp,
            operation_key: operation_key.clone(),
            status,
            message: message.into(),
            kind: None,
            window_start: None,
            window_end: None,
            metrics: LogMetrics::default(),
        }
    }

    pub fn with_window(mut self, kind: EntityKind, range: &DateRange) -> Self {
        self.kind = Some(kind);
        self.window_start = Some(range.start);
        self.window_end = Some(range.end);
        self
    }

    pub fn with_metrics(mut self, metrics: LogMetrics) -> Self {
        self.metrics = metrics;
        self
    }
}

/// Failure taxonomy shared by every component.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SyncError {
    #[error("credential exchange failed: {0}")]
    Credential(String),
    #[error("billing system unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("billing system rejected request: {0}")]
    UpstreamRejected(String),
    #[error(
        "sanity guard tripped: deleted {deleted} rows but only {net_inserted} survived insert+dedup (ratio {ratio:.2})"
    )]
    SanityViolation {
        deleted: u64,
        net_inserted: u64,
        ratio: f64,
    },
    #[error("operation {key} was cancelled")]
    Cancelled { key: String },
    #[error("persistence failed: {0}")]
    Persistence(String),
    #[error("invalid window: {0}")]
    InvalidWindow(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("operation {0} is already running")]
    AlreadyRunning(String),
}

impl SyncError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SyncError::Cancelled { .. })
    }
}

/// Cooperative cancellation flag for one running operation.
///
/// Long loops call [`CancellationToken::check`] at safe points; nothing is force-killed.
#[derive(Debug)]
pub struct CancellationToken {
    operation_key: OperationKey,
    cancelled: AtomicBool,
    started_at: DateTime<Utc>,
}

impl CancellationToken {
    pub fn new(operation_key: OperationKey, started_at: DateTime<Utc>) -> Self {
        Self {
            operation_key,
            cancelled: AtomicBool::new(false),
            started_at,
        }
    }

    /// Token that is never cancelled by anyone, for ad hoc reads.
    pub fn detached(operation_key: OperationKey) -> Self {
        Self::new(operation_key, Utc::now())
    }

    pub fn operation_key(&self) -> &OperationKey {
        &self.operation_key
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<(), SyncError> {
        if self.is_cancelled() {
            return Err(SyncError::Cancelled {
                key: self.operation_key.to_string(),
            });
        }
        Ok(())
    }
}

/// Monday of the week containing `today`.
pub fn current_week_start(today: NaiveDate) -> NaiveDate {
    today - Duration::days(i64::from(today.weekday().num_days_from_monday()))
}

/// Last day of the most recent fully completed week (the Sunday before `current_week_start`).
pub fn last_completed_period_end(today: NaiveDate) -> NaiveDate {
    current_week_start(today) - Duration::days(1)
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock pinned to one instant, for tests and replays.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}
