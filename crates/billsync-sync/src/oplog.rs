//! Two-sink operation log: a bounded in-memory ring and a durable store.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use billsync_core::{EntityKind, OperationKey, OperationLogEntry, OperationStatus, SyncError};
use billsync_storage::{LogQuery, OperationLogStore};
use chrono::{DateTime, Datelike, Months, NaiveDate, TimeZone, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

pub const DEFAULT_RING_CAPACITY: usize = 500;
pub const DEFAULT_SINK_TIMEOUT: Duration = Duration::from_secs(5);
const COVERAGE_PAGE_SIZE: usize = 5_000;
const COVERAGE_STATUSES: [OperationStatus; 5] = [
    OperationStatus::Completed,
    OperationStatus::NoData,
    OperationStatus::Error,
    OperationStatus::Cancelled,
    OperationStatus::Validated,
];

pub struct OperationLog {
    ring: Mutex<VecDeque<OperationLogEntry>>,
    capacity: usize,
    sink: Option<Arc<dyn OperationLogStore>>,
    sink_timeout: Duration,
}

impl OperationLog {
    pub fn new(capacity: usize, sink: Option<Arc<dyn OperationLogStore>>) -> Self {
        let capacity = capacity.max(1);
        Self {
            ring: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            sink,
            sink_timeout: DEFAULT_SINK_TIMEOUT,
        }
    }

    /// Ring only; nothing survives a restart.
    pub fn in_memory(capacity: usize) -> Self {
        Self::new(capacity, None)
    }

    pub fn with_sink_timeout(mut self, timeout: Duration) -> Self {
        self.sink_timeout = timeout;
        self
    }

    fn ring(&self) -> MutexGuard<'_, VecDeque<OperationLogEntry>> {
        self.ring.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Records an entry. A failing or slow durable sink is reported and otherwise ignored.
    pub async fn emit(&self, entry: OperationLogEntry) {
        trace_entry(&entry);
        {
            let mut ring = self.ring();
            if ring.len() == self.capacity {
                ring.pop_front();
            }
            ring.push_back(entry.clone());
        }
        let Some(sink) = &self.sink else {
            return;
        };
        match tokio::time::timeout(self.sink_timeout, sink.append(&entry)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(
                operation_key = %entry.operation_key,
                error = %err,
                "durable operation log write failed"
            ),
            Err(_) => warn!(
                operation_key = %entry.operation_key,
                timeout_ms = self.sink_timeout.as_millis() as u64,
                "durable operation log write timed out"
            ),
        }
    }

    /// Newest first, from the ring.
    pub fn recent(&self, prefix: Option<&str>, limit: usize) -> Vec<OperationLogEntry> {
        self.ring()
            .iter()
            .rev()
            .filter(|e| prefix.map_or(true, |p| e.operation_key.as_str().starts_with(p)))
            .take(limit.max(1))
            .cloned()
            .collect()
    }

    /// Durable entries when a sink is configured, otherwise the ring.
    pub async fn history(&self, query: &LogQuery) -> Result<Vec<OperationLogEntry>, SyncError> {
        if let Some(sink) = &self.sink {
            return Ok(sink.query(query).await?);
        }
        let mut out: Vec<OperationLogEntry> = self
            .ring()
            .iter()
            .rev()
            .filter(|e| query.matches(e))
            .cloned()
            .collect();
        out.truncate(query.limit.max(1));
        Ok(out)
    }

    pub async fn coverage(
        &self,
        kind: Option<EntityKind>,
        months: u32,
        today: NaiveDate,
    ) -> Result<Vec<MonthCoverage>, SyncError> {
        let months = months.clamp(1, 120);
        let first = month_start(today)
            .checked_sub_months(Months::new(months - 1))
            .unwrap_or(today);
        let since = first
            .and_hms_opt(0, 0, 0)
            .map(|midnight| Utc.from_utc_datetime(&midnight));
        // Outcome rows only, paged newest-first so a busy month cannot crowd out older ones.
        let mut entries = Vec::new();
        let mut seen = HashSet::new();
        let mut before = None;
        loop {
            let page = self
                .history(&LogQuery {
                    operation_prefix: None,
                    kind,
                    since,
                    before,
                    statuses: COVERAGE_STATUSES.to_vec(),
                    limit: COVERAGE_PAGE_SIZE,
                })
                .await?;
            let full = page.len() >= COVERAGE_PAGE_SIZE;
            let oldest = page.last().map(|e| e.timestamp);
            entries.extend(page.into_iter().filter(|e| seen.insert(e.id)));
            match oldest {
                Some(at) if full && before != Some(at) => before = Some(at),
                _ => break,
            }
        }
        let kinds = match kind {
            Some(kind) => vec![kind],
            None => EntityKind::ALL.to_vec(),
        };
        Ok(coverage_from_entries(&entries, &kinds, months, today))
    }
}

fn trace_entry(entry: &OperationLogEntry) {
    let key = entry.operation_key.as_str();
    match entry.status {
        OperationStatus::Error => error!(operation_key = key, status = entry.status.as_str(), "{}", entry.message),
        OperationStatus::Cancelled | OperationStatus::NoData | OperationStatus::Skipped => {
            warn!(operation_key = key, status = entry.status.as_str(), "{}", entry.message)
        }
        OperationStatus::Progress => debug!(operation_key = key, "{}", entry.message),
        _ => info!(operation_key = key, status = entry.status.as_str(), "{}", entry.message),
    }
}

/// Latest event of one class that touched a month.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoverageMark {
    pub at: DateTime<Utc>,
    pub status: OperationStatus,
    pub operation_key: OperationKey,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation_match: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonthCoverage {
    /// `YYYY-MM`
    pub month: String,
    pub kind: EntityKind,
    pub last_sync: Option<CoverageMark>,
    pub last_validation: Option<CoverageMark>,
}

impl MonthCoverage {
    pub fn is_covered(&self) -> bool {
        self.last_sync
            .as_ref()
            .is_some_and(|m| matches!(m.status, OperationStatus::Completed | OperationStatus::NoData))
    }
}

fn month_start(day: NaiveDate) -> NaiveDate {
    day.with_day(1).unwrap_or(day)
}

fn is_sync_outcome(status: OperationStatus) -> bool {
    matches!(
        status,
        OperationStatus::Completed
            | OperationStatus::NoData
            | OperationStatus::Error
            | OperationStatus::Cancelled
    )
}

fn newer(slot: &mut Option<CoverageMark>, entry: &OperationLogEntry) {
    if slot.as_ref().is_some_and(|m| m.at >= entry.timestamp) {
        return;
    }
    *slot = Some(CoverageMark {
        at: entry.timestamp,
        status: entry.status,
        operation_key: entry.operation_key.clone(),
        message: entry.message.clone(),
        validation_match: entry.metrics.validation_match,
    });
}

/// Builds the month grid (newest month first) from windowed log entries.
///
/// An entry counts toward every month its window overlaps. Entries without a
/// window, or for kinds outside `kinds`, are ignored.
pub fn coverage_from_entries(
    entries: &[OperationLogEntry],
    kinds: &[EntityKind],
    months: u32,
    today: NaiveDate,
) -> Vec<MonthCoverage> {
    let newest = month_start(today);
    let mut grid: BTreeMap<(NaiveDate, EntityKind), MonthCoverage> = BTreeMap::new();
    for offset in 0..months {
        let Some(month) = newest.checked_sub_months(Months::new(offset)) else {
            break;
        };
        for &kind in kinds {
            grid.insert(
                (month, kind),
                MonthCoverage {
                    month: month.format("%Y-%m").to_string(),
                    kind,
                    last_sync: None,
                    last_validation: None,
                },
            );
        }
    }

    for entry in entries {
        let (Some(kind), Some(start), Some(end)) = (entry.kind, entry.window_start, entry.window_end)
        else {
            continue;
        };
        let validation = entry.status == OperationStatus::Validated;
        if !validation && !is_sync_outcome(entry.status) {
            continue;
        }
        let mut month = month_start(start);
        while month <= end {
            if let Some(cell) = grid.get_mut(&(month, kind)) {
                if validation {
                    newer(&mut cell.last_validation, entry);
                } else {
                    newer(&mut cell.last_sync, entry);
                }
            }
            match month.checked_add_months(Months::new(1)) {
                Some(next) => month = next,
                None => break,
            }
        }
    }

    let mut out: Vec<MonthCoverage> = grid.into_values().collect();
    out.sort_by(|a, b| b.month.cmp(&a.month).then_with(|| a.kind.as_str().cmp(b.kind.as_str())));
    out
}
