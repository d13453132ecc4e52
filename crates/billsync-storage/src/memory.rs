//! In-process ledger with the same constraint and transaction semantics as the SQL schema.
//!
//! Transactions hold the ledger lock for their whole lifetime, so they are
//! serialized and never observe each other's uncommitted writes.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use billsync_core::{
    DateRange, EntityKind, ExternalRecord, OperationLogEntry, Provenance, StoredRow,
};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::{
    check_record, max_rows_per_statement, single_kind, LedgerStore, LedgerTx, LogQuery,
    OperationLogStore, StoreError, WindowAggregate,
};

#[derive(Debug, Clone, Default)]
struct LedgerState {
    next_id: i64,
    rows: Vec<StoredRow>,
}

impl LedgerState {
    fn in_window<'a>(
        &'a self,
        kind: EntityKind,
        range: &'a DateRange,
    ) -> impl Iterator<Item = &'a StoredRow> + 'a {
        self.rows
            .iter()
            .filter(move |row| row.record.kind() == kind && range.contains(row.record.window_date()))
    }

    fn aggregate(&self, kind: EntityKind, range: &DateRange) -> WindowAggregate {
        WindowAggregate::from_records(self.in_window(kind, range).map(|row| &row.record))
    }

    fn push(&mut self, record: ExternalRecord, provenance: &Provenance) {
        self.next_id += 1;
        self.rows.push(StoredRow {
            id: self.next_id,
            record,
            provenance: provenance.clone(),
        });
    }
}

#[derive(Debug, Clone)]
pub struct MemoryLedgerStore {
    ledger: Arc<AsyncMutex<LedgerState>>,
    log: Arc<Mutex<Vec<OperationLogEntry>>>,
    max_batch_rows: Option<usize>,
}

impl Default for MemoryLedgerStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self {
            ledger: Arc::new(AsyncMutex::new(LedgerState::default())),
            log: Arc::new(Mutex::new(Vec::new())),
            max_batch_rows: None,
        }
    }

    /// Overrides the per-statement row ceiling, mostly to exercise batching with small inputs.
    pub fn with_max_batch_rows(mut self, rows: usize) -> Self {
        self.max_batch_rows = Some(rows.max(1));
        self
    }

    /// Writes rows directly, bypassing transactions and constraint checks.
    pub async fn seed(&self, records: Vec<ExternalRecord>, provenance: &Provenance) {
        let mut state = self.ledger.lock().await;
        for record in records {
            state.push(record, provenance);
        }
    }

    pub async fn rows(&self, kind: EntityKind) -> Vec<StoredRow> {
        let state = self.ledger.lock().await;
        state
            .rows
            .iter()
            .filter(|row| row.record.kind() == kind)
            .cloned()
            .collect()
    }

    pub fn log_entries(&self) -> Vec<OperationLogEntry> {
        self.log.lock().map(|log| log.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    fn max_batch_rows(&self, kind: EntityKind) -> usize {
        self.max_batch_rows
            .unwrap_or_else(|| max_rows_per_statement(kind))
    }

    async fn begin(&self) -> Result<Box<dyn LedgerTx>, StoreError> {
        let guard = self.ledger.clone().lock_owned().await;
        let staged = guard.clone();
        Ok(Box::new(MemoryLedgerTx { guard, staged }))
    }

    async fn aggregate(&self, kind: EntityKind, range: &DateRange) -> Result<WindowAggregate, StoreError> {
        let state = self.ledger.lock().await;
        Ok(state.aggregate(kind, range))
    }
}

pub struct MemoryLedgerTx {
    guard: OwnedMutexGuard<LedgerState>,
    staged: LedgerState,
}

#[async_trait]
impl LedgerTx for MemoryLedgerTx {
    async fn delete_window(&mut self, kind: EntityKind, range: &DateRange) -> Result<u64, StoreError> {
        let before = self.staged.rows.len();
        self.staged
            .rows
            .retain(|row| !(row.record.kind() == kind && range.contains(row.record.window_date())));
        Ok((before - self.staged.rows.len()) as u64)
    }

    async fn insert_batch(
        &mut self,
        records: &[ExternalRecord],
        provenance: &Provenance,
    ) -> Result<u64, StoreError> {
        single_kind(records)?;
        for record in records {
            check_record(record)?;
        }
        for record in records {
            self.staged.push(record.clone(), provenance);
        }
        Ok(records.len() as u64)
    }

    async fn dedup_window(&mut self, kind: EntityKind, range: &DateRange) -> Result<u64, StoreError> {
        let mut seen = HashSet::new();
        let mut doomed = HashSet::new();
        let mut window: Vec<&StoredRow> = self.staged.in_window(kind, range).collect();
        window.sort_by_key(|row| row.id);
        for row in window {
            if !seen.insert(row.record.natural_key()) {
                doomed.insert(row.id);
            }
        }
        self.staged.rows.retain(|row| !doomed.contains(&row.id));
        Ok(doomed.len() as u64)
    }

    async fn aggregate(&mut self, kind: EntityKind, range: &DateRange) -> Result<WindowAggregate, StoreError> {
        Ok(self.staged.aggregate(kind, range))
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemoryLedgerTx { mut guard, staged } = *self;
        *guard = staged;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

#[async_trait]
impl OperationLogStore for MemoryLedgerStore {
    async fn append(&self, entry: &OperationLogEntry) -> Result<(), StoreError> {
        let mut log = self
            .log
            .lock()
            .map_err(|_| StoreError::Constraint("operation log lock poisoned".into()))?;
        log.push(entry.clone());
        Ok(())
    }

    async fn query(&self, query: &LogQuery) -> Result<Vec<OperationLogEntry>, StoreError> {
        let log = self
            .log
            .lock()
            .map_err(|_| StoreError::Constraint("operation log lock poisoned".into()))?;
        let mut out: Vec<OperationLogEntry> = log
            .iter()
            .rev()
            .filter(|e| query.matches(e))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        out.truncate(query.limit.max(1));
        Ok(out)
    }
}
