//! Postgres-backed ledger and operation log.

use std::time::Duration;

use async_trait::async_trait;
use billsync_core::{
    DateRange, EntityKind, ExternalRecord, LogMetrics, OperationLogEntry, OperationStatus,
    Provenance,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Connection, PgPool, Postgres, QueryBuilder, Row, Transaction};
use tracing::debug;

use crate::{
    max_rows_per_statement, single_kind, LedgerStore, LedgerTx, LogQuery, OperationLogStore,
    StoreError, WindowAggregate,
};

#[derive(Debug, Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    #[tracing::instrument(level = "debug", skip(database_url))]
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(30))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    #[tracing::instrument(level = "info", skip(self))]
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

/// Table and window-date column for a kind. Static identifiers only.
fn table_for(kind: EntityKind) -> (&'static str, &'static str) {
    match kind {
        EntityKind::Payments => ("payment_allocations", "payment_date"),
        EntityKind::TimeEntries => ("time_entries", "activity_date"),
    }
}

fn dedup_partition(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Payments => {
            "upstream_id, user_name, kind, amount, activity_date, payment_date"
        }
        EntityKind::TimeEntries => "upstream_id",
    }
}

fn aggregate_sql(kind: EntityKind) -> String {
    let (table, date_col) = table_for(kind);
    let hours = match kind {
        EntityKind::Payments => "0::DOUBLE PRECISION",
        EntityKind::TimeEntries => "COALESCE(SUM(hours), 0)::DOUBLE PRECISION",
    };
    format!(
        "SELECT COUNT(*)::BIGINT AS row_count,
                COALESCE(SUM(amount), 0)::DOUBLE PRECISION AS amount_sum,
                {hours} AS hours_sum
           FROM {table}
          WHERE {date_col} BETWEEN $1 AND $2"
    )
}

fn aggregate_from_row(row: &PgRow) -> Result<WindowAggregate, StoreError> {
    let row_count: i64 = row.try_get("row_count")?;
    Ok(WindowAggregate {
        row_count: row_count.max(0) as u64,
        amount_sum: row.try_get("amount_sum")?,
        hours_sum: row.try_get("hours_sum")?,
    })
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    fn max_batch_rows(&self, kind: EntityKind) -> usize {
        max_rows_per_statement(kind)
    }

    async fn begin(&self) -> Result<Box<dyn LedgerTx>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgLedgerTx { tx }))
    }

    async fn aggregate(&self, kind: EntityKind, range: &DateRange) -> Result<WindowAggregate, StoreError> {
        let row = sqlx::query(&aggregate_sql(kind))
            .bind(range.start)
            .bind(range.end)
            .fetch_one(&self.pool)
            .await?;
        aggregate_from_row(&row)
    }
}

pub struct PgLedgerTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl LedgerTx for PgLedgerTx {
    async fn delete_window(&mut self, kind: EntityKind, range: &DateRange) -> Result<u64, StoreError> {
        let (table, date_col) = table_for(kind);
        let result = sqlx::query(&format!("DELETE FROM {table} WHERE {date_col} BETWEEN $1 AND $2"))
            .bind(range.start)
            .bind(range.end)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected())
    }

    async fn insert_batch(
        &mut self,
        records: &[ExternalRecord],
        provenance: &Provenance,
    ) -> Result<u64, StoreError> {
        let Some(kind) = single_kind(records)? else {
            return Ok(0);
        };

        // A failed statement poisons the whole Postgres transaction, so each
        // batch runs under its own savepoint.
        let mut savepoint = Connection::begin(&mut *self.tx).await?;

        let mut qb: QueryBuilder<Postgres> = match kind {
            EntityKind::Payments => QueryBuilder::new(
                "INSERT INTO payment_allocations (upstream_id, user_name, kind, amount, activity_date, payment_date, matter, invoice_number, sync_run_id, sync_operation, synced_at) ",
            ),
            EntityKind::TimeEntries => QueryBuilder::new(
                "INSERT INTO time_entries (upstream_id, user_name, kind, hours, amount, activity_date, matter, note, sync_run_id, sync_operation, synced_at) ",
            ),
        };
        qb.push_values(records, |mut b, record| {
            match record {
                ExternalRecord::Payment(p) => {
                    b.push_bind(p.upstream_id.clone())
                        .push_bind(p.user_name.clone())
                        .push_bind(p.kind.clone())
                        .push_bind(p.amount)
                        .push_bind(p.activity_date)
                        .push_bind(p.payment_date)
                        .push_bind(p.matter.clone())
                        .push_bind(p.invoice_number.clone());
                }
                ExternalRecord::Time(t) => {
                    b.push_bind(t.upstream_id.clone())
                        .push_bind(t.user_name.clone())
                        .push_bind(t.kind.clone())
                        .push_bind(t.hours)
                        .push_bind(t.amount)
                        .push_bind(t.activity_date)
                        .push_bind(t.matter.clone())
                        .push_bind(t.note.clone());
                }
            }
            b.push_bind(provenance.run_id)
                .push_bind(provenance.operation_key.as_str().to_string())
                .push_bind(provenance.synced_at);
        });

        match qb.build().execute(&mut *savepoint).await {
            Ok(result) => {
                savepoint.commit().await?;
                Ok(result.rows_affected())
            }
            Err(err) => {
                savepoint.rollback().await?;
                debug!(rows = records.len(), error = %err, "insert batch rejected");
                Err(StoreError::Sqlx(err))
            }
        }
    }

    async fn dedup_window(&mut self, kind: EntityKind, range: &DateRange) -> Result<u64, StoreError> {
        let (table, date_col) = table_for(kind);
        let partition = dedup_partition(kind);
        let sql = format!(
            "DELETE FROM {table} t
              USING (
                SELECT id,
                       ROW_NUMBER() OVER (PARTITION BY {partition} ORDER BY id) AS rn
                  FROM {table}
                 WHERE {date_col} BETWEEN $1 AND $2
              ) d
              WHERE t.id = d.id
                AND d.rn > 1"
        );
        let result = sqlx::query(&sql)
            .bind(range.start)
            .bind(range.end)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected())
    }

    async fn aggregate(&mut self, kind: EntityKind, range: &DateRange) -> Result<WindowAggregate, StoreError> {
        let row = sqlx::query(&aggregate_sql(kind))
            .bind(range.start)
            .bind(range.end)
            .fetch_one(&mut *self.tx)
            .await?;
        aggregate_from_row(&row)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[async_trait]
impl OperationLogStore for PgLedgerStore {
    async fn append(&self, entry: &OperationLogEntry) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO operation_log
                (id, logged_at, operation_key, status, message, entity_kind, window_start, window_end, metrics)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(entry.id)
        .bind(entry.timestamp)
        .bind(entry.operation_key.as_str())
        .bind(entry.status.as_str())
        .bind(&entry.message)
        .bind(entry.kind.map(|k| k.as_str()))
        .bind(entry.window_start)
        .bind(entry.window_end)
        .bind(serde_json::to_value(&entry.metrics)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn query(&self, query: &LogQuery) -> Result<Vec<OperationLogEntry>, StoreError> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "SELECT id, logged_at, operation_key, status, message, entity_kind, window_start, window_end, metrics FROM operation_log WHERE TRUE",
        );
        if let Some(prefix) = &query.operation_prefix {
            qb.push(" AND left(operation_key, length(")
                .push_bind(prefix.clone())
                .push(")) = ")
                .push_bind(prefix.clone());
        }
        if let Some(kind) = query.kind {
            qb.push(" AND entity_kind = ").push_bind(kind.as_str());
        }
        if let Some(since) = query.since {
            qb.push(" AND logged_at >= ").push_bind(since);
        }
        if let Some(before) = query.before {
            qb.push(" AND logged_at <= ").push_bind(before);
        }
        if !query.statuses.is_empty() {
            let statuses: Vec<String> =
                query.statuses.iter().map(|s| s.as_str().to_string()).collect();
            qb.push(" AND status = ANY(").push_bind(statuses).push(")");
        }
        qb.push(" ORDER BY logged_at DESC LIMIT ")
            .push_bind(query.limit.max(1) as i64);

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(entry_from_row).collect()
    }
}

fn entry_from_row(row: &PgRow) -> Result<OperationLogEntry, StoreError> {
    let operation_key: String = row.try_get("operation_key")?;
    let status: String = row.try_get("status")?;
    let status: OperationStatus = status
        .parse()
        .map_err(|e: billsync_core::SyncError| StoreError::Decode(e.to_string()))?;
    let kind: Option<String> = row.try_get("entity_kind")?;
    let kind = kind
        .map(|k| k.parse::<EntityKind>())
        .transpose()
        .map_err(|e| StoreError::Decode(e.to_string()))?;
    let metrics: serde_json::Value = row.try_get("metrics")?;
    let metrics: LogMetrics = serde_json::from_value(metrics)?;

    Ok(OperationLogEntry {
        id: row.try_get("id")?,
        timestamp: row.try_get("logged_at")?,
        operation_key: operation_key.into(),
        status,
        message: row.try_get("message")?,
        kind,
        window_start: row.try_get("window_start")?,
        window_end: row.try_get("window_end")?,
        metrics,
    })
}
