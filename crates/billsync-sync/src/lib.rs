//! Reconciliation of the billing ledger: engine, scheduler, validation, operation log.

use std::sync::Arc;

use anyhow::{Context, Result};
use billsync_core::{Clock, SystemClock};
use billsync_storage::PgLedgerStore;
use billsync_upstream::{
    AccessTokenCache, BackoffPolicy, ClientConfig, ExternalJobClient, HttpBillingTransport,
    HttpTransportConfig,
};
use tokio_cron_scheduler::JobScheduler;
use tracing::info;

pub mod cancel;
pub mod config;
pub mod engine;
pub mod oplog;
pub mod scheduler;
pub mod service;
pub mod validation;

pub use cancel::{ActiveOperation, CancellationRegistry, RunGuard};
pub use config::SyncConfig;
pub use engine::{DryRunPlan, EngineConfig, ReconcileOutcome, ReconciliationEngine, SanityGuard};
pub use oplog::{coverage_from_entries, CoverageMark, MonthCoverage, OperationLog};
pub use scheduler::{build_cron_driver, TierRunner, TierSpec, TierStatus, TieredScheduler};
pub use service::{CancelSummary, SyncService, TriggerRequest, WindowSpec};
pub use validation::{DriftReport, ValidationDepth, ValidationReport, ValidationService};

pub const CRATE_NAME: &str = "billsync-sync";

/// Process-scoped components wired from [`SyncConfig`].
pub struct SyncRuntime {
    pub config: SyncConfig,
    pub store: Arc<PgLedgerStore>,
    pub service: Arc<SyncService>,
    pub scheduler: Arc<TieredScheduler>,
    pub clock: Arc<dyn Clock>,
}

impl SyncRuntime {
    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store = Arc::new(
            PgLedgerStore::connect(&config.database_url, config.db_max_connections)
                .await
                .context("connecting to postgres")?,
        );
        let transport = Arc::new(
            HttpBillingTransport::new(HttpTransportConfig {
                base_url: config.billing_api_base_url.clone(),
                token_url: config.billing_token_url.clone(),
                client_id: config.billing_client_id.clone(),
                client_secret: config.billing_client_secret.clone(),
                refresh_token: config.billing_refresh_token.clone(),
                timeout: config.http_timeout(),
                user_agent: Some(config.user_agent.clone()),
                max_in_flight: config.http_max_in_flight,
                backoff: BackoffPolicy::default(),
            })
            .context("building billing transport")?,
        );
        let tokens = Arc::new(AccessTokenCache::new(transport.clone(), clock.clone()));
        let client = Arc::new(ExternalJobClient::new(transport, tokens, ClientConfig::default()));
        let log = Arc::new(OperationLog::new(config.log_ring_capacity, Some(store.clone())));
        let service = Arc::new(
            SyncService::new(store.clone(), client, log, clock.clone(), config.engine())
                .with_deep_validation_after_sync(config.deep_validate_after_sync),
        );
        let scheduler = Arc::new(TieredScheduler::new(service.clone(), config.tiers.clone()));
        Ok(Self {
            config,
            store,
            service,
            scheduler,
            clock,
        })
    }

    pub async fn from_env() -> Result<Self> {
        Self::from_config(SyncConfig::from_env()).await
    }

    /// Starts the tick driver when the scheduler is enabled.
    pub async fn maybe_start_scheduler(&self) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }
        let sched = build_cron_driver(self.scheduler.clone(), self.clock.clone(), &self.config.tick_cron).await?;
        sched.start().await.context("starting scheduler")?;
        info!(cron = %self.config.tick_cron, "tier scheduler started");
        Ok(Some(sched))
    }
}
