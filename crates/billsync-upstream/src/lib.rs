//! Billing system client: credentials, report jobs, paginated activities.

use async_trait::async_trait;
use billsync_core::{CancellationToken, DateRange, EntityKind, ExternalRecord, SyncError};
use serde::{Deserialize, Serialize};

pub mod client;
pub mod token;
pub mod transport;

pub use client::{ClientConfig, ExternalJobClient, JobResult, Page, PollPolicy, PollSchedule};
pub use token::{AccessToken, AccessTokenCache};
pub use transport::{
    BackoffPolicy, BillingTransport, CredentialExchange, HttpBillingTransport, HttpTransportConfig,
    RawResponse, TokenGrant,
};

pub const CRATE_NAME: &str = "billsync-upstream";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoDataReason {
    /// Upstream said so, in whatever envelope.
    UpstreamSignal,
    /// A well-formed payload with nothing in the window.
    EmptyPayload,
    /// The report never became ready within the poll budget.
    PollBudgetExhausted,
}

impl NoDataReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            NoDataReason::UpstreamSignal => "upstream reported no data",
            NoDataReason::EmptyPayload => "payload had no qualifying records",
            NoDataReason::PollBudgetExhausted => "no data ever arrived within the poll budget",
        }
    }
}

/// What a window fetch produced. `Records` is never empty.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Records(Vec<ExternalRecord>),
    NoData(NoDataReason),
}

impl FetchOutcome {
    /// Keeps records dated inside `range`; nothing left means no data.
    pub fn from_records(records: Vec<ExternalRecord>, range: &DateRange) -> Self {
        let qualifying: Vec<_> = records
            .into_iter()
            .filter(|r| range.contains(r.window_date()))
            .collect();
        if qualifying.is_empty() {
            FetchOutcome::NoData(NoDataReason::EmptyPayload)
        } else {
            FetchOutcome::Records(qualifying)
        }
    }
}

/// Seam between the billing system and everything that consumes its records.
#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn fetch_window(
        &self,
        kind: EntityKind,
        range: &DateRange,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome, SyncError>;
}
