//! Report-job polling and paginated listing against the billing API.
//!
//! Every upstream response goes through one classification function right
//! after the call; nothing downstream inspects bodies or status codes.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use billsync_core::{
    CancellationToken, DateRange, EntityKind, ExternalRecord, PaymentAllocation, SyncError,
    TimeActivity,
};
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use crate::token::AccessTokenCache;
use crate::transport::{BillingTransport, RawResponse};
use crate::{FetchOutcome, JobId, NoDataReason, RecordSource};

const NO_DATA_MARKERS: [&str; 5] = [
    "no data",
    "no records",
    "no results",
    "nothing to report",
    "no matching",
];

/// Terminal outcome of a report job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobResult {
    Ready(String),
    NoData(NoDataReason),
    Error(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollState {
    Pending,
    Completed,
    Finished(JobResult),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub records: Vec<ExternalRecord>,
    pub has_more: bool,
    /// Upstream explicitly said there is nothing in this range.
    pub no_data: bool,
    /// Rows upstream returned, readable or not. Offsets advance by this.
    pub raw_rows: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

/// Report latency tracks range length, so the poll budget does too.
#[derive(Debug, Clone, Copy)]
pub struct PollSchedule {
    pub short_max_days: i64,
    pub medium_max_days: i64,
    pub short: PollPolicy,
    pub medium: PollPolicy,
    pub long: PollPolicy,
}

impl Default for PollSchedule {
    fn default() -> Self {
        Self {
            short_max_days: 7,
            medium_max_days: 31,
            short: PollPolicy {
                interval: Duration::from_secs(2),
                max_attempts: 30,
            },
            medium: PollPolicy {
                interval: Duration::from_secs(5),
                max_attempts: 60,
            },
            long: PollPolicy {
                interval: Duration::from_secs(10),
                max_attempts: 90,
            },
        }
    }
}

impl PollSchedule {
    pub fn for_range(&self, range: &DateRange) -> PollPolicy {
        let days = range.len_days();
        if days <= self.short_max_days {
            self.short
        } else if days <= self.medium_max_days {
            self.medium
        } else {
            self.long
        }
    }

    /// Same policy for every range. Useful when the upstream is local or faked.
    pub fn uniform(policy: PollPolicy) -> Self {
        Self {
            short: policy,
            medium: policy,
            long: policy,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ClientConfig {
    pub page_size: usize,
    pub max_pages: usize,
    pub poll: PollSchedule,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            page_size: 200,
            max_pages: 5_000,
            poll: PollSchedule::default(),
        }
    }
}

pub fn mentions_no_data(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    NO_DATA_MARKERS.iter().any(|marker| lower.contains(marker))
}

fn status_text(value: &JsonValue) -> Option<String> {
    let node = value.get("data").filter(|d| d.is_object()).unwrap_or(value);
    node.get("status")
        .or_else(|| node.get("state"))
        .and_then(|s| s.as_str())
        .map(|s| s.to_ascii_lowercase())
}

fn message_text(value: &JsonValue) -> String {
    let node = value.get("data").filter(|d| d.is_object()).unwrap_or(value);
    ["message", "error", "detail"]
        .iter()
        .filter_map(|k| node.get(*k).or_else(|| value.get(*k)))
        .filter_map(|v| v.as_str().map(ToString::to_string).or_else(|| Some(v.to_string())))
        .collect::<Vec<_>>()
        .join(" ")
}

fn rejected(resp: &RawResponse) -> JobResult {
    if resp.status == 422 && mentions_no_data(&resp.body) {
        JobResult::NoData(NoDataReason::UpstreamSignal)
    } else {
        JobResult::Error(format!("status {}: {}", resp.status, truncate(&resp.body)))
    }
}

fn truncate(body: &str) -> &str {
    match body.char_indices().nth(200) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

/// Classifies a job-status response.
pub fn classify_poll(resp: &RawResponse) -> PollState {
    if !resp.is_success() {
        return PollState::Finished(rejected(resp));
    }
    let Ok(value) = serde_json::from_str::<JsonValue>(&resp.body) else {
        if mentions_no_data(&resp.body) {
            return PollState::Finished(JobResult::NoData(NoDataReason::UpstreamSignal));
        }
        return PollState::Finished(JobResult::Error(format!(
            "unreadable job status: {}",
            truncate(&resp.body)
        )));
    };
    let message = message_text(&value);
    match status_text(&value).as_deref() {
        Some("completed" | "complete" | "ready" | "succeeded") => {
            if mentions_no_data(&message) {
                PollState::Finished(JobResult::NoData(NoDataReason::UpstreamSignal))
            } else {
                PollState::Completed
            }
        }
        Some("queued" | "pending" | "processing" | "running" | "in_progress" | "started") => {
            PollState::Pending
        }
        Some("no_data" | "empty") => PollState::Finished(JobResult::NoData(NoDataReason::UpstreamSignal)),
        Some("failed" | "error" | "cancelled" | "canceled") => {
            if mentions_no_data(&message) {
                PollState::Finished(JobResult::NoData(NoDataReason::UpstreamSignal))
            } else {
                PollState::Finished(JobResult::Error(format!("report job failed: {message}")))
            }
        }
        _ if mentions_no_data(&message) || mentions_no_data(&resp.body) => {
            PollState::Finished(JobResult::NoData(NoDataReason::UpstreamSignal))
        }
        other => PollState::Finished(JobResult::Error(format!(
            "unknown job status {:?}",
            other.unwrap_or("<missing>")
        ))),
    }
}

fn payload_rows(value: &JsonValue) -> Option<&Vec<JsonValue>> {
    value
        .get("rows")
        .or_else(|| value.get("data"))
        .and_then(|rows| rows.as_array())
}

/// Classifies a downloaded report payload.
pub fn classify_payload(resp: &RawResponse) -> JobResult {
    if !resp.is_success() {
        return rejected(resp);
    }
    match serde_json::from_str::<JsonValue>(&resp.body) {
        Ok(value) if payload_rows(&value).is_some() => JobResult::Ready(resp.body.clone()),
        _ if mentions_no_data(&resp.body) => JobResult::NoData(NoDataReason::UpstreamSignal),
        _ if resp.body.trim().is_empty() => JobResult::NoData(NoDataReason::EmptyPayload),
        _ => JobResult::Error(format!("unrecognized report payload: {}", truncate(&resp.body))),
    }
}

fn json_string(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn json_f64(value: Option<&JsonValue>) -> Option<f64> {
    match value? {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().replace(',', "").parse().ok(),
        _ => None,
    }
}

fn json_date(value: Option<&JsonValue>) -> Option<NaiveDate> {
    let text = value?.as_str()?;
    let day = text.get(..10).unwrap_or(text);
    NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
}

fn nested_name(value: Option<&JsonValue>, keys: &[&str]) -> Option<String> {
    let value = value?;
    if let Some(s) = value.as_str() {
        return Some(s.to_string());
    }
    keys.iter()
        .find_map(|k| value.get(*k).and_then(|v| v.as_str()))
        .map(ToString::to_string)
}

/// Parses one payment row. Missing user names are kept (as blank) so the store rejects them row by row.
pub fn parse_payment_row(row: &JsonValue) -> Option<PaymentAllocation> {
    let upstream_id = row.get("id").and_then(json_string)?;
    let payment_date = json_date(row.get("payment_date"))?;
    Some(PaymentAllocation {
        upstream_id,
        user_name: nested_name(row.get("user"), &["name"]).unwrap_or_default(),
        kind: row
            .get("type")
            .and_then(|v| v.as_str())
            .unwrap_or("TimeEntry")
            .to_string(),
        amount: json_f64(row.get("amount"))?,
        activity_date: json_date(row.get("date")).unwrap_or(payment_date),
        payment_date,
        matter: nested_name(row.get("matter"), &["display_number", "name"]),
        invoice_number: row.get("invoice_number").and_then(json_string),
    })
}

pub fn parse_activity_row(row: &JsonValue) -> Option<TimeActivity> {
    Some(TimeActivity {
        upstream_id: row.get("id").and_then(json_string)?,
        user_name: nested_name(row.get("user"), &["name"]).unwrap_or_default(),
        kind: row
            .get("type")
            .and_then(|v| v.as_str())
            .unwrap_or("TimeEntry")
            .to_string(),
        hours: json_f64(row.get("quantity_in_hours")).unwrap_or(0.0),
        amount: json_f64(row.get("total"))?,
        activity_date: json_date(row.get("date"))?,
        matter: nested_name(row.get("matter"), &["display_number", "name"]),
        note: row.get("note").and_then(|v| v.as_str()).map(ToString::to_string),
    })
}

/// Parses a Ready payload into payment records, skipping rows missing required fields.
pub fn parse_payment_payload(payload: &str) -> Result<Vec<ExternalRecord>, SyncError> {
    let value: JsonValue = serde_json::from_str(payload)
        .map_err(|err| SyncError::UpstreamRejected(format!("report payload: {err}")))?;
    let rows = payload_rows(&value).cloned().unwrap_or_default();
    let mut out = Vec::with_capacity(rows.len());
    let mut unreadable = 0usize;
    for row in &rows {
        match parse_payment_row(row) {
            Some(p) => out.push(ExternalRecord::Payment(p)),
            None => unreadable += 1,
        }
    }
    if unreadable > 0 {
        warn!(unreadable, total = rows.len(), "skipped unreadable payment rows");
    }
    Ok(out)
}

#[derive(Debug, Deserialize)]
struct ActivityPage {
    #[serde(default)]
    data: Vec<JsonValue>,
    #[serde(default)]
    meta: Option<ActivityMeta>,
}

#[derive(Debug, Deserialize)]
struct ActivityMeta {
    #[serde(default)]
    paging: Option<ActivityPaging>,
}

#[derive(Debug, Deserialize)]
struct ActivityPaging {
    #[serde(default)]
    next: Option<String>,
}

/// Classifies one page of the activities listing.
pub fn classify_page(resp: &RawResponse, limit: usize) -> Result<Page, SyncError> {
    let empty = Page {
        records: Vec::new(),
        has_more: false,
        no_data: true,
        raw_rows: 0,
    };
    if !resp.is_success() {
        return match rejected(resp) {
            JobResult::NoData(_) => Ok(empty),
            JobResult::Error(message) | JobResult::Ready(message) => {
                Err(SyncError::UpstreamRejected(message))
            }
        };
    }
    let page: ActivityPage = match serde_json::from_str(&resp.body) {
        Ok(page) => page,
        Err(_) if mentions_no_data(&resp.body) => return Ok(empty),
        Err(err) => {
            return Err(SyncError::UpstreamRejected(format!(
                "unreadable activities page: {err}"
            )))
        }
    };
    if page.data.is_empty() && mentions_no_data(&resp.body) {
        return Ok(empty);
    }
    let has_more = match page.meta.as_ref().and_then(|m| m.paging.as_ref()) {
        Some(paging) => paging.next.is_some(),
        None => page.data.len() >= limit,
    };
    let mut records = Vec::with_capacity(page.data.len());
    for row in &page.data {
        match parse_activity_row(row) {
            Some(t) => records.push(ExternalRecord::Time(t)),
            None => debug!("skipping unreadable activity row"),
        }
    }
    if records.len() < page.data.len() {
        warn!(
            unreadable = page.data.len() - records.len(),
            total = page.data.len(),
            "skipped unreadable activity rows"
        );
    }
    Ok(Page {
        raw_rows: page.data.len(),
        records,
        has_more,
        no_data: false,
    })
}

fn submitted_job_id(resp: &RawResponse) -> Result<JobId, SyncError> {
    if !resp.is_success() {
        return Err(SyncError::UpstreamRejected(format!(
            "report submit returned {}: {}",
            resp.status,
            truncate(&resp.body)
        )));
    }
    let value: JsonValue = serde_json::from_str(&resp.body)
        .map_err(|err| SyncError::UpstreamRejected(format!("report submit body: {err}")))?;
    value
        .get("data")
        .and_then(|d| d.get("id"))
        .or_else(|| value.get("id"))
        .and_then(json_string)
        .map(JobId)
        .ok_or_else(|| SyncError::UpstreamRejected("report submit returned no job id".into()))
}

pub struct ExternalJobClient {
    transport: Arc<dyn BillingTransport>,
    tokens: Arc<AccessTokenCache>,
    config: ClientConfig,
}

impl ExternalJobClient {
    pub fn new(
        transport: Arc<dyn BillingTransport>,
        tokens: Arc<AccessTokenCache>,
        config: ClientConfig,
    ) -> Self {
        Self {
            transport,
            tokens,
            config,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Runs `call` with the cached token; on a 401 forces one refresh and retries once.
    async fn authorized<F, Fut>(&self, call: F) -> Result<RawResponse, SyncError>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<RawResponse, SyncError>>,
    {
        let token = self.tokens.get_token(false).await?;
        let resp = call(token.value.clone()).await?;
        if !resp.is_unauthorized() {
            return Ok(resp);
        }
        warn!("billing API rejected access token, refreshing");
        let fresh = self.tokens.refresh_rejected(&token).await?;
        let resp = call(fresh.value.clone()).await?;
        if resp.is_unauthorized() {
            return Err(SyncError::Credential(
                "access token rejected again after refresh".into(),
            ));
        }
        Ok(resp)
    }

    pub async fn submit_job(&self, range: &DateRange) -> Result<JobId, SyncError> {
        let range = *range;
        let resp = self
            .authorized(|token| {
                let transport = self.transport.clone();
                async move { transport.submit_report(&token, &range).await }
            })
            .await?;
        let job = submitted_job_id(&resp)?;
        info!(job = %job.0, %range, "report job submitted");
        Ok(job)
    }

    /// Polls until the job finishes or the policy's budget runs out.
    pub async fn poll_job(
        &self,
        job: &JobId,
        policy: PollPolicy,
        cancel: &CancellationToken,
    ) -> Result<JobResult, SyncError> {
        for attempt in 1..=policy.max_attempts {
            cancel.check()?;
            let resp = self
                .authorized(|token| {
                    let transport = self.transport.clone();
                    let job = job.clone();
                    async move { transport.poll_report(&token, &job).await }
                })
                .await?;
            match classify_poll(&resp) {
                PollState::Pending => {
                    debug!(job = %job.0, attempt, "report not ready");
                    tokio::time::sleep(policy.interval).await;
                }
                PollState::Completed => {
                    cancel.check()?;
                    let resp = self
                        .authorized(|token| {
                            let transport = self.transport.clone();
                            let job = job.clone();
                            async move { transport.download_report(&token, &job).await }
                        })
                        .await?;
                    return Ok(classify_payload(&resp));
                }
                PollState::Finished(result) => return Ok(result),
            }
        }
        warn!(job = %job.0, attempts = policy.max_attempts, "report never became ready");
        Ok(JobResult::NoData(NoDataReason::PollBudgetExhausted))
    }

    pub async fn fetch_page(&self, range: &DateRange, offset: usize) -> Result<Page, SyncError> {
        let range = *range;
        let limit = self.config.page_size.max(1);
        let resp = self
            .authorized(|token| {
                let transport = self.transport.clone();
                async move { transport.list_activities(&token, &range, offset, limit).await }
            })
            .await?;
        classify_page(&resp, limit)
    }

    async fn fetch_payments(
        &self,
        range: &DateRange,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome, SyncError> {
        let job = self.submit_job(range).await?;
        let policy = self.config.poll.for_range(range);
        match self.poll_job(&job, policy, cancel).await? {
            JobResult::Ready(payload) => Ok(FetchOutcome::from_records(
                parse_payment_payload(&payload)?,
                range,
            )),
            JobResult::NoData(reason) => Ok(FetchOutcome::NoData(reason)),
            JobResult::Error(message) => Err(SyncError::UpstreamRejected(message)),
        }
    }

    async fn fetch_time_entries(
        &self,
        range: &DateRange,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome, SyncError> {
        let mut offset = 0usize;
        let mut records = Vec::new();
        for page_no in 0..self.config.max_pages {
            cancel.check()?;
            let page = self.fetch_page(range, offset).await?;
            if page.no_data && page_no == 0 {
                return Ok(FetchOutcome::NoData(NoDataReason::UpstreamSignal));
            }
            records.extend(page.records);
            if !page.has_more || page.raw_rows == 0 {
                return Ok(FetchOutcome::from_records(records, range));
            }
            offset += page.raw_rows;
        }
        Err(SyncError::UpstreamRejected(format!(
            "activities listing exceeded {} pages",
            self.config.max_pages
        )))
    }
}

#[async_trait]
impl RecordSource for ExternalJobClient {
    async fn fetch_window(
        &self,
        kind: EntityKind,
        range: &DateRange,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome, SyncError> {
        match kind {
            EntityKind::Payments => self.fetch_payments(range, cancel).await,
            EntityKind::TimeEntries => self.fetch_time_entries(range, cancel).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::AccessTokenCache;
    use crate::transport::{CredentialExchange, TokenGrant};
    use billsync_core::{FixedClock, OperationKey};
    use chrono::{TimeZone, Utc};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct StaticExchange(AtomicUsize);

    #[async_trait]
    impl CredentialExchange for StaticExchange {
        async fn exchange(&self) -> Result<TokenGrant, SyncError> {
            let n = self.0.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(TokenGrant {
                access_token: format!("t{n}"),
                expires_in: 3600,
            })
        }
    }

    /// Replays canned responses per endpoint and records the tokens it saw.
    #[derive(Default)]
    struct ScriptedTransport {
        submit: Mutex<VecDeque<RawResponse>>,
        poll: Mutex<VecDeque<RawResponse>>,
        download: Mutex<VecDeque<RawResponse>>,
        pages: Mutex<VecDeque<RawResponse>>,
        seen_tokens: Mutex<Vec<String>>,
        offsets: Mutex<Vec<usize>>,
    }

    impl ScriptedTransport {
        fn next(&self, queue: &Mutex<VecDeque<RawResponse>>, token: &str) -> Result<RawResponse, SyncError> {
            self.seen_tokens.lock().unwrap().push(token.to_string());
            queue
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| SyncError::UpstreamUnavailable("script exhausted".into()))
        }
    }

    #[async_trait]
    impl BillingTransport for ScriptedTransport {
        async fn submit_report(&self, token: &str, _range: &DateRange) -> Result<RawResponse, SyncError> {
            self.next(&self.submit, token)
        }
        async fn poll_report(&self, token: &str, _job: &JobId) -> Result<RawResponse, SyncError> {
            self.next(&self.poll, token)
        }
        async fn download_report(&self, token: &str, _job: &JobId) -> Result<RawResponse, SyncError> {
            self.next(&self.download, token)
        }
        async fn list_activities(
            &self,
            token: &str,
            _range: &DateRange,
            offset: usize,
            _limit: usize,
        ) -> Result<RawResponse, SyncError> {
            self.offsets.lock().unwrap().push(offset);
            self.next(&self.pages, token)
        }
    }

    fn range(days: u32) -> DateRange {
        let start = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        DateRange::new(start, start + chrono::Duration::days(i64::from(days) - 1)).unwrap()
    }

    fn client(transport: Arc<ScriptedTransport>, page_size: usize) -> ExternalJobClient {
        let clock = Arc::new(FixedClock(Utc.with_ymd_and_hms(2026, 3, 20, 12, 0, 0).unwrap()));
        let tokens = Arc::new(AccessTokenCache::new(
            Arc::new(StaticExchange(AtomicUsize::new(0))),
            clock,
        ));
        ExternalJobClient::new(
            transport,
            tokens,
            ClientConfig {
                page_size,
                max_pages: 50,
                poll: PollSchedule::uniform(PollPolicy {
                    interval: Duration::from_millis(1),
                    max_attempts: 3,
                }),
            },
        )
    }

    fn cancel() -> CancellationToken {
        CancellationToken::detached(OperationKey::from("payments:test"))
    }

    fn push(queue: &Mutex<VecDeque<RawResponse>>, status: u16, body: &str) {
        queue.lock().unwrap().push_back(RawResponse::new(status, body));
    }

    #[test]
    fn no_data_is_normalized_across_all_three_shapes() {
        let explicit = RawResponse::new(200, r#"{"data":{"status":"failed","message":"No data for selected range"}}"#);
        let disguised = RawResponse::new(200, r#"{"message":"No data available"}"#);
        let unprocessable = RawResponse::new(422, r#"{"error":"There is no data to report"}"#);

        let expected = PollState::Finished(JobResult::NoData(NoDataReason::UpstreamSignal));
        assert_eq!(classify_poll(&explicit), expected);
        assert_eq!(classify_poll(&disguised), expected);
        assert_eq!(classify_poll(&unprocessable), expected);

        assert_eq!(classify_payload(&disguised), JobResult::NoData(NoDataReason::UpstreamSignal));
        assert_eq!(classify_payload(&unprocessable), JobResult::NoData(NoDataReason::UpstreamSignal));
    }

    #[test]
    fn other_rejections_stay_errors() {
        let other_422 = RawResponse::new(422, r#"{"error":"end_date is invalid"}"#);
        assert!(matches!(classify_poll(&other_422), PollState::Finished(JobResult::Error(_))));
        let pending = RawResponse::new(200, r#"{"data":{"id":"9","status":"processing"}}"#);
        assert_eq!(classify_poll(&pending), PollState::Pending);
        let done = RawResponse::new(200, r#"{"data":{"id":"9","status":"completed"}}"#);
        assert_eq!(classify_poll(&done), PollState::Completed);
    }

    #[test]
    fn poll_budget_scales_with_range_length() {
        let schedule = PollSchedule::default();
        assert_eq!(schedule.for_range(&range(1)), schedule.short);
        assert_eq!(schedule.for_range(&range(21)), schedule.medium);
        assert_eq!(schedule.for_range(&range(56)), schedule.long);
        assert!(schedule.long.interval > schedule.short.interval);
        assert!(schedule.long.max_attempts > schedule.short.max_attempts);
    }

    #[test]
    fn payment_rows_accept_numeric_ids_and_string_amounts() {
        let row = serde_json::json!({
            "id": 4411,
            "user": {"name": "M. Partner"},
            "type": "ExpenseEntry",
            "amount": "1,250.50",
            "date": "2026-02-27",
            "payment_date": "2026-03-02T00:00:00Z",
            "matter": {"display_number": "00077-Globex"},
            "invoice_number": "INV-300"
        });
        let p = parse_payment_row(&row).unwrap();
        assert_eq!(p.upstream_id, "4411");
        assert!((p.amount - 1250.5).abs() < 1e-9);
        assert_eq!(p.payment_date, NaiveDate::from_ymd_opt(2026, 3, 2).unwrap());
        assert_eq!(p.matter.as_deref(), Some("00077-Globex"));
    }

    #[tokio::test]
    async fn report_job_polls_until_ready_and_downloads() {
        let transport = Arc::new(ScriptedTransport::default());
        push(&transport.submit, 201, r#"{"data":{"id":"job-1"}}"#);
        push(&transport.poll, 200, r#"{"data":{"status":"queued"}}"#);
        push(&transport.poll, 200, r#"{"data":{"status":"completed"}}"#);
        push(
            &transport.download,
            200,
            r#"{"rows":[{"id":"1","user":"A","amount":10,"date":"2026-03-01","payment_date":"2026-03-02"},
                        {"id":"2","user":"B","amount":20,"date":"2026-03-01","payment_date":"2026-04-30"}]}"#,
        );
        let client = client(transport.clone(), 100);

        let outcome = client
            .fetch_window(EntityKind::Payments, &range(1), &cancel())
            .await
            .unwrap();
        // The second row falls outside the window and does not qualify.
        match outcome {
            FetchOutcome::Records(records) => assert_eq!(records.len(), 1),
            other => panic!("expected records, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_ready_payload_is_no_data() {
        let transport = Arc::new(ScriptedTransport::default());
        push(&transport.submit, 201, r#"{"data":{"id":"job-1"}}"#);
        push(&transport.poll, 200, r#"{"data":{"status":"completed"}}"#);
        push(&transport.download, 200, r#"{"rows":[]}"#);
        let outcome = client(transport, 100)
            .fetch_window(EntityKind::Payments, &range(1), &cancel())
            .await
            .unwrap();
        assert_eq!(outcome, FetchOutcome::NoData(NoDataReason::EmptyPayload));
    }

    #[tokio::test]
    async fn exhausted_poll_budget_reports_no_data() {
        let transport = Arc::new(ScriptedTransport::default());
        push(&transport.submit, 201, r#"{"data":{"id":"job-1"}}"#);
        for _ in 0..3 {
            push(&transport.poll, 200, r#"{"data":{"status":"processing"}}"#);
        }
        let outcome = client(transport, 100)
            .fetch_window(EntityKind::Payments, &range(1), &cancel())
            .await
            .unwrap();
        assert_eq!(outcome, FetchOutcome::NoData(NoDataReason::PollBudgetExhausted));
    }

    #[tokio::test]
    async fn unauthorized_poll_refreshes_token_and_retries_once() {
        let transport = Arc::new(ScriptedTransport::default());
        push(&transport.submit, 201, r#"{"data":{"id":"job-1"}}"#);
        push(&transport.poll, 401, "expired");
        push(&transport.poll, 200, r#"{"data":{"status":"no_data"}}"#);
        let client = client(transport.clone(), 100);
        let job = client.submit_job(&range(1)).await.unwrap();
        let policy = client.config().poll.for_range(&range(1));
        let result = client.poll_job(&job, policy, &cancel()).await.unwrap();
        assert_eq!(result, JobResult::NoData(NoDataReason::UpstreamSignal));
        let tokens = transport.seen_tokens.lock().unwrap().clone();
        assert_eq!(tokens, vec!["t1", "t1", "t2"]);
    }

    #[tokio::test]
    async fn repeated_unauthorized_is_a_credential_error() {
        let transport = Arc::new(ScriptedTransport::default());
        push(&transport.poll, 401, "expired");
        push(&transport.poll, 401, "still expired");
        let client = client(transport, 100);
        let err = client
            .poll_job(&JobId("job-1".into()), PollPolicy { interval: Duration::ZERO, max_attempts: 2 }, &cancel())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Credential(_)));
    }

    #[tokio::test]
    async fn cancellation_stops_polling() {
        let transport = Arc::new(ScriptedTransport::default());
        let client = client(transport.clone(), 100);
        let token = cancel();
        token.cancel();
        let err = client
            .poll_job(&JobId("job-1".into()), PollPolicy { interval: Duration::ZERO, max_attempts: 5 }, &token)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(transport.seen_tokens.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn activities_are_paged_by_offset() {
        let transport = Arc::new(ScriptedTransport::default());
        push(
            &transport.pages,
            200,
            r#"{"data":[{"id":1,"type":"TimeEntry","date":"2026-03-02","quantity_in_hours":1.5,"total":450,"user":{"name":"A"}},
                        {"id":2,"type":"TimeEntry","date":"2026-03-02","quantity_in_hours":0.5,"total":150,"user":{"name":"B"}}],
                "meta":{"paging":{"next":"https://billing.example/activities?offset=2"}}}"#,
        );
        push(
            &transport.pages,
            200,
            r#"{"data":[{"id":3,"type":"ExpenseEntry","date":"2026-03-02","total":80,"user":{"name":"A"}}],"meta":{"paging":{}}}"#,
        );
        let outcome = client(transport.clone(), 2)
            .fetch_window(EntityKind::TimeEntries, &range(1), &cancel())
            .await
            .unwrap();
        match outcome {
            FetchOutcome::Records(records) => assert_eq!(records.len(), 3),
            other => panic!("expected records, got {other:?}"),
        }
        assert_eq!(transport.offsets.lock().unwrap().clone(), vec![0, 2]);
    }

    #[tokio::test]
    async fn unreadable_activity_rows_still_advance_the_offset() {
        let transport = Arc::new(ScriptedTransport::default());
        push(
            &transport.pages,
            200,
            r#"{"data":[{"id":1,"type":"TimeEntry","date":"2026-03-02","quantity_in_hours":1,"total":300,"user":{"name":"A"}},
                        {"id":2,"type":"TimeEntry","date":"2026-03-02","quantity_in_hours":1,"user":{"name":"B"}}],
                "meta":{"paging":{"next":"p2"}}}"#,
        );
        push(
            &transport.pages,
            200,
            r#"{"data":[{"id":3,"type":"TimeEntry","date":"2026-03-02","user":{"name":"A"}},
                        {"id":4,"type":"TimeEntry","date":"2026-03-02","user":{"name":"B"}}],
                "meta":{"paging":{"next":"p3"}}}"#,
        );
        push(
            &transport.pages,
            200,
            r#"{"data":[{"id":5,"type":"TimeEntry","date":"2026-03-02","quantity_in_hours":2,"total":600,"user":{"name":"A"}},
                        {"id":6,"type":"TimeEntry","date":"2026-03-02","quantity_in_hours":1,"total":300,"user":{"name":"C"}}],
                "meta":{"paging":{}}}"#,
        );
        let outcome = client(transport.clone(), 2)
            .fetch_window(EntityKind::TimeEntries, &range(1), &cancel())
            .await
            .unwrap();
        match outcome {
            FetchOutcome::Records(records) => {
                let ids: Vec<&str> = records.iter().map(|r| r.upstream_id()).collect();
                assert_eq!(ids, vec!["1", "5", "6"]);
            }
            other => panic!("expected records, got {other:?}"),
        }
        assert_eq!(transport.offsets.lock().unwrap().clone(), vec![0, 2, 4]);
    }

    #[tokio::test]
    async fn activities_no_data_on_first_page() {
        let transport = Arc::new(ScriptedTransport::default());
        push(&transport.pages, 422, r#"{"error":"No records found"}"#);
        let outcome = client(transport, 50)
            .fetch_window(EntityKind::TimeEntries, &range(1), &cancel())
            .await
            .unwrap();
        assert_eq!(outcome, FetchOutcome::NoData(NoDataReason::UpstreamSignal));
    }
}
