//! Hot/Warm/Cold cadences per entity kind, driven by one periodic tick.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use billsync_core::{Clock, DateRange, EntityKind, SyncError, Tier};
use chrono::{DateTime, NaiveDate, Timelike, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, warn};

pub const DEFAULT_TICK_CRON: &str = "*/30 * * * * *";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TierSpec {
    pub tier: Tier,
    pub start_days_back: u32,
    pub end_days_back: u32,
    pub enabled: bool,
}

impl TierSpec {
    pub fn default_for(tier: Tier) -> Self {
        let (start_days_back, end_days_back) = match tier {
            Tier::Hot => (7, 1),
            Tier::Warm => (21, 3),
            Tier::Cold => (56, 14),
        };
        Self {
            tier,
            start_days_back,
            end_days_back,
            enabled: true,
        }
    }

    pub fn defaults() -> Vec<TierSpec> {
        Tier::ALL.iter().map(|t| Self::default_for(*t)).collect()
    }

    pub fn window(&self, today: NaiveDate) -> Result<DateRange, SyncError> {
        DateRange::days_back(today, self.start_days_back, self.end_days_back)
    }

    /// Identifies the cadence bucket `now` falls in: hour, 6-hour block, or day.
    pub fn slot_key(&self, now: DateTime<Utc>) -> String {
        let day = now.date_naive();
        match self.tier {
            Tier::Hot => format!("{day}T{:02}", now.hour()),
            Tier::Warm => format!("{day}B{}", now.hour() / 6),
            Tier::Cold => day.to_string(),
        }
    }
}

/// Runs one tier's window. Implemented by the sync service; faked in tests.
#[async_trait]
pub trait TierRunner: Send + Sync {
    async fn run_tier(&self, kind: EntityKind, tier: Tier, range: DateRange) -> Result<(), SyncError>;
}

#[derive(Debug, Default)]
struct TierState {
    running: AtomicBool,
    last_slot: Mutex<Option<String>>,
}

impl TierState {
    /// Claims `slot` unless it already fired or a previous run is still in flight.
    /// A busy tier does not consume the slot.
    fn try_claim(self: &Arc<Self>, slot: &str) -> Option<TierClaim> {
        let mut last = self.last_slot.lock().unwrap_or_else(|p| p.into_inner());
        if last.as_deref() == Some(slot) {
            return None;
        }
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return None;
        }
        *last = Some(slot.to_string());
        Some(TierClaim { state: self.clone() })
    }
}

struct TierClaim {
    state: Arc<TierState>,
}

impl Drop for TierClaim {
    fn drop(&mut self) {
        self.state.running.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TierStatus {
    pub kind: EntityKind,
    pub tier: Tier,
    pub enabled: bool,
    pub running: bool,
    pub last_slot: Option<String>,
}

pub struct TieredScheduler {
    runner: Arc<dyn TierRunner>,
    specs: Vec<TierSpec>,
    kinds: Vec<EntityKind>,
    states: HashMap<(EntityKind, Tier), Arc<TierState>>,
}

impl TieredScheduler {
    pub fn new(runner: Arc<dyn TierRunner>, specs: Vec<TierSpec>) -> Self {
        let kinds = EntityKind::ALL.to_vec();
        let states = kinds
            .iter()
            .flat_map(|kind| specs.iter().map(move |spec| ((*kind, spec.tier), Arc::default())))
            .collect();
        Self {
            runner,
            specs,
            kinds,
            states,
        }
    }

    /// Launches every eligible tier as a detached task and returns their handles.
    pub fn tick(&self, now: DateTime<Utc>) -> Vec<JoinHandle<()>> {
        let today = now.date_naive();
        let mut launched = Vec::new();
        for spec in self.specs.iter().filter(|s| s.enabled) {
            let slot = spec.slot_key(now);
            for &kind in &self.kinds {
                let Some(state) = self.states.get(&(kind, spec.tier)) else {
                    continue;
                };
                let Some(claim) = state.try_claim(&slot) else {
                    debug!(kind = kind.as_str(), tier = spec.tier.as_str(), %slot, "tier not due or still running");
                    continue;
                };
                let range = match spec.window(today) {
                    Ok(range) => range,
                    Err(err) => {
                        error!(tier = spec.tier.as_str(), error = %err, "tier window misconfigured");
                        continue;
                    }
                };
                let tier = spec.tier;
                let runner = self.runner.clone();
                info!(kind = kind.as_str(), tier = tier.as_str(), %range, %slot, "tier firing");
                launched.push(tokio::spawn(async move {
                    let _claim = claim;
                    if let Err(err) = runner.run_tier(kind, tier, range).await {
                        warn!(kind = kind.as_str(), tier = tier.as_str(), error = %err, "scheduled run failed");
                    }
                }));
            }
        }
        launched
    }

    pub fn status(&self) -> Vec<TierStatus> {
        let mut out = Vec::new();
        for &kind in &self.kinds {
            for spec in &self.specs {
                if let Some(state) = self.states.get(&(kind, spec.tier)) {
                    out.push(TierStatus {
                        kind,
                        tier: spec.tier,
                        enabled: spec.enabled,
                        running: state.running.load(Ordering::SeqCst),
                        last_slot: state
                            .last_slot
                            .lock()
                            .unwrap_or_else(|p| p.into_inner())
                            .clone(),
                    });
                }
            }
        }
        out
    }
}

/// Cron job that calls [`TieredScheduler::tick`]; the caller starts it.
pub async fn build_cron_driver(
    scheduler: Arc<TieredScheduler>,
    clock: Arc<dyn Clock>,
    cron: &str,
) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let scheduler = scheduler.clone();
        let clock = clock.clone();
        Box::pin(async move {
            let launched = scheduler.tick(clock.now());
            if !launched.is_empty() {
                debug!(count = launched.len(), "tiers launched");
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tokio::sync::Notify;

    /// Blocks every run until released, counting starts per (kind, tier).
    #[derive(Default)]
    struct GatedRunner {
        started: Mutex<Vec<(EntityKind, Tier, DateRange)>>,
        gate: Notify,
    }

    #[async_trait]
    impl TierRunner for GatedRunner {
        async fn run_tier(&self, kind: EntityKind, tier: Tier, range: DateRange) -> Result<(), SyncError> {
            self.started.lock().unwrap().push((kind, tier, range));
            self.gate.notified().await;
            Ok(())
        }
    }

    impl GatedRunner {
        fn starts(&self, kind: EntityKind, tier: Tier) -> usize {
            self.started
                .lock()
                .unwrap()
                .iter()
                .filter(|(k, t, _)| *k == kind && *t == tier)
                .count()
        }
    }

    fn at(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, day, hour, minute, 0).unwrap()
    }

    fn hot_only() -> Vec<TierSpec> {
        vec![TierSpec::default_for(Tier::Hot)]
    }

    async fn release_all(runner: &GatedRunner, handles: Vec<JoinHandle<()>>) {
        while handles.iter().any(|h| !h.is_finished()) {
            runner.gate.notify_waiters();
            tokio::task::yield_now().await;
        }
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[test]
    fn slot_keys_follow_tier_cadence() {
        let hot = TierSpec::default_for(Tier::Hot);
        let warm = TierSpec::default_for(Tier::Warm);
        let cold = TierSpec::default_for(Tier::Cold);

        assert_eq!(hot.slot_key(at(3, 9, 0)), hot.slot_key(at(3, 9, 59)));
        assert_ne!(hot.slot_key(at(3, 9, 59)), hot.slot_key(at(3, 10, 0)));
        assert_eq!(warm.slot_key(at(3, 6, 0)), warm.slot_key(at(3, 11, 30)));
        assert_ne!(warm.slot_key(at(3, 11, 30)), warm.slot_key(at(3, 12, 0)));
        assert_eq!(cold.slot_key(at(3, 0, 0)), cold.slot_key(at(3, 23, 59)));
    }

    #[test]
    fn tier_windows_count_back_from_today() {
        let today = NaiveDate::from_ymd_opt(2026, 4, 20).unwrap();
        let cold = TierSpec::default_for(Tier::Cold).window(today).unwrap();
        assert_eq!(cold.start, NaiveDate::from_ymd_opt(2026, 2, 23).unwrap());
        assert_eq!(cold.end, NaiveDate::from_ymd_opt(2026, 4, 6).unwrap());
    }

    #[tokio::test]
    async fn simultaneous_ticks_in_one_slot_run_once() {
        let runner = Arc::new(GatedRunner::default());
        let scheduler = Arc::new(TieredScheduler::new(runner.clone(), hot_only()));

        let first = scheduler.tick(at(5, 10, 0));
        let second = scheduler.tick(at(5, 10, 0));
        assert_eq!(first.len(), 2); // one per entity kind
        assert!(second.is_empty());

        release_all(&runner, first).await;
        assert_eq!(runner.starts(EntityKind::Payments, Tier::Hot), 1);
        assert_eq!(runner.starts(EntityKind::TimeEntries, Tier::Hot), 1);
    }

    #[tokio::test]
    async fn running_tier_skips_next_slot_without_consuming_it() {
        let runner = Arc::new(GatedRunner::default());
        let scheduler = Arc::new(TieredScheduler::new(runner.clone(), hot_only()));

        let first = scheduler.tick(at(5, 10, 0));
        assert!(scheduler.tick(at(5, 11, 0)).is_empty());
        assert!(scheduler.status().iter().all(|s| s.running));

        release_all(&runner, first).await;
        let retry = scheduler.tick(at(5, 11, 0));
        assert_eq!(retry.len(), 2);
        release_all(&runner, retry).await;
        assert_eq!(runner.starts(EntityKind::Payments, Tier::Hot), 2);
    }

    #[tokio::test]
    async fn tiers_and_kinds_run_independently() {
        let runner = Arc::new(GatedRunner::default());
        let scheduler = Arc::new(TieredScheduler::new(runner.clone(), TierSpec::defaults()));

        let handles = scheduler.tick(at(6, 0, 0));
        assert_eq!(handles.len(), 6);
        // Hot moves to a new slot while warm and cold are still in their first one.
        let mut later = Vec::new();
        release_all(&runner, handles).await;
        later.extend(scheduler.tick(at(6, 1, 0)));
        assert_eq!(later.len(), 2);
        release_all(&runner, later).await;
        assert_eq!(runner.starts(EntityKind::Payments, Tier::Warm), 1);
        assert_eq!(runner.starts(EntityKind::Payments, Tier::Cold), 1);
        assert_eq!(runner.starts(EntityKind::Payments, Tier::Hot), 2);
    }

    #[tokio::test]
    async fn disabled_tier_never_fires() {
        let runner = Arc::new(GatedRunner::default());
        let mut specs = TierSpec::defaults();
        specs[2].enabled = false;
        let scheduler = TieredScheduler::new(runner.clone(), specs);
        let handles = scheduler.tick(at(7, 0, 0));
        assert_eq!(handles.len(), 4);
        release_all(&runner, handles).await;
        assert_eq!(runner.starts(EntityKind::Payments, Tier::Cold), 0);
    }
}
