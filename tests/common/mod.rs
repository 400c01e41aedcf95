//! Shared fixtures for engine integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tollgate::clock::{Clock, ManualClock};
use tollgate::registry::{BudgetTable, ConfigRegistry, FeatureBudget};
use tollgate::store::{ConsumeOutcome, EntitlementStore, FreshRecord, StoreResult};
use tollgate::types::{
    AggregateStats, EntitlementKey, EntitlementRecord, FeatureType, RecordStatus, StoreError,
};
use tollgate::{EntitlementEngine, MemoryEntitlementStore};

pub const ON_DEMAND: &str = "submit-on-demand-run";

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 15, 9, 0, 0).unwrap()
}

/// Registry with `submit-on-demand-run` limited to `max_usage` per 30 days
pub fn registry(max_usage: u32) -> Arc<ConfigRegistry> {
    let table = BudgetTable::default()
        .with_budget(ON_DEMAND, FeatureBudget::new(max_usage, 30))
        .unwrap();
    Arc::new(ConfigRegistry::new(table))
}

pub struct Harness {
    pub engine: EntitlementEngine,
    pub store: Arc<MemoryEntitlementStore>,
    pub clock: ManualClock,
}

impl Harness {
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

pub fn harness(max_usage: u32) -> Harness {
    let store = Arc::new(MemoryEntitlementStore::new());
    let clock = ManualClock::new(start_time());
    let engine = EntitlementEngine::new(store.clone(), registry(max_usage))
        .with_clock(Arc::new(clock.clone()));
    Harness {
        engine,
        store,
        clock,
    }
}

/// Store wrapper whose every operation fails while an outage is active
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryEntitlementStore,
    outage: AtomicBool,
    calls: AtomicUsize,
}

impl FlakyStore {
    pub fn set_outage(&self, down: bool) {
        self.outage.store(down, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn check(&self) -> StoreResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.outage.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl EntitlementStore for FlakyStore {
    async fn find_or_initialize(
        &self,
        key: &EntitlementKey,
        fresh: FreshRecord,
    ) -> StoreResult<EntitlementRecord> {
        self.check()?;
        self.inner.find_or_initialize(key, fresh).await
    }

    async fn find(&self, key: &EntitlementKey) -> StoreResult<Option<EntitlementRecord>> {
        self.check()?;
        self.inner.find(key).await
    }

    async fn try_consume(
        &self,
        key: &EntitlementKey,
        max_usage: u32,
        now: DateTime<Utc>,
    ) -> StoreResult<ConsumeOutcome> {
        self.check()?;
        self.inner.try_consume(key, max_usage, now).await
    }

    async fn apply_rollover(
        &self,
        key: &EntitlementKey,
        observed_period_start: DateTime<Utc>,
        now: DateTime<Utc>,
        budget: FeatureBudget,
    ) -> StoreResult<Option<EntitlementRecord>> {
        self.check()?;
        self.inner
            .apply_rollover(key, observed_period_start, now, budget)
            .await
    }

    async fn reset(
        &self,
        key: &EntitlementKey,
        now: DateTime<Utc>,
        budget: FeatureBudget,
    ) -> StoreResult<EntitlementRecord> {
        self.check()?;
        self.inner.reset(key, now, budget).await
    }

    async fn set_status(
        &self,
        key: &EntitlementKey,
        status: RecordStatus,
        fresh: FreshRecord,
    ) -> StoreResult<EntitlementRecord> {
        self.check()?;
        self.inner.set_status(key, status, fresh).await
    }

    async fn aggregate_stats(
        &self,
        feature_type: Option<&FeatureType>,
    ) -> StoreResult<Vec<AggregateStats>> {
        self.check()?;
        self.inner.aggregate_stats(feature_type).await
    }

    async fn sweep_stale(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        self.check()?;
        self.inner.sweep_stale(cutoff).await
    }
}
