//! In-memory entitlement store
//!
//! Records live in a [`DashMap`]. Every operation holds the shard lock of its
//! key for the whole read-decide-write step, which gives the same atomicity
//! the MongoDB store gets from `findOneAndUpdate`. State is per-process, so
//! this store is for dev mode and tests only.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::BTreeMap;
use tracing::debug;

use super::{ConsumeOutcome, EntitlementStore, FreshRecord, StoreResult};
use crate::registry::FeatureBudget;
use crate::types::{
    AggregateStats, EntitlementKey, EntitlementRecord, FeatureType, IdentifierKind, RecordStatus,
};

/// DashMap-backed entitlement store
#[derive(Debug, Default)]
pub struct MemoryEntitlementStore {
    records: DashMap<EntitlementKey, EntitlementRecord>,
}

impl MemoryEntitlementStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Insert or overwrite a record as-is (seeding fixtures and imports)
    pub fn insert(&self, record: EntitlementRecord) {
        self.records.insert(record.key(), record);
    }
}

#[async_trait]
impl EntitlementStore for MemoryEntitlementStore {
    async fn find_or_initialize(
        &self,
        key: &EntitlementKey,
        fresh: FreshRecord,
    ) -> StoreResult<EntitlementRecord> {
        let record = self
            .records
            .entry(key.clone())
            .or_insert_with(|| {
                debug!("Initializing entitlement {}", key);
                fresh.into_record(key)
            })
            .clone();
        Ok(record)
    }

    async fn find(&self, key: &EntitlementKey) -> StoreResult<Option<EntitlementRecord>> {
        Ok(self.records.get(key).map(|r| r.clone()))
    }

    async fn try_consume(
        &self,
        key: &EntitlementKey,
        max_usage: u32,
        now: DateTime<Utc>,
    ) -> StoreResult<ConsumeOutcome> {
        let Some(mut record) = self.records.get_mut(key) else {
            return Ok(ConsumeOutcome::Missing);
        };

        let limit = max_usage.min(record.max_usage);
        if record.status == RecordStatus::Active && record.used_count < limit {
            record.used_count += 1;
            record.last_used = Some(now);
            Ok(ConsumeOutcome::Applied(record.clone()))
        } else {
            Ok(ConsumeOutcome::Rejected(record.clone()))
        }
    }

    async fn apply_rollover(
        &self,
        key: &EntitlementKey,
        observed_period_start: DateTime<Utc>,
        now: DateTime<Utc>,
        budget: FeatureBudget,
    ) -> StoreResult<Option<EntitlementRecord>> {
        let Some(mut record) = self.records.get_mut(key) else {
            return Ok(None);
        };

        if record.period_start == observed_period_start {
            record.start_period(budget, now);
        } else {
            debug!("Rollover of {} already applied by another caller", key);
        }
        Ok(Some(record.clone()))
    }

    async fn reset(
        &self,
        key: &EntitlementKey,
        now: DateTime<Utc>,
        budget: FeatureBudget,
    ) -> StoreResult<EntitlementRecord> {
        let record = self
            .records
            .entry(key.clone())
            .and_modify(|record| {
                record.start_period(budget, now);
                record.status = RecordStatus::Active;
            })
            .or_insert_with(|| EntitlementRecord::fresh(key, budget, now))
            .clone();
        Ok(record)
    }

    async fn set_status(
        &self,
        key: &EntitlementKey,
        status: RecordStatus,
        fresh: FreshRecord,
    ) -> StoreResult<EntitlementRecord> {
        let mut entry = self
            .records
            .entry(key.clone())
            .or_insert_with(|| fresh.into_record(key));
        entry.status = status;
        Ok(entry.clone())
    }

    async fn aggregate_stats(
        &self,
        feature_type: Option<&FeatureType>,
    ) -> StoreResult<Vec<AggregateStats>> {
        let mut groups: BTreeMap<(IdentifierKind, FeatureType), AggregateStats> = BTreeMap::new();

        for entry in self.records.iter() {
            let record = entry.value();
            if feature_type.is_some_and(|f| *f != record.feature_type) {
                continue;
            }
            groups
                .entry((record.identifier_kind, record.feature_type.clone()))
                .or_insert_with(|| {
                    AggregateStats::empty(record.identifier_kind, record.feature_type.clone())
                })
                .add(record);
        }

        Ok(groups.into_values().collect())
    }

    async fn sweep_stale(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let before = self.records.len();
        self.records
            .retain(|_, record| !(record.used_count == 0 && record.last_activity() < cutoff));
        Ok(before.saturating_sub(self.records.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn key(identifier: &str) -> EntitlementKey {
        EntitlementKey::new(identifier, IdentifierKind::Ip, "submit-on-demand-run").unwrap()
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap()
    }

    fn fresh(max_usage: u32) -> FreshRecord {
        FreshRecord::new(FeatureBudget::new(max_usage, 30), t0())
    }

    #[tokio::test]
    async fn test_find_or_initialize_returns_existing_unchanged() {
        let store = MemoryEntitlementStore::new();
        let first = store.find_or_initialize(&key("a"), fresh(2)).await.unwrap();
        assert_eq!(first.max_usage, 2);

        // A different budget must not overwrite the stored record
        let second = store.find_or_initialize(&key("a"), fresh(9)).await.unwrap();
        assert_eq!(second.max_usage, 2);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_try_consume_stops_at_max() {
        let store = MemoryEntitlementStore::new();
        store.find_or_initialize(&key("a"), fresh(2)).await.unwrap();

        for expected in 1..=2 {
            match store.try_consume(&key("a"), 2, t0()).await.unwrap() {
                ConsumeOutcome::Applied(r) => assert_eq!(r.used_count, expected),
                other => panic!("expected applied, got {:?}", other),
            }
        }
        match store.try_consume(&key("a"), 2, t0()).await.unwrap() {
            ConsumeOutcome::Rejected(r) => assert_eq!(r.used_count, 2),
            other => panic!("expected rejected, got {:?}", other),
        }
        assert_eq!(
            store.try_consume(&key("missing"), 2, t0()).await.unwrap(),
            ConsumeOutcome::Missing
        );
    }

    #[tokio::test]
    async fn test_try_consume_honors_stored_budget() {
        let store = MemoryEntitlementStore::new();
        store.find_or_initialize(&key("a"), fresh(1)).await.unwrap();
        store.try_consume(&key("a"), 1, t0()).await.unwrap();

        // Caller still holds a view with the larger budget
        match store.try_consume(&key("a"), 5, t0()).await.unwrap() {
            ConsumeOutcome::Rejected(r) => {
                assert_eq!(r.used_count, 1);
                assert_eq!(r.max_usage, 1);
            }
            other => panic!("expected rejected, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rollover_guard() {
        let store = MemoryEntitlementStore::new();
        let record = store.find_or_initialize(&key("a"), fresh(2)).await.unwrap();
        store.try_consume(&key("a"), 2, t0()).await.unwrap();

        let later = t0() + Duration::days(31);
        let rolled = store
            .apply_rollover(&key("a"), record.period_start, later, FeatureBudget::new(4, 30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rolled.used_count, 0);
        assert_eq!(rolled.max_usage, 4);
        assert_eq!(rolled.period_start, later);

        store.try_consume(&key("a"), 4, later).await.unwrap();

        // A second rollover based on the stale observation must not reset again
        let stale = store
            .apply_rollover(
                &key("a"),
                record.period_start,
                later + Duration::seconds(1),
                FeatureBudget::new(4, 30),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stale.used_count, 1);
        assert_eq!(stale.period_start, later);
    }

    #[tokio::test]
    async fn test_suspended_record_rejects_consume() {
        let store = MemoryEntitlementStore::new();
        let suspended = store
            .set_status(&key("a"), RecordStatus::Suspended, fresh(5))
            .await
            .unwrap();
        assert_eq!(suspended.status, RecordStatus::Suspended);

        assert!(matches!(
            store.try_consume(&key("a"), 5, t0()).await.unwrap(),
            ConsumeOutcome::Rejected(_)
        ));

        let reset = store
            .reset(&key("a"), t0(), FeatureBudget::new(5, 30))
            .await
            .unwrap();
        assert_eq!(reset.status, RecordStatus::Active);
    }

    #[tokio::test]
    async fn test_sweep_keeps_used_and_recent_records() {
        let store = MemoryEntitlementStore::new();
        store.find_or_initialize(&key("idle"), fresh(5)).await.unwrap();
        store.find_or_initialize(&key("used"), fresh(5)).await.unwrap();
        store.try_consume(&key("used"), 5, t0()).await.unwrap();
        store
            .find_or_initialize(
                &key("recent"),
                FreshRecord::new(FeatureBudget::new(5, 30), t0() + Duration::days(90)),
            )
            .await
            .unwrap();

        let deleted = store.sweep_stale(t0() + Duration::days(60)).await.unwrap();
        assert_eq!(deleted, 1);
        assert!(store.find(&key("idle")).await.unwrap().is_none());
        assert!(store.find(&key("used")).await.unwrap().is_some());
        assert!(store.find(&key("recent")).await.unwrap().is_some());
    }
}
