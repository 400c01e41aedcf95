//! Entitlement engine
//!
//! Orchestrates the budget registry, the rollover policy and the store.
//! The engine holds no locks and no per-key state: every call is a short
//! sequence of atomic store operations, and all coordination between
//! concurrent callers happens inside the store.
//!
//! Failure policy:
//! - `consume` fails closed: a store error aborts the attempt and is returned,
//!   never interpreted as success.
//! - `check_eligibility` fails loud: a store error is returned, never replaced
//!   by a zeroed result.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::registry::ConfigRegistry;
use crate::store::{ConsumeOutcome, EntitlementStore, FreshRecord};
use crate::types::{
    AggregateStats, ConsumeResult, EligibilityResult, EntitlementKey, EntitlementRecord,
    FeatureType, IdentifierKind, RecordStatus, Result, StoreError, ValidationError,
};

/// Attempts before giving up when a record disappears mid-operation
/// (a concurrent sweep deleted it)
const MAX_ATTEMPTS: usize = 3;

/// Entitlement metering engine
#[derive(Clone)]
pub struct EntitlementEngine {
    store: Arc<dyn EntitlementStore>,
    registry: Arc<ConfigRegistry>,
    clock: Arc<dyn Clock>,
}

impl EntitlementEngine {
    pub fn new(store: Arc<dyn EntitlementStore>, registry: Arc<ConfigRegistry>) -> Self {
        Self {
            store,
            registry,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the time source
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn registry(&self) -> &Arc<ConfigRegistry> {
        &self.registry
    }

    /// Whether a consume would currently succeed.
    ///
    /// Never increments usage, but lazily creates the record and rolls over
    /// a lapsed period.
    pub async fn check_eligibility(
        &self,
        identifier: &str,
        identifier_kind: IdentifierKind,
        feature_type: &str,
    ) -> Result<EligibilityResult> {
        let key = EntitlementKey::new(identifier, identifier_kind, feature_type)?;
        let now = self.clock.now();

        let record = self
            .load_current(&key, now)
            .await
            .map_err(|e| log_store_error("check_eligibility", &key, e))?;

        let result = EligibilityResult::from_record(&record, now);
        debug!(
            "Eligibility {}: eligible={} remaining={}/{}",
            key, result.eligible, result.remaining_usage, result.max_usage
        );
        Ok(result)
    }

    /// Consume one unit of the current period's budget.
    ///
    /// An exhausted budget or a suspended record is a `Denied` result, not an
    /// error. Errors are infrastructure failures only.
    pub async fn consume(
        &self,
        identifier: &str,
        identifier_kind: IdentifierKind,
        feature_type: &str,
    ) -> Result<ConsumeResult> {
        let key = EntitlementKey::new(identifier, identifier_kind, feature_type)?;
        let now = self.clock.now();

        let result = self
            .consume_key(&key, now)
            .await
            .map_err(|e| log_store_error("consume", &key, e))?;
        Ok(result)
    }

    async fn consume_key(
        &self,
        key: &EntitlementKey,
        now: DateTime<Utc>,
    ) -> std::result::Result<ConsumeResult, StoreError> {
        for _ in 0..MAX_ATTEMPTS {
            let record = self.load_current(key, now).await?;

            match self.store.try_consume(key, record.max_usage, now).await? {
                ConsumeOutcome::Applied(after) => {
                    debug!(
                        "Consumed {}: {}/{}",
                        key, after.used_count, after.max_usage
                    );
                    return Ok(ConsumeResult::granted(&after));
                }
                ConsumeOutcome::Rejected(after) => {
                    info!(
                        "Consume denied for {} (status={}, used={}/{})",
                        key, after.status, after.used_count, after.max_usage
                    );
                    return Ok(ConsumeResult::denied(&after));
                }
                ConsumeOutcome::Missing => {
                    warn!("Entitlement {} removed during consume, retrying", key);
                }
            }
        }

        Err(StoreError::Conflict(format!(
            "{} kept disappearing during consume",
            key
        )))
    }

    /// Load or lazily create the record, rolling over a lapsed period.
    ///
    /// Rollover snapshots the budget currently registered for the feature
    /// and starts the new period at `now` (missed periods are not replayed).
    async fn load_current(
        &self,
        key: &EntitlementKey,
        now: DateTime<Utc>,
    ) -> std::result::Result<EntitlementRecord, StoreError> {
        for _ in 0..MAX_ATTEMPTS {
            let budget = self.registry.get_config(&key.feature_type);
            let record = self
                .store
                .find_or_initialize(key, FreshRecord::new(budget, now))
                .await?;

            if !record.is_expired(now) {
                return Ok(record);
            }

            match self
                .store
                .apply_rollover(key, record.period_start, now, budget)
                .await?
            {
                Some(rolled) => {
                    info!(
                        "Rolled over {} (period started {}, used {}/{})",
                        key, record.period_start, record.used_count, record.max_usage
                    );
                    return Ok(rolled);
                }
                None => warn!("Entitlement {} removed during rollover, retrying", key),
            }
        }

        Err(StoreError::Conflict(format!(
            "{} kept disappearing during initialization",
            key
        )))
    }

    /// Administrative reset: new period from now, zero usage, active status.
    /// Idempotent apart from the period start moving to the call time.
    pub async fn reset(
        &self,
        identifier: &str,
        identifier_kind: IdentifierKind,
        feature_type: &str,
    ) -> Result<EntitlementRecord> {
        let key = EntitlementKey::new(identifier, identifier_kind, feature_type)?;
        let now = self.clock.now();
        let budget = self.registry.get_config(&key.feature_type);

        let record = self
            .store
            .reset(&key, now, budget)
            .await
            .map_err(|e| log_store_error("reset", &key, e))?;

        info!("Reset entitlement {}", key);
        Ok(record)
    }

    /// Administrative status change (`active` or `suspended`).
    ///
    /// Does not touch usage or the period.
    pub async fn set_status(
        &self,
        identifier: &str,
        identifier_kind: IdentifierKind,
        feature_type: &str,
        status: RecordStatus,
    ) -> Result<EntitlementRecord> {
        let key = EntitlementKey::new(identifier, identifier_kind, feature_type)?;
        let now = self.clock.now();
        let budget = self.registry.get_config(&key.feature_type);

        let record = self
            .store
            .set_status(&key, status, FreshRecord::new(budget, now))
            .await
            .map_err(|e| log_store_error("set_status", &key, e))?;

        info!("Entitlement {} is now {}", key, status);
        Ok(record)
    }

    /// Stored record, without creating or rolling it over
    pub async fn get_record(
        &self,
        identifier: &str,
        identifier_kind: IdentifierKind,
        feature_type: &str,
    ) -> Result<Option<EntitlementRecord>> {
        let key = EntitlementKey::new(identifier, identifier_kind, feature_type)?;
        let record = self
            .store
            .find(&key)
            .await
            .map_err(|e| log_store_error("get_record", &key, e))?;
        Ok(record)
    }

    /// Usage grouped by `(identifier_kind, feature_type)`, optionally limited
    /// to one feature type. Read-only.
    pub async fn get_stats(&self, feature_type: Option<&str>) -> Result<Vec<AggregateStats>> {
        let feature_type = feature_type.map(FeatureType::new).transpose()?;
        let stats = self
            .store
            .aggregate_stats(feature_type.as_ref())
            .await
            .map_err(|e| {
                error!("Store failure during get_stats: {}", e);
                e
            })?;
        Ok(stats)
    }

    /// Delete records that were never consumed within the retention window.
    ///
    /// A record qualifies only with `used_count == 0` and a last consume (or,
    /// if never consumed, creation) older than `retention_days`.
    pub async fn sweep_stale_zero_usage_records(&self, retention_days: u32) -> Result<u64> {
        if retention_days == 0 {
            return Err(ValidationError::InvalidRetention.into());
        }
        let cutoff = self
            .clock
            .now()
            .checked_sub_signed(Duration::days(i64::from(retention_days)))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let deleted = self.store.sweep_stale(cutoff).await.map_err(|e| {
            error!("Store failure during sweep: {}", e);
            e
        })?;

        info!(
            "Swept {} stale zero-usage entitlement(s) idle since before {}",
            deleted, cutoff
        );
        Ok(deleted)
    }
}

fn log_store_error(operation: &str, key: &EntitlementKey, err: StoreError) -> StoreError {
    error!("Store failure during {} for {}: {}", operation, key, err);
    err
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::registry::{BudgetTable, FeatureBudget};
    use crate::store::MemoryEntitlementStore;
    use crate::types::EntitlementError;
    use chrono::TimeZone;

    fn engine() -> (EntitlementEngine, Arc<MemoryEntitlementStore>, ManualClock) {
        let store = Arc::new(MemoryEntitlementStore::new());
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap());
        let registry = Arc::new(ConfigRegistry::new(BudgetTable::new(FeatureBudget::new(
            2, 30,
        ))));
        let engine =
            EntitlementEngine::new(store.clone(), registry).with_clock(Arc::new(clock.clone()));
        (engine, store, clock)
    }

    #[tokio::test]
    async fn test_blank_identifier_never_reaches_store() {
        let (engine, store, _) = engine();

        let err = engine
            .consume("   ", IdentifierKind::Ip, "create-clip")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EntitlementError::Validation(ValidationError::EmptyIdentifier)
        ));
        assert!(!err.is_server_fault());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_zero_retention_rejected() {
        let (engine, _, _) = engine();
        let err = engine.sweep_stale_zero_usage_records(0).await.unwrap_err();
        assert!(matches!(
            err,
            EntitlementError::Validation(ValidationError::InvalidRetention)
        ));
    }

    #[tokio::test]
    async fn test_denied_after_default_budget() {
        let (engine, _, clock) = engine();

        for _ in 0..2 {
            let result = engine
                .consume("a@b.c", IdentifierKind::Email, "create-clip")
                .await
                .unwrap();
            assert!(result.is_success());
        }

        let denied = engine
            .consume("a@b.c", IdentifierKind::Email, "create-clip")
            .await
            .unwrap();
        assert!(!denied.is_success());
        assert_eq!(denied.remaining_usage(), 0);

        clock.advance_days(30);
        let granted = engine
            .consume("a@b.c", IdentifierKind::Email, "create-clip")
            .await
            .unwrap();
        assert!(granted.is_success());
        assert_eq!(granted.remaining_usage(), 1);
    }

    #[tokio::test]
    async fn test_registry_change_applies_on_next_period() {
        let (engine, _, clock) = engine();
        engine
            .consume("10.1.1.1", IdentifierKind::Ip, "search-quotes")
            .await
            .unwrap();

        engine
            .registry()
            .set_budget(
                FeatureType::new("search-quotes").unwrap(),
                FeatureBudget::new(50, 7),
            )
            .unwrap();

        let before = engine
            .check_eligibility("10.1.1.1", IdentifierKind::Ip, "search-quotes")
            .await
            .unwrap();
        assert_eq!(before.max_usage, 2);

        clock.advance_days(30);
        let after = engine
            .check_eligibility("10.1.1.1", IdentifierKind::Ip, "search-quotes")
            .await
            .unwrap();
        assert_eq!(after.max_usage, 50);
        assert_eq!(after.used_count, 0);
    }
}
