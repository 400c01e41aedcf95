//! Entitlement persistence
//!
//! Every operation on [`EntitlementStore`] is a single atomic step at the
//! storage level. Callers never read a record, modify it in memory and write
//! it back: consumption, rollover and creation are conditional updates that
//! the store evaluates and applies indivisibly.
//!
//! Implementations:
//! - [`MemoryEntitlementStore`] - in-process, for dev mode and tests
//! - [`MongoEntitlementStore`] - MongoDB `findOneAndUpdate` based

pub mod memory;
pub mod mongo;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::registry::FeatureBudget;
use crate::types::{AggregateStats, EntitlementKey, EntitlementRecord, FeatureType, RecordStatus, StoreError};

pub use memory::MemoryEntitlementStore;
pub use mongo::MongoEntitlementStore;

/// Result type for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Values used to create a record that does not exist yet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreshRecord {
    pub budget: FeatureBudget,
    pub now: DateTime<Utc>,
}

impl FreshRecord {
    pub fn new(budget: FeatureBudget, now: DateTime<Utc>) -> Self {
        Self { budget, now }
    }

    pub fn into_record(self, key: &EntitlementKey) -> EntitlementRecord {
        EntitlementRecord::fresh(key, self.budget, self.now)
    }
}

/// Outcome of a conditional increment
#[derive(Debug, Clone, PartialEq)]
pub enum ConsumeOutcome {
    /// The increment was applied; holds the record after the update
    Applied(EntitlementRecord),
    /// The condition did not hold; holds the unchanged record
    Rejected(EntitlementRecord),
    /// No record exists for the key (removed by a sweep since it was loaded)
    Missing,
}

/// Persistence contract the engine depends on
#[async_trait]
pub trait EntitlementStore: Send + Sync {
    /// Atomic upsert: create the record from `fresh` if absent, otherwise
    /// return the stored record unchanged. Concurrent first calls for the same
    /// key create exactly one record.
    async fn find_or_initialize(
        &self,
        key: &EntitlementKey,
        fresh: FreshRecord,
    ) -> StoreResult<EntitlementRecord>;

    /// Read a record without creating it
    async fn find(&self, key: &EntitlementKey) -> StoreResult<Option<EntitlementRecord>>;

    /// Atomically increment `used_count` by one and set `last_used = now`,
    /// only if the record is active and `used_count` is below both
    /// `max_usage` and the stored record's own `max_usage`. The stored
    /// budget may be smaller when a rollover landed after the caller's read.
    async fn try_consume(
        &self,
        key: &EntitlementKey,
        max_usage: u32,
        now: DateTime<Utc>,
    ) -> StoreResult<ConsumeOutcome>;

    /// Start a new period at `now` with `budget`, only if the stored
    /// `period_start` still equals `observed_period_start`.
    ///
    /// Returns the record after the update, or the current record if another
    /// caller already rolled it over. `None` if the record no longer exists.
    async fn apply_rollover(
        &self,
        key: &EntitlementKey,
        observed_period_start: DateTime<Utc>,
        now: DateTime<Utc>,
        budget: FeatureBudget,
    ) -> StoreResult<Option<EntitlementRecord>>;

    /// Unconditionally start a new period and reactivate, creating the record
    /// if absent.
    async fn reset(
        &self,
        key: &EntitlementKey,
        now: DateTime<Utc>,
        budget: FeatureBudget,
    ) -> StoreResult<EntitlementRecord>;

    /// Set the administrative status, creating the record from `fresh` if absent
    async fn set_status(
        &self,
        key: &EntitlementKey,
        status: RecordStatus,
        fresh: FreshRecord,
    ) -> StoreResult<EntitlementRecord>;

    /// Usage grouped by `(identifier_kind, feature_type)`, ordered by group
    async fn aggregate_stats(
        &self,
        feature_type: Option<&FeatureType>,
    ) -> StoreResult<Vec<AggregateStats>>;

    /// Delete records with zero usage whose last activity is before `cutoff`.
    /// Returns the number deleted.
    async fn sweep_stale(&self, cutoff: DateTime<Utc>) -> StoreResult<u64>;
}
