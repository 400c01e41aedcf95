//! MongoDB entitlement store
//!
//! Each trait operation maps onto one conditional `findOneAndUpdate`,
//! `deleteMany` or aggregation. A follow-up read is issued only to report the
//! unchanged record after a conditional update did not match.

use async_trait::async_trait;
use bson::{doc, Bson, DateTime as BsonDateTime, Document};
use chrono::{DateTime, Utc};
use std::future::Future;
use tracing::debug;

use super::{ConsumeOutcome, EntitlementStore, FreshRecord, StoreResult};
use crate::db::mongo::{MongoClient, MongoCollection};
use crate::db::schemas::EntitlementDoc;
use crate::registry::FeatureBudget;
use crate::rollover;
use crate::types::{
    AggregateStats, EntitlementKey, EntitlementRecord, FeatureType, IdentifierKind, RecordStatus,
    StoreError,
};

/// MongoDB-backed entitlement store
#[derive(Clone)]
pub struct MongoEntitlementStore {
    collection: MongoCollection<EntitlementDoc>,
}

impl MongoEntitlementStore {
    /// Open the collection and ensure its indexes exist
    pub async fn new(mongo: &MongoClient, collection_name: &str) -> StoreResult<Self> {
        let collection = mongo.collection::<EntitlementDoc>(collection_name).await?;
        Ok(Self { collection })
    }

    async fn read(&self, key: &EntitlementKey) -> StoreResult<Option<EntitlementRecord>> {
        self.collection
            .find_one(key_filter(key))
            .await?
            .map(EntitlementRecord::try_from)
            .transpose()
    }

    /// Conditional upsert of `update` on the key
    async fn upsert(
        &self,
        key: &EntitlementKey,
        update: Document,
    ) -> StoreResult<EntitlementRecord> {
        let doc = retry_lost_upsert(key, || {
            self.collection
                .find_one_and_update(key_filter(key), update.clone(), true)
        })
        .await?;
        EntitlementRecord::try_from(doc)
    }
}

/// Run an upserting `findOneAndUpdate`, re-issuing it once if it lost the
/// insert race to a concurrent caller. The second attempt matches the
/// winner's document, so the update is still applied rather than dropped.
pub async fn retry_lost_upsert<T, F, Fut>(key: &EntitlementKey, mut attempt: F) -> StoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<Option<T>>>,
{
    let updated = match attempt().await {
        Err(StoreError::Conflict(reason)) => {
            debug!("Lost upsert race for {} ({}), re-applying", key, reason);
            attempt().await?
        }
        other => other?,
    };

    updated.ok_or_else(|| {
        StoreError::Conflict(format!("upsert of {} returned no document", key))
    })
}

fn bson_time(at: DateTime<Utc>) -> BsonDateTime {
    BsonDateTime::from_chrono(at)
}

/// Equality filter on the unique key
pub fn key_filter(key: &EntitlementKey) -> Document {
    doc! {
        "identifier": key.identifier.as_str(),
        "identifier_kind": key.identifier_kind.as_str(),
        "feature_type": key.feature_type.as_str(),
    }
}

/// Fields of a brand-new period, as a `$set` body
fn period_fields(budget: FeatureBudget, now: DateTime<Utc>) -> Document {
    doc! {
        "used_count": 0_i64,
        "max_usage": i64::from(budget.max_usage),
        "period_start": bson_time(now),
        "period_length_days": i64::from(budget.period_length_days),
        "next_reset_date": bson_time(rollover::period_end(now, budget.period_length_days)),
    }
}

/// Create-if-absent update; key fields come from the equality filter
pub fn initialize_update(fresh: FreshRecord) -> Document {
    let mut on_insert = period_fields(fresh.budget, fresh.now);
    on_insert.insert("status", RecordStatus::Active.as_str());
    on_insert.insert("attributes", Document::new());
    on_insert.insert("metadata.created_at", bson_time(fresh.now));
    on_insert.insert("metadata.updated_at", bson_time(fresh.now));
    doc! { "$setOnInsert": on_insert }
}

/// Matches only while a unit of both the caller's and the stored budget
/// remains and the record is active
pub fn consume_filter(key: &EntitlementKey, max_usage: u32) -> Document {
    let mut filter = key_filter(key);
    filter.insert("used_count", doc! { "$lt": i64::from(max_usage) });
    filter.insert("status", RecordStatus::Active.as_str());
    // The stored budget may be smaller than the caller's if a rollover
    // landed after its read
    filter.insert("$expr", doc! { "$lt": ["$used_count", "$max_usage"] });
    filter
}

pub fn consume_update(now: DateTime<Utc>) -> Document {
    doc! {
        "$inc": { "used_count": 1_i64 },
        "$set": {
            "last_used": bson_time(now),
            "metadata.updated_at": bson_time(now),
        },
    }
}

/// Matches only if no other caller has rolled the period over yet
pub fn rollover_filter(key: &EntitlementKey, observed_period_start: DateTime<Utc>) -> Document {
    let mut filter = key_filter(key);
    filter.insert("period_start", bson_time(observed_period_start));
    filter
}

pub fn rollover_update(budget: FeatureBudget, now: DateTime<Utc>) -> Document {
    let mut set = period_fields(budget, now);
    set.insert("metadata.updated_at", bson_time(now));
    doc! { "$set": set }
}

pub fn reset_update(budget: FeatureBudget, now: DateTime<Utc>) -> Document {
    let mut set = period_fields(budget, now);
    set.insert("status", RecordStatus::Active.as_str());
    set.insert("metadata.updated_at", bson_time(now));
    doc! {
        "$set": set,
        "$setOnInsert": {
            "attributes": Document::new(),
            "metadata.created_at": bson_time(now),
        },
    }
}

pub fn status_update(status: RecordStatus, fresh: FreshRecord) -> Document {
    let mut on_insert = period_fields(fresh.budget, fresh.now);
    on_insert.insert("attributes", Document::new());
    on_insert.insert("metadata.created_at", bson_time(fresh.now));
    doc! {
        "$set": {
            "status": status.as_str(),
            "metadata.updated_at": bson_time(fresh.now),
        },
        "$setOnInsert": on_insert,
    }
}

/// Zero-usage records whose last activity (last consume, or creation if
/// never consumed) is older than `cutoff`
pub fn sweep_filter(cutoff: DateTime<Utc>) -> Document {
    let cutoff = bson_time(cutoff);
    doc! {
        "used_count": 0_i64,
        "$or": [
            { "last_used": { "$lt": cutoff } },
            { "last_used": Bson::Null, "metadata.created_at": { "$lt": cutoff } },
        ],
    }
}

pub fn stats_pipeline(feature_type: Option<&FeatureType>) -> Vec<Document> {
    let mut pipeline = Vec::new();
    if let Some(feature_type) = feature_type {
        pipeline.push(doc! { "$match": { "feature_type": feature_type.as_str() } });
    }
    pipeline.push(doc! {
        "$group": {
            "_id": {
                "identifier_kind": "$identifier_kind",
                "feature_type": "$feature_type",
            },
            "records": { "$sum": 1 },
            "active": {
                "$sum": { "$cond": [{ "$eq": ["$status", "active"] }, 1, 0] }
            },
            "suspended": {
                "$sum": { "$cond": [{ "$eq": ["$status", "suspended"] }, 1, 0] }
            },
            "exhausted": {
                "$sum": { "$cond": [{ "$gte": ["$used_count", "$max_usage"] }, 1, 0] }
            },
            "total_used": { "$sum": "$used_count" },
            "total_capacity": { "$sum": "$max_usage" },
        }
    });
    pipeline.push(doc! { "$sort": { "_id.identifier_kind": 1, "_id.feature_type": 1 } });
    pipeline
}

fn count(group: &Document, field: &str) -> StoreResult<u64> {
    let value = match group.get(field) {
        Some(Bson::Int32(v)) => i64::from(*v),
        Some(Bson::Int64(v)) => *v,
        Some(Bson::Double(v)) => *v as i64,
        other => {
            return Err(StoreError::Corrupt(format!(
                "stats field {} has unexpected value {:?}",
                field, other
            )))
        }
    };
    u64::try_from(value)
        .map_err(|_| StoreError::Corrupt(format!("stats field {} is negative", field)))
}

/// Decode one `$group` output document
pub fn stats_from_group(group: &Document) -> StoreResult<AggregateStats> {
    let id = group
        .get_document("_id")
        .map_err(|e| StoreError::Corrupt(format!("stats group id: {}", e)))?;
    let identifier_kind: IdentifierKind = id
        .get_str("identifier_kind")
        .map_err(|e| StoreError::Corrupt(format!("stats identifier_kind: {}", e)))?
        .parse()
        .map_err(|e: crate::types::ValidationError| StoreError::Corrupt(e.to_string()))?;
    let feature_type = id
        .get_str("feature_type")
        .map_err(|e| StoreError::Corrupt(format!("stats feature_type: {}", e)))
        .and_then(|f| FeatureType::new(f).map_err(|e| StoreError::Corrupt(e.to_string())))?;

    Ok(AggregateStats {
        identifier_kind,
        feature_type,
        records: count(group, "records")?,
        active: count(group, "active")?,
        suspended: count(group, "suspended")?,
        exhausted: count(group, "exhausted")?,
        total_used: count(group, "total_used")?,
        total_capacity: count(group, "total_capacity")?,
    })
}

/// Decode every `$group` output document; one bad group fails the whole call
pub fn stats_from_groups(groups: &[Document]) -> StoreResult<Vec<AggregateStats>> {
    groups.iter().map(stats_from_group).collect()
}

#[async_trait]
impl EntitlementStore for MongoEntitlementStore {
    async fn find_or_initialize(
        &self,
        key: &EntitlementKey,
        fresh: FreshRecord,
    ) -> StoreResult<EntitlementRecord> {
        self.upsert(key, initialize_update(fresh)).await
    }

    async fn find(&self, key: &EntitlementKey) -> StoreResult<Option<EntitlementRecord>> {
        self.read(key).await
    }

    async fn try_consume(
        &self,
        key: &EntitlementKey,
        max_usage: u32,
        now: DateTime<Utc>,
    ) -> StoreResult<ConsumeOutcome> {
        let updated = self
            .collection
            .find_one_and_update(consume_filter(key, max_usage), consume_update(now), false)
            .await?;

        if let Some(doc) = updated {
            return Ok(ConsumeOutcome::Applied(EntitlementRecord::try_from(doc)?));
        }

        Ok(match self.read(key).await? {
            Some(record) => ConsumeOutcome::Rejected(record),
            None => ConsumeOutcome::Missing,
        })
    }

    async fn apply_rollover(
        &self,
        key: &EntitlementKey,
        observed_period_start: DateTime<Utc>,
        now: DateTime<Utc>,
        budget: FeatureBudget,
    ) -> StoreResult<Option<EntitlementRecord>> {
        let updated = self
            .collection
            .find_one_and_update(
                rollover_filter(key, observed_period_start),
                rollover_update(budget, now),
                false,
            )
            .await?;

        match updated {
            Some(doc) => Ok(Some(EntitlementRecord::try_from(doc)?)),
            None => {
                debug!("Rollover of {} already applied by another caller", key);
                self.read(key).await
            }
        }
    }

    async fn reset(
        &self,
        key: &EntitlementKey,
        now: DateTime<Utc>,
        budget: FeatureBudget,
    ) -> StoreResult<EntitlementRecord> {
        self.upsert(key, reset_update(budget, now)).await
    }

    async fn set_status(
        &self,
        key: &EntitlementKey,
        status: RecordStatus,
        fresh: FreshRecord,
    ) -> StoreResult<EntitlementRecord> {
        self.upsert(key, status_update(status, fresh)).await
    }

    async fn aggregate_stats(
        &self,
        feature_type: Option<&FeatureType>,
    ) -> StoreResult<Vec<AggregateStats>> {
        let groups = self
            .collection
            .aggregate(stats_pipeline(feature_type))
            .await?;

        stats_from_groups(&groups)
    }

    async fn sweep_stale(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        self.collection.delete_many(sweep_filter(cutoff)).await
    }
}
