//! Entitlement document schema
//!
//! One document per `(identifier, identifier_kind, feature_type)`,
//! enforced by a unique compound index.

use bson::{doc, oid::ObjectId, DateTime, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::db::mongo::IntoIndexes;
use crate::db::schemas::Metadata;
use crate::types::{EntitlementRecord, FeatureType, IdentifierKind, RecordStatus, StoreError};

/// Collection name for entitlements
pub const ENTITLEMENT_COLLECTION: &str = "entitlements";

/// Entitlement document stored in MongoDB
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct EntitlementDoc {
    /// MongoDB document ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    /// Common metadata (created_at, updated_at)
    #[serde(default)]
    pub metadata: Metadata,

    /// Holder of the entitlement (IP, user id, email, custom key)
    pub identifier: String,

    /// Namespace of `identifier`
    pub identifier_kind: IdentifierKind,

    /// Rate-limited capability this document governs
    pub feature_type: String,

    /// Units consumed in the current period
    pub used_count: i64,

    /// Budget snapshotted at creation or rollover
    pub max_usage: i64,

    /// Start of the current period
    pub period_start: DateTime,

    /// Period length snapshotted at creation or rollover
    pub period_length_days: i64,

    /// `period_start + period_length_days`, informational
    pub next_reset_date: DateTime,

    /// Last successful consume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used: Option<DateTime>,

    /// Administrative gate
    #[serde(default)]
    pub status: RecordStatus,

    /// Caller-defined attributes, not interpreted
    #[serde(default)]
    pub attributes: Document,
}

impl IntoIndexes for EntitlementDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![
            // One record per key; makes the initializing upsert race-free
            (
                doc! { "identifier": 1, "identifier_kind": 1, "feature_type": 1 },
                Some(
                    IndexOptions::builder()
                        .unique(true)
                        .name("entitlement_key_unique".to_string())
                        .build(),
                ),
            ),
            // Stats grouping
            (
                doc! { "feature_type": 1, "identifier_kind": 1 },
                Some(
                    IndexOptions::builder()
                        .name("feature_kind_index".to_string())
                        .build(),
                ),
            ),
            // Stale record sweeps
            (
                doc! { "used_count": 1, "last_used": 1 },
                Some(
                    IndexOptions::builder()
                        .name("sweep_index".to_string())
                        .build(),
                ),
            ),
        ]
    }
}

fn to_u32(field: &str, value: i64) -> Result<u32, StoreError> {
    u32::try_from(value)
        .map_err(|_| StoreError::Corrupt(format!("{} out of range: {}", field, value)))
}

impl TryFrom<EntitlementDoc> for EntitlementRecord {
    type Error = StoreError;

    fn try_from(doc: EntitlementDoc) -> Result<Self, Self::Error> {
        let feature_type = FeatureType::new(&doc.feature_type)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let period_start = doc.period_start.to_chrono();

        let metadata: BTreeMap<String, serde_json::Value> = doc
            .attributes
            .into_iter()
            .map(|(k, v)| (k, v.into_relaxed_extjson()))
            .collect();

        Ok(Self {
            identifier: doc.identifier,
            identifier_kind: doc.identifier_kind,
            feature_type,
            used_count: to_u32("used_count", doc.used_count)?,
            max_usage: to_u32("max_usage", doc.max_usage)?,
            period_start,
            period_length_days: to_u32("period_length_days", doc.period_length_days)?,
            next_reset_date: doc.next_reset_date.to_chrono(),
            last_used: doc.last_used.map(|d| d.to_chrono()),
            status: doc.status,
            metadata,
            created_at: doc
                .metadata
                .created_at
                .map(|d| d.to_chrono())
                .unwrap_or(period_start),
        })
    }
}
