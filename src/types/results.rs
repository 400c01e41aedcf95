//! Values handed back to callers of the engine
//!
//! These are what the boundary layer maps to responses and what an
//! analytics sink would be given.

use chrono::{DateTime, Utc};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};

use crate::rollover;
use crate::types::{EntitlementRecord, FeatureType, IdentifierKind, RecordStatus};

/// Error text of a consume denied for an exhausted budget
pub const LIMIT_EXCEEDED: &str = "limit exceeded for this period";

/// Error text of a consume denied for a suspended record
pub const SUSPENDED: &str = "entitlement suspended";

/// Read-only view of whether a consume would currently succeed
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EligibilityResult {
    pub eligible: bool,
    pub remaining_usage: u32,
    pub max_usage: u32,
    pub used_count: u32,
    pub period_start: DateTime<Utc>,
    pub next_reset_date: DateTime<Utc>,
    pub days_until_reset: u32,
    pub status: RecordStatus,
}

impl EligibilityResult {
    pub fn from_record(record: &EntitlementRecord, now: DateTime<Utc>) -> Self {
        let remaining_usage = record.remaining_usage();
        Self {
            eligible: record.status == RecordStatus::Active && remaining_usage > 0,
            remaining_usage,
            max_usage: record.max_usage,
            used_count: record.used_count,
            period_start: record.period_start,
            next_reset_date: record.next_reset_date,
            days_until_reset: rollover::days_until(record.next_reset_date, now),
            status: record.status,
        }
    }
}

/// Outcome of a consume attempt.
///
/// A denial is an expected value, not an error. Serializes with a boolean
/// `success` discriminator.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsumeResult {
    Granted {
        used_count: u32,
        remaining_usage: u32,
        max_usage: u32,
    },
    Denied {
        error: String,
        remaining_usage: u32,
        next_reset_date: DateTime<Utc>,
    },
}

impl ConsumeResult {
    pub fn granted(record: &EntitlementRecord) -> Self {
        Self::Granted {
            used_count: record.used_count,
            remaining_usage: record.remaining_usage(),
            max_usage: record.max_usage,
        }
    }

    /// Denial explained by the state of the record the store refused to update
    pub fn denied(record: &EntitlementRecord) -> Self {
        let (error, remaining_usage) = match record.status {
            RecordStatus::Suspended => (SUSPENDED, record.remaining_usage()),
            RecordStatus::Active => (LIMIT_EXCEEDED, 0),
        };
        Self::Denied {
            error: error.to_string(),
            remaining_usage,
            next_reset_date: record.next_reset_date,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Granted { .. })
    }

    pub fn remaining_usage(&self) -> u32 {
        match self {
            Self::Granted {
                remaining_usage, ..
            }
            | Self::Denied {
                remaining_usage, ..
            } => *remaining_usage,
        }
    }
}

impl Serialize for ConsumeResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Granted {
                used_count,
                remaining_usage,
                max_usage,
            } => {
                let mut s = serializer.serialize_struct("ConsumeResult", 4)?;
                s.serialize_field("success", &true)?;
                s.serialize_field("usedCount", used_count)?;
                s.serialize_field("remainingUsage", remaining_usage)?;
                s.serialize_field("maxUsage", max_usage)?;
                s.end()
            }
            Self::Denied {
                error,
                remaining_usage,
                next_reset_date,
            } => {
                let mut s = serializer.serialize_struct("ConsumeResult", 4)?;
                s.serialize_field("success", &false)?;
                s.serialize_field("error", error)?;
                s.serialize_field("remainingUsage", remaining_usage)?;
                s.serialize_field("nextResetDate", next_reset_date)?;
                s.end()
            }
        }
    }
}

/// Usage aggregated over all records sharing `(identifier_kind, feature_type)`.
///
/// Counts reflect stored state; periods that have lapsed but not yet been
/// rolled over still report their old usage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateStats {
    pub identifier_kind: IdentifierKind,
    pub feature_type: FeatureType,
    pub records: u64,
    pub active: u64,
    pub suspended: u64,
    /// Records with no remaining usage
    pub exhausted: u64,
    pub total_used: u64,
    pub total_capacity: u64,
}

impl AggregateStats {
    pub fn empty(identifier_kind: IdentifierKind, feature_type: FeatureType) -> Self {
        Self {
            identifier_kind,
            feature_type,
            records: 0,
            active: 0,
            suspended: 0,
            exhausted: 0,
            total_used: 0,
            total_capacity: 0,
        }
    }

    /// Fold one record into the group
    pub fn add(&mut self, record: &EntitlementRecord) {
        self.records += 1;
        match record.status {
            RecordStatus::Active => self.active += 1,
            RecordStatus::Suspended => self.suspended += 1,
        }
        if record.remaining_usage() == 0 {
            self.exhausted += 1;
        }
        self.total_used += u64::from(record.used_count);
        self.total_capacity += u64::from(record.max_usage);
    }
}
