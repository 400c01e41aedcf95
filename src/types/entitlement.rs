//! Entitlement record and its identity tuple

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::registry::FeatureBudget;
use crate::rollover;
use crate::types::ValidationError;

/// Maximum identifier length in bytes
pub const MAX_IDENTIFIER_LEN: usize = 512;

/// Namespace an identifier belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentifierKind {
    /// Client IP address
    Ip,
    /// Verified JWT subject
    Jwt,
    /// Email address
    Email,
    /// Caller-defined key
    Custom,
}

impl IdentifierKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ip => "ip",
            Self::Jwt => "jwt",
            Self::Email => "email",
            Self::Custom => "custom",
        }
    }
}

impl fmt::Display for IdentifierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IdentifierKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ip" => Ok(Self::Ip),
            "jwt" => Ok(Self::Jwt),
            "email" => Ok(Self::Email),
            "custom" => Ok(Self::Custom),
            other => Err(ValidationError::UnknownIdentifierKind(other.to_string())),
        }
    }
}

/// Name of a rate-limited capability.
///
/// Open-ended: any non-empty name is accepted, and names without a registered
/// budget fall back to the registry defaults.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureType(String);

impl FeatureType {
    pub const SUBMIT_ON_DEMAND_RUN: &'static str = "submit-on-demand-run";
    pub const CREATE_CLIP: &'static str = "create-clip";
    pub const SEARCH_QUOTES: &'static str = "search-quotes";

    /// Validate and wrap a feature type name
    pub fn new(name: &str) -> Result<Self, ValidationError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ValidationError::EmptyFeatureType);
        }
        if name.chars().any(char::is_control) {
            return Err(ValidationError::InvalidCharacters("feature type"));
        }
        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FeatureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for FeatureType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Unique key of an entitlement record: `(identifier, identifier_kind, feature_type)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitlementKey {
    pub identifier: String,
    pub identifier_kind: IdentifierKind,
    pub feature_type: FeatureType,
}

impl EntitlementKey {
    /// Build a key from raw caller input, validating it first
    pub fn new(
        identifier: &str,
        identifier_kind: IdentifierKind,
        feature_type: &str,
    ) -> Result<Self, ValidationError> {
        let identifier = identifier.trim();
        if identifier.is_empty() {
            return Err(ValidationError::EmptyIdentifier);
        }
        if identifier.len() > MAX_IDENTIFIER_LEN {
            return Err(ValidationError::IdentifierTooLong {
                max: MAX_IDENTIFIER_LEN,
                actual: identifier.len(),
            });
        }
        if identifier.chars().any(char::is_control) {
            return Err(ValidationError::InvalidCharacters("identifier"));
        }

        Ok(Self {
            identifier: identifier.to_string(),
            identifier_kind,
            feature_type: FeatureType::new(feature_type)?,
        })
    }
}

impl fmt::Display for EntitlementKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}/{}",
            self.identifier_kind, self.identifier, self.feature_type
        )
    }
}

/// Administrative gate, independent of usage.
///
/// There is no `expired` status: period expiry is computed from
/// `period_start + period_length_days` at read time and never persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    #[default]
    Active,
    Suspended,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Suspended => "suspended",
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "suspended" => Ok(Self::Suspended),
            other => Err(ValidationError::UnknownStatus(other.to_string())),
        }
    }
}

/// Usage budget for one key over one accounting period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitlementRecord {
    pub identifier: String,
    pub identifier_kind: IdentifierKind,
    pub feature_type: FeatureType,
    pub used_count: u32,
    pub max_usage: u32,
    pub period_start: DateTime<Utc>,
    pub period_length_days: u32,
    /// Always `period_start + period_length_days`
    pub next_reset_date: DateTime<Utc>,
    /// Last successful consume
    pub last_used: Option<DateTime<Utc>>,
    pub status: RecordStatus,
    /// Extension point, not interpreted by the engine
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl EntitlementRecord {
    /// A never-used active record starting its first period at `now`
    pub fn fresh(key: &EntitlementKey, budget: FeatureBudget, now: DateTime<Utc>) -> Self {
        Self {
            identifier: key.identifier.clone(),
            identifier_kind: key.identifier_kind,
            feature_type: key.feature_type.clone(),
            used_count: 0,
            max_usage: budget.max_usage,
            period_start: now,
            period_length_days: budget.period_length_days,
            next_reset_date: rollover::period_end(now, budget.period_length_days),
            last_used: None,
            status: RecordStatus::Active,
            metadata: BTreeMap::new(),
            created_at: now,
        }
    }

    pub fn key(&self) -> EntitlementKey {
        EntitlementKey {
            identifier: self.identifier.clone(),
            identifier_kind: self.identifier_kind,
            feature_type: self.feature_type.clone(),
        }
    }

    /// `max(0, max_usage - used_count)`, never stored
    pub fn remaining_usage(&self) -> u32 {
        self.max_usage.saturating_sub(self.used_count)
    }

    /// Start a new period at `now` with a freshly snapshotted budget.
    ///
    /// No catch-up: the new period begins at `now`, not at the old period end.
    pub fn start_period(&mut self, budget: FeatureBudget, now: DateTime<Utc>) {
        self.used_count = 0;
        self.max_usage = budget.max_usage;
        self.period_start = now;
        self.period_length_days = budget.period_length_days;
        self.next_reset_date = rollover::period_end(now, budget.period_length_days);
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        rollover::is_expired(self.period_start, self.period_length_days, now)
    }

    /// Timestamp the sweep retention window is measured against
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_used.unwrap_or(self.created_at)
    }
}
