//! Shared types for Tollgate

mod entitlement;
mod error;
mod results;

pub use entitlement::{
    EntitlementKey, EntitlementRecord, FeatureType, IdentifierKind, RecordStatus,
    MAX_IDENTIFIER_LEN,
};
pub use error::{EntitlementError, Result, StoreError, ValidationError};
pub use results::{AggregateStats, ConsumeResult, EligibilityResult, LIMIT_EXCEEDED, SUSPENDED};
