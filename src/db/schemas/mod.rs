//! Database schemas for Tollgate
//!
//! Defines MongoDB document structures for entitlement records.

mod entitlement;
mod metadata;

pub use entitlement::{EntitlementDoc, ENTITLEMENT_COLLECTION};
pub use metadata::Metadata;
