//! Database layer for Tollgate
//!
//! Provides MongoDB storage for entitlement records.

pub mod mongo;
pub mod schemas;

pub use mongo::{IntoIndexes, MongoClient, MongoCollection};
pub use schemas::{EntitlementDoc, Metadata, ENTITLEMENT_COLLECTION};
