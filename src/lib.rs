//! Tollgate - entitlement metering engine
//!
//! Decides whether a unit of a rate-limited feature may be consumed by an
//! `(identifier, identifier_kind, feature_type)` holder, and atomically
//! records the consumption against a budget that resets every period.
//!
//! ## Components
//!
//! - **Registry**: per-feature budgets (`max_usage`, `period_length_days`)
//! - **Rollover**: pure period-expiry policy
//! - **Store**: atomic find-or-initialize, conditional consume and guarded
//!   rollover, backed by MongoDB or memory
//! - **Engine**: eligibility checks, consumption and admin operations
//!
//! Authentication, HTTP mapping and analytics are left to callers: the
//! engine returns typed results and typed errors for them to translate.

pub mod clock;
pub mod config;
pub mod db;
pub mod engine;
pub mod registry;
pub mod rollover;
pub mod store;
pub mod types;

pub use config::Args;
pub use engine::EntitlementEngine;
pub use registry::{BudgetTable, ConfigRegistry, FeatureBudget};
pub use store::{EntitlementStore, MemoryEntitlementStore, MongoEntitlementStore};
pub use types::{EntitlementError, Result};
