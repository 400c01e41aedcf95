//! Error types for Tollgate
//!
//! Quota exhaustion is not an error: it is a denied `ConsumeResult`.
//! Everything here is either bad input (rejected before the store is touched)
//! or an infrastructure failure that must reach the boundary layer unaltered.

/// Failure of the backing store.
///
/// Never converted into a default or zeroed record.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Store operation '{operation}' timed out after {timeout_ms}ms")]
    Timeout {
        operation: &'static str,
        timeout_ms: u64,
    },

    #[error("Store conflict: {0}")]
    Conflict(String),

    #[error("Corrupt entitlement document: {0}")]
    Corrupt(String),
}

/// Malformed caller input.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Identifier must not be empty")]
    EmptyIdentifier,

    #[error("Identifier is {actual} bytes, maximum is {max}")]
    IdentifierTooLong { max: usize, actual: usize },

    #[error("{0} contains control characters")]
    InvalidCharacters(&'static str),

    #[error("Unknown identifier kind '{0}' (expected ip, jwt, email or custom)")]
    UnknownIdentifierKind(String),

    #[error("Unknown entitlement status '{0}' (expected active or suspended)")]
    UnknownStatus(String),

    #[error("Feature type must not be empty")]
    EmptyFeatureType,

    #[error("Retention window must be at least one day")]
    InvalidRetention,
}

/// Main error type for entitlement operations
#[derive(Debug, thiserror::Error)]
pub enum EntitlementError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl EntitlementError {
    /// Whether the boundary layer should report a server fault (5xx)
    /// rather than a client error.
    pub fn is_server_fault(&self) -> bool {
        matches!(self, Self::Store(_) | Self::Config(_))
    }
}

impl From<mongodb::error::Error> for StoreError {
    fn from(err: mongodb::error::Error) -> Self {
        Self::Unavailable(err.to_string())
    }
}

impl From<mongodb::error::Error> for EntitlementError {
    fn from(err: mongodb::error::Error) -> Self {
        Self::Store(err.into())
    }
}

impl From<toml::de::Error> for EntitlementError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("Invalid budget file: {}", err))
    }
}

impl From<std::io::Error> for EntitlementError {
    fn from(err: std::io::Error) -> Self {
        Self::Config(err.to_string())
    }
}

/// Result type alias for entitlement operations
pub type Result<T> = std::result::Result<T, EntitlementError>;
