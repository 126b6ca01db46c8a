//! Billing error taxonomy
//!
//! Four classes of failure, each with distinct handling:
//! - validation: rejected before any state mutation
//! - gateway: surfaced to the caller with no state change, safe to retry
//! - invariant violation: aborts the enclosing transaction
//! - conflicts (terminal-state transitions, double processing) are NOT
//!   errors; they resolve to the existing result at the call site

use uuid::Uuid;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    /// Invalid request, rejected before any state mutation.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Outbound gateway call failed (network, timeout, malformed reply).
    /// No local state was changed; retrying is safe.
    #[error("gateway error: {0}")]
    Gateway(String),

    /// Inbound callback signature did not verify. The payload is dropped
    /// without touching any row.
    #[error("callback signature verification failed")]
    SignatureInvalid,

    /// Referenced entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A subscription was required but the tenant has none. Fatal for the
    /// enclosing transaction.
    #[error("tenant {0} has no current subscription")]
    MissingSubscription(Uuid),

    /// Stored data breaks a model invariant (unparseable enum, target
    /// columns inconsistent with checkout type). Fatal.
    #[error("invariant violation: {0}")]
    Invariant(String),

    /// Required configuration missing or malformed.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl From<subflow_shared::types::ParseEnumError> for BillingError {
    fn from(e: subflow_shared::types::ParseEnumError) -> Self {
        BillingError::Invariant(e.to_string())
    }
}

impl BillingError {
    /// Whether the caller may retry the operation without side effects.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BillingError::Gateway(_) | BillingError::Database(_))
    }
}
