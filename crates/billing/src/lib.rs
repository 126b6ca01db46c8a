// Billing crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::too_many_arguments)] // Proration and pricing math takes many scalars
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Subflow billing engine
//!
//! Subscription and entitlement management for multi-tenant products.
//!
//! ## Features
//!
//! - **Checkout State Machine**: purchase attempts from creation through
//!   gateway callback to a terminal state, duplicate-webhook safe
//! - **Payment Gateway Adapter**: signed token/refund calls and
//!   constant-time callback verification behind a pluggable trait
//! - **Proration**: mid-cycle plan changes in exact integer cents
//! - **Entitlement Resolution**: override, plan value, and add-on
//!   folding into one effective limit per tenant and feature
//! - **Usage Ledger**: clamped consumption with calendar-aligned resets
//! - **Subscription Lifecycle**: derived status, scheduled downgrades,
//!   reminder sweeps
//! - **Invariant Checks**: runnable consistency queries over the tables

pub mod checkout;
pub mod config;
pub mod entitlement;
pub mod error;
pub mod events;
pub mod fulfillment;
pub mod gateway;
pub mod invariants;
pub mod proration;
pub mod refund;
pub mod subscriptions;
pub mod usage;

#[cfg(test)]
mod edge_case_tests;

// Checkout
pub use checkout::{
    CallbackOutcome, Checkout, CheckoutService, CheckoutTarget, Payment,
};

// Config
pub use config::{BillingConfig, GatewayConfig};

// Entitlement
pub use entitlement::{
    fold_access, fold_addons, AddonGrant, EffectiveLimit, EntitlementService, FeatureRow,
};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{
    BillingEvent, BillingEventBuilder, BillingEventLogger, BillingEventRecord, BillingEventType,
};

// Gateway
pub use gateway::{
    parse_callback, sign_callback, verify_callback, BuyerInfo, CallbackPayload, HttpGateway,
    ParsedCallback, PaymentGateway, TokenRequest, TokenResult,
};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Proration
pub use proration::{classify_change, policy_for_change, PlanChangeKind, Proration};

// Refund
pub use refund::{RefundResult, RefundService};

// Subscriptions
pub use subscriptions::{
    derive_status, AppliedChanges, PlanPolicies, PlanPrice, ReminderRow, Subscription,
    SubscriptionService,
};

// Usage
pub use usage::{snapshot, UsageLedger, UsageSnapshot};

use std::sync::Arc;

use sqlx::PgPool;
use subflow_shared::{Clock, SystemClock};

/// Main billing service combining every billing concern.
pub struct BillingService<G: PaymentGateway + Clone = HttpGateway> {
    pub checkout: CheckoutService<G>,
    pub refund: RefundService<G>,
    pub subscriptions: SubscriptionService,
    pub entitlements: EntitlementService,
    pub usage: UsageLedger,
    pub invariants: InvariantChecker,
    pub events: BillingEventLogger,
}

impl BillingService<HttpGateway> {
    /// Create a billing service from environment variables.
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let gateway = HttpGateway::from_env()?;
        let config = BillingConfig::from_env()?;
        Ok(Self::new(pool, gateway, config))
    }
}

impl<G: PaymentGateway + Clone> BillingService<G> {
    /// Create a billing service with explicit gateway and config.
    pub fn new(pool: PgPool, gateway: G, config: BillingConfig) -> Self {
        Self::with_clock(pool, gateway, config, Arc::new(SystemClock))
    }

    /// As [`new`](Self::new) with an injected clock, for deterministic
    /// proration and expiry behavior in tests.
    pub fn with_clock(
        pool: PgPool,
        gateway: G,
        config: BillingConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            checkout: CheckoutService::new(pool.clone(), clock.clone(), gateway.clone(), config),
            refund: RefundService::new(pool.clone(), gateway),
            subscriptions: SubscriptionService::new(pool.clone(), clock.clone()),
            entitlements: EntitlementService::new(pool.clone(), clock.clone()),
            usage: UsageLedger::new(pool.clone(), clock),
            invariants: InvariantChecker::new(pool.clone()),
            events: BillingEventLogger::new(pool),
        }
    }
}
