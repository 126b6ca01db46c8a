// Shared crate clippy configuration
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Subflow Shared Types
//!
//! Tenant-agnostic domain types used by every crate in the workspace:
//! feature/checkout/subscription enums, the string-encoded feature value
//! format, money arithmetic over integer cents, and the injectable clock.

pub mod clock;
pub mod db;
pub mod money;
pub mod types;

pub use clock::{Clock, SystemClock};
pub use db::{create_migration_pool, create_pool, run_migrations};
pub use money::{apply_tax, percentage_of_limit, round_mul_div};
pub use types::{
    AddonType, BillingInterval, CheckoutStatus, CheckoutType, FeatureType, FeatureValue,
    PaymentStatus, ProrationPolicy, ResetPeriod, SubscriptionStatus,
};
