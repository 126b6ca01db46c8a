//! Injectable time source
//!
//! Proration, checkout expiry, and status derivation are all functions of
//! "now". Services take a [`Clock`] so tests can pin the current instant;
//! pure helpers take an explicit `now` parameter instead.

use std::sync::Arc;

use time::OffsetDateTime;

/// Source of the current instant. Always UTC.
pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

/// Production clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

impl Clock for Arc<dyn Clock> {
    fn now(&self) -> OffsetDateTime {
        self.as_ref().now()
    }
}

/// Fixed clock for tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub OffsetDateTime);

impl Clock for FixedClock {
    fn now(&self) -> OffsetDateTime {
        self.0
    }
}
