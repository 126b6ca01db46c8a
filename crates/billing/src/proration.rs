//! Proration arithmetic for mid-cycle plan changes
//!
//! Pure functions over the subscription period and the two prices; all
//! amounts are integer cents with half-up rounding. Callers load the data
//! and pick the policy, this module only does the math.

use serde::Serialize;
use subflow_shared::{money::round_mul_div, ProrationPolicy};
use time::OffsetDateTime;

/// Direction of a plan change. An upgrade is strictly more expensive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanChangeKind {
    Upgrade,
    Downgrade,
}

/// A plan change is an upgrade iff the new price is strictly greater.
pub fn classify_change(current_price_cents: i64, new_price_cents: i64) -> PlanChangeKind {
    if new_price_cents > current_price_cents {
        PlanChangeKind::Upgrade
    } else {
        PlanChangeKind::Downgrade
    }
}

/// Resolve the effective policy for a change: the plan-level setting wins,
/// the global default fills the gap.
pub fn policy_for_change(
    kind: PlanChangeKind,
    plan_upgrade_policy: Option<ProrationPolicy>,
    plan_downgrade_policy: Option<ProrationPolicy>,
    default_upgrade: ProrationPolicy,
    default_downgrade: ProrationPolicy,
) -> ProrationPolicy {
    match kind {
        PlanChangeKind::Upgrade => plan_upgrade_policy.unwrap_or(default_upgrade),
        PlanChangeKind::Downgrade => plan_downgrade_policy.unwrap_or(default_downgrade),
    }
}

/// Result of a proration calculation. `final_amount_cents` is never
/// negative, even when the remaining-period credit exceeds the new price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Proration {
    /// Credit for the unused part of the current period.
    pub credit_cents: i64,
    /// Full price of the new plan.
    pub new_amount_cents: i64,
    /// What the tenant owes now: `max(0, new - credit)` under the
    /// immediate policy, the full new price under end-of-period.
    pub final_amount_cents: i64,
    /// Whole days left in the current period, floored at zero.
    pub days_remaining: i64,
    pub policy: ProrationPolicy,
}

/// Compute credit and final amount for a plan change.
///
/// Immediate policy: daily rate of the current price times the days left,
/// billed as a credit against the new price. End-of-period: no proration,
/// the change waits for the period boundary and the new price applies in
/// full.
pub fn calculate(
    starts_at: OffsetDateTime,
    ends_at: OffsetDateTime,
    current_price_cents: i64,
    new_price_cents: i64,
    policy: ProrationPolicy,
    now: OffsetDateTime,
) -> Proration {
    let days_remaining = (ends_at - now).whole_days().max(0);

    if policy == ProrationPolicy::EndOfPeriod {
        return Proration {
            credit_cents: 0,
            new_amount_cents: new_price_cents,
            final_amount_cents: new_price_cents,
            days_remaining,
            policy,
        };
    }

    let total_days = (ends_at - starts_at).whole_days();
    // A degenerate or inverted period earns no credit.
    let credit_cents = if total_days <= 0 || days_remaining == 0 {
        0
    } else {
        round_mul_div(current_price_cents, days_remaining, total_days)
    };

    Proration {
        credit_cents,
        new_amount_cents: new_price_cents,
        final_amount_cents: (new_price_cents - credit_cents).max(0),
        days_remaining,
        policy,
    }
}
