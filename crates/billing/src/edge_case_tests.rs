// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge case tests for the billing engine
//!
//! Tests critical boundary conditions in:
//! - Proration (BILL-P01 to BILL-P07)
//! - Status derivation (BILL-S01 to BILL-S06)
//! - Entitlement folding (BILL-E01 to BILL-E06)
//! - Usage clamping (BILL-U01 to BILL-U06)
//! - Callback signatures (BILL-G01 to BILL-G05)
//! - Checkout state rules (BILL-C01 to BILL-C04)

#[cfg(test)]
mod proration_tests {
    use crate::proration::*;
    use subflow_shared::ProrationPolicy;
    use time::macros::datetime;
    use time::{Duration, OffsetDateTime};

    const T: OffsetDateTime = datetime!(2026-01-01 00:00 UTC);

    fn days(n: i64) -> OffsetDateTime {
        T + Duration::days(n)
    }

    // =========================================================================
    // BILL-P01: Change on the last day of the period - one day of credit
    // =========================================================================
    #[test]
    fn test_change_on_last_day() {
        let p = calculate(T, days(30), 45_000, 65_000, ProrationPolicy::Immediate, days(29));
        assert_eq!(p.days_remaining, 1);
        assert_eq!(p.credit_cents, 1_500);
        assert_eq!(p.final_amount_cents, 63_500);
    }

    // =========================================================================
    // BILL-P02: Change at the exact period boundary - no credit
    // =========================================================================
    #[test]
    fn test_change_at_period_boundary() {
        let p = calculate(T, days(30), 45_000, 65_000, ProrationPolicy::Immediate, days(30));
        assert_eq!(p.days_remaining, 0);
        assert_eq!(p.credit_cents, 0);
        assert_eq!(p.final_amount_cents, 65_000);
    }

    // =========================================================================
    // BILL-P03: Downgrade to a free price - credit exceeds it, owes zero
    // =========================================================================
    #[test]
    fn test_downgrade_to_free_price() {
        let p = calculate(T, days(30), 45_000, 0, ProrationPolicy::Immediate, days(15));
        assert_eq!(p.credit_cents, 22_500);
        assert_eq!(p.final_amount_cents, 0);
    }

    // =========================================================================
    // BILL-P04: One-day period fully remaining - full credit
    // =========================================================================
    #[test]
    fn test_one_day_period_full_credit() {
        let p = calculate(T, days(1), 45_000, 65_000, ProrationPolicy::Immediate, T);
        assert_eq!(p.credit_cents, 45_000);
        assert_eq!(p.final_amount_cents, 20_000);
    }

    // =========================================================================
    // BILL-P05: End-of-period policy never produces credit at any point
    // =========================================================================
    #[test]
    fn test_end_of_period_never_credits() {
        for day in 0..=30 {
            let p = calculate(T, days(30), 45_000, 30_000, ProrationPolicy::EndOfPeriod, days(day));
            assert_eq!(p.credit_cents, 0, "credit leaked at day {day}");
            assert_eq!(p.final_amount_cents, 30_000);
        }
    }

    // =========================================================================
    // BILL-P06: Sub-cent daily rates round half-up, never truncate
    // =========================================================================
    #[test]
    fn test_sub_cent_daily_rate_rounds() {
        // 0.01 over 30 days, 29 days remain: 0.009666... -> 0.01
        let p = calculate(T, days(30), 1, 65_000, ProrationPolicy::Immediate, days(1));
        assert_eq!(p.credit_cents, 1);
        // 14 days remain: 0.004666... -> 0.00
        let p = calculate(T, days(30), 1, 65_000, ProrationPolicy::Immediate, days(16));
        assert_eq!(p.credit_cents, 0);
    }

    // =========================================================================
    // BILL-P07: Equal prices classify as downgrade, not upgrade
    // =========================================================================
    #[test]
    fn test_equal_price_is_not_upgrade() {
        assert_eq!(classify_change(45_000, 45_000), PlanChangeKind::Downgrade);
        assert_eq!(classify_change(45_000, 45_001), PlanChangeKind::Upgrade);
    }
}

#[cfg(test)]
mod status_derivation_tests {
    use crate::subscriptions::derive_status;
    use subflow_shared::SubscriptionStatus;
    use time::macros::datetime;
    use time::{Duration, OffsetDateTime};

    const NOW: OffsetDateTime = datetime!(2026-06-15 12:00 UTC);

    fn days(n: i64) -> OffsetDateTime {
        NOW + Duration::days(n)
    }

    // =========================================================================
    // BILL-S01: Trial ending exactly now is no longer trialing
    // =========================================================================
    #[test]
    fn test_trial_boundary_exact() {
        assert_eq!(
            derive_status(NOW, Some(NOW), days(10), None, None),
            SubscriptionStatus::Active
        );
        assert_eq!(
            derive_status(NOW, Some(NOW + Duration::seconds(1)), days(10), None, None),
            SubscriptionStatus::Trialing
        );
    }

    // =========================================================================
    // BILL-S02: Grace ending exactly now means expired, not past_due
    // =========================================================================
    #[test]
    fn test_grace_boundary_exact() {
        assert_eq!(
            derive_status(NOW, None, days(-1), None, Some(NOW)),
            SubscriptionStatus::Expired
        );
    }

    // =========================================================================
    // BILL-S03: Canceled subscription still in period is canceled, not expired
    // =========================================================================
    #[test]
    fn test_canceled_in_period() {
        assert_eq!(
            derive_status(NOW, None, days(10), Some(days(-1)), None),
            SubscriptionStatus::Canceled
        );
    }

    // =========================================================================
    // BILL-S04: Canceled subscription past period end is expired
    // =========================================================================
    #[test]
    fn test_canceled_past_period() {
        assert_eq!(
            derive_status(NOW, None, days(-1), Some(days(-10)), None),
            SubscriptionStatus::Expired
        );
    }

    // =========================================================================
    // BILL-S05: Trial on an already-lapsed period still reports trialing
    // =========================================================================
    #[test]
    fn test_trial_wins_over_everything() {
        assert_eq!(
            derive_status(NOW, Some(days(5)), days(-1), Some(days(-2)), Some(days(-1))),
            SubscriptionStatus::Trialing
        );
    }

    // =========================================================================
    // BILL-S06: Determinism - same inputs, same output
    // =========================================================================
    #[test]
    fn test_derivation_is_pure() {
        for _ in 0..3 {
            assert_eq!(
                derive_status(NOW, Some(days(-1)), days(-2), None, Some(days(4))),
                SubscriptionStatus::PastDue
            );
        }
    }
}

#[cfg(test)]
mod entitlement_tests {
    use crate::entitlement::*;
    use subflow_shared::{AddonType, FeatureValue};

    fn grant(addon_type: AddonType, value: i64, quantity: i64) -> AddonGrant {
        AddonGrant {
            addon_type,
            value,
            quantity,
        }
    }

    // =========================================================================
    // BILL-E01: Zero plan limit plus increment add-on is just the add-on
    // =========================================================================
    #[test]
    fn test_zero_base_with_increment() {
        let limit = fold_addons(FeatureValue::Number(0), &[grant(AddonType::Increment, 100, 1)]);
        assert_eq!(limit, EffectiveLimit::Limited(100));
    }

    // =========================================================================
    // BILL-E02: Zero-quantity add-on contributes nothing
    // =========================================================================
    #[test]
    fn test_zero_quantity_addon() {
        let limit = fold_addons(FeatureValue::Number(5), &[grant(AddonType::Increment, 100, 0)]);
        assert_eq!(limit, EffectiveLimit::Limited(5));
    }

    // =========================================================================
    // BILL-E03: Unlimited add-on after many increments still wins
    // =========================================================================
    #[test]
    fn test_unlimited_wins_regardless_of_order() {
        let grants = [
            grant(AddonType::Increment, 10, 3),
            grant(AddonType::Boolean, 1, 1),
            grant(AddonType::Unlimited, 0, 1),
        ];
        assert_eq!(
            fold_addons(FeatureValue::Number(5), &grants),
            EffectiveLimit::Unlimited
        );
    }

    // =========================================================================
    // BILL-E04: Saturating arithmetic near i64::MAX
    // =========================================================================
    #[test]
    fn test_fold_saturates_instead_of_overflowing() {
        let limit = fold_addons(
            FeatureValue::Number(i64::MAX - 1),
            &[grant(AddonType::Increment, i64::MAX, 2)],
        );
        assert_eq!(limit, EffectiveLimit::Limited(i64::MAX));
    }

    // =========================================================================
    // BILL-E05: Access is not granted by increment add-ons alone
    // =========================================================================
    #[test]
    fn test_increment_addons_never_grant_access() {
        assert!(!fold_access(false, &[grant(AddonType::Increment, 1_000, 10)]));
    }

    // =========================================================================
    // BILL-E06: Unavailable is not zero
    // =========================================================================
    #[test]
    fn test_unavailable_is_distinct_from_zero() {
        assert!(!EffectiveLimit::Unavailable.is_available());
        assert!(EffectiveLimit::Limited(0).is_available());
        assert_ne!(EffectiveLimit::Unavailable, EffectiveLimit::Limited(0));
    }
}

#[cfg(test)]
mod usage_tests {
    use crate::entitlement::EffectiveLimit;
    use crate::usage::*;

    // =========================================================================
    // BILL-U01: Increment exactly to the limit
    // =========================================================================
    #[test]
    fn test_increment_lands_on_limit() {
        assert_eq!(clamp_increment(9, 1, EffectiveLimit::Limited(10)), 10);
    }

    // =========================================================================
    // BILL-U02: Large increment on a small remainder clamps
    // =========================================================================
    #[test]
    fn test_huge_increment_clamps() {
        assert_eq!(clamp_increment(9, i64::MAX, EffectiveLimit::Limited(10)), 10);
    }

    // =========================================================================
    // BILL-U03: Increment from zero against a zero limit stays zero
    // =========================================================================
    #[test]
    fn test_zero_limit_accepts_nothing() {
        assert_eq!(clamp_increment(0, 5, EffectiveLimit::Limited(0)), 0);
        let s = snapshot("seats", 0, EffectiveLimit::Limited(0), None);
        assert!(s.limit_reached);
        assert_eq!(s.percentage, 0);
    }

    // =========================================================================
    // BILL-U04: Unlimited saturates instead of wrapping
    // =========================================================================
    #[test]
    fn test_unlimited_saturates() {
        assert_eq!(
            clamp_increment(i64::MAX - 1, 5, EffectiveLimit::Unlimited),
            i64::MAX
        );
    }

    // =========================================================================
    // BILL-U05: Percentage at 99.5% rounds to 100 but only flags at limit
    // =========================================================================
    #[test]
    fn test_percentage_rounding_vs_limit_flag() {
        let s = snapshot("api_calls", 199, EffectiveLimit::Limited(200), None);
        assert_eq!(s.percentage, 100, "199.5/200 rounds half-up");
        assert!(!s.limit_reached, "not actually at the limit");
        assert_eq!(s.remaining, Some(1));
    }

    // =========================================================================
    // BILL-U06: Over-limit row reports zero remaining, capped percentage
    // =========================================================================
    #[test]
    fn test_over_limit_snapshot() {
        let s = snapshot("api_calls", 250, EffectiveLimit::Limited(200), None);
        assert_eq!(s.remaining, Some(0));
        assert_eq!(s.percentage, 100);
        assert!(s.limit_reached);
    }
}

#[cfg(test)]
mod callback_signature_tests {
    use crate::gateway::*;

    const SECRET: &str = "edge-secret";
    const SALT: &str = "edge-salt";

    fn payload(order: &str, status: &str, amount: i64) -> CallbackPayload {
        CallbackPayload {
            merchant_order_id: order.to_string(),
            status: status.to_string(),
            amount_cents: amount,
            signature: sign_callback(SECRET, SALT, order, status, amount),
        }
    }

    // =========================================================================
    // BILL-G01: Field-boundary ambiguity - moving chars between fields fails
    // =========================================================================
    #[test]
    fn test_field_boundary_shift_rejected() {
        // sign("ab" + salt + "success") must not verify ("a" + salt + "bsuccess")
        let original = payload("sf-ab", "success", 100);
        let mut shifted = original.clone();
        shifted.merchant_order_id = "sf-a".to_string();
        shifted.status = "bsuccess".to_string();
        assert!(!verify_callback(SECRET, SALT, &shifted));
    }

    // =========================================================================
    // BILL-G02: Negative amount signs and verifies consistently
    // =========================================================================
    #[test]
    fn test_negative_amount_consistent() {
        let p = payload("sf-1", "success", -100);
        assert!(verify_callback(SECRET, SALT, &p));
    }

    // =========================================================================
    // BILL-G03: Empty signature rejected
    // =========================================================================
    #[test]
    fn test_empty_signature_rejected() {
        let mut p = payload("sf-1", "success", 100);
        p.signature = String::new();
        assert!(!verify_callback(SECRET, SALT, &p));
    }

    // =========================================================================
    // BILL-G04: Signature from a different salt rejected
    // =========================================================================
    #[test]
    fn test_cross_salt_rejected() {
        let mut p = payload("sf-1", "success", 100);
        p.signature = sign_callback(SECRET, "other-salt", "sf-1", "success", 100);
        assert!(!verify_callback(SECRET, SALT, &p));
    }

    // =========================================================================
    // BILL-G05: Unknown gateway status parses as failure, never success
    // =========================================================================
    #[test]
    fn test_unknown_status_is_failure() {
        for status in ["pending", "refunded", "SUCCESS", ""] {
            assert!(
                !parse_callback(&payload("sf-1", status, 100)).success,
                "status '{status}' must not count as success"
            );
        }
    }
}

#[cfg(test)]
mod checkout_state_tests {
    use subflow_shared::{CheckoutStatus, CheckoutType};

    // =========================================================================
    // BILL-C01: Every terminal state refuses token generation
    // =========================================================================
    #[test]
    fn test_terminal_states_refuse_tokens() {
        for status in [
            CheckoutStatus::Completed,
            CheckoutStatus::Failed,
            CheckoutStatus::Expired,
            CheckoutStatus::Cancelled,
        ] {
            assert!(status.is_terminal());
            assert!(!status.can_generate_token());
            assert!(!status.is_cancellable());
        }
    }

    // =========================================================================
    // BILL-C02: In-flight states are cancellable and token-capable
    // =========================================================================
    #[test]
    fn test_in_flight_states() {
        for status in [CheckoutStatus::Pending, CheckoutStatus::Processing] {
            assert!(!status.is_terminal());
            assert!(status.can_generate_token());
            assert!(status.is_cancellable());
        }
    }

    // =========================================================================
    // BILL-C03: Add-on classification covers both add-on types only
    // =========================================================================
    #[test]
    fn test_addon_classification() {
        assert!(CheckoutType::Addon.is_addon());
        assert!(CheckoutType::AddonRenew.is_addon());
        for t in [
            CheckoutType::New,
            CheckoutType::Renew,
            CheckoutType::Upgrade,
            CheckoutType::Downgrade,
        ] {
            assert!(!t.is_addon());
        }
    }

    // =========================================================================
    // BILL-C04: Stored state strings round-trip through the enums
    // =========================================================================
    #[test]
    fn test_state_strings_round_trip() {
        for status in [
            CheckoutStatus::Pending,
            CheckoutStatus::Processing,
            CheckoutStatus::Completed,
            CheckoutStatus::Failed,
            CheckoutStatus::Expired,
            CheckoutStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<CheckoutStatus>().unwrap(), status);
        }
    }
}
