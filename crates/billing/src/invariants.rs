//! Billing invariants
//!
//! Runnable consistency checks over the billing tables. Each invariant
//! is a real SQL query; checks only read, never write, and violations
//! carry enough context to debug from the report alone.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Result of running a single invariant check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated.
    pub invariant: String,
    /// Tenant(s) affected.
    pub tenant_ids: Vec<Uuid>,
    pub description: String,
    /// Additional context for debugging.
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// System may be charging or granting access incorrectly.
    Critical,
    /// Data inconsistency that needs attention.
    High,
    /// Potential issue, should investigate.
    Medium,
    /// Minor inconsistency, informational.
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct MultipleSubsRow {
    tenant_id: Uuid,
    sub_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct CompletedNoPaymentRow {
    checkout_id: Uuid,
    tenant_id: Uuid,
    final_amount_cents: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct MultiplePaymentsRow {
    checkout_id: Uuid,
    tenant_id: Uuid,
    payment_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct NegativeUsageRow {
    tenant_id: Uuid,
    feature_slug: String,
    used: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct StaleAddonRow {
    tenant_id: Uuid,
    addon_id: Uuid,
    expires_at: Option<OffsetDateTime>,
}

#[derive(Debug, sqlx::FromRow)]
struct TerminalTimestampRow {
    checkout_id: Uuid,
    tenant_id: Uuid,
    status: String,
}

/// Service for running billing invariant checks.
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return the summary.
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_single_current_subscription().await?);
        violations.extend(self.check_completed_checkout_has_payment().await?);
        violations.extend(self.check_one_payment_per_checkout().await?);
        violations.extend(self.check_usage_non_negative().await?);
        violations.extend(self.check_active_addons_not_expired().await?);
        violations.extend(self.check_terminal_checkout_timestamps().await?);

        let checks_run = 6;
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();
        let checks_passed = checks_run - checks_failed;

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Invariant 1: at most one access-granting subscription per tenant.
    ///
    /// Multiple current subscriptions would double-bill and make
    /// entitlement resolution ambiguous.
    async fn check_single_current_subscription(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MultipleSubsRow> = sqlx::query_as(
            r#"
            SELECT tenant_id, COUNT(*) as sub_count
            FROM subscriptions
            WHERE status IN ('active', 'trialing', 'past_due')
            GROUP BY tenant_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_current_subscription".to_string(),
                tenant_ids: vec![row.tenant_id],
                description: format!(
                    "Tenant has {} access-granting subscriptions (expected 1)",
                    row.sub_count
                ),
                context: serde_json::json!({
                    "subscription_count": row.sub_count,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: a completed checkout with a non-zero amount has a
    /// payment. Zero-amount checkouts complete without one.
    async fn check_completed_checkout_has_payment(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<CompletedNoPaymentRow> = sqlx::query_as(
            r#"
            SELECT c.id as checkout_id, c.tenant_id, c.final_amount_cents
            FROM checkouts c
            WHERE c.status = 'completed'
              AND c.final_amount_cents > 0
              AND NOT EXISTS (
                  SELECT 1 FROM payments p WHERE p.checkout_id = c.id
              )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "completed_checkout_has_payment".to_string(),
                tenant_ids: vec![row.tenant_id],
                description: "Completed checkout with a non-zero amount has no payment".to_string(),
                context: serde_json::json!({
                    "checkout_id": row.checkout_id,
                    "final_amount_cents": row.final_amount_cents,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 3: exactly one payment per checkout. More than one means
    /// a duplicate webhook slipped past the row lock.
    async fn check_one_payment_per_checkout(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MultiplePaymentsRow> = sqlx::query_as(
            r#"
            SELECT checkout_id, tenant_id, COUNT(*) as payment_count
            FROM payments
            GROUP BY checkout_id, tenant_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "one_payment_per_checkout".to_string(),
                tenant_ids: vec![row.tenant_id],
                description: format!(
                    "Checkout has {} payments (expected at most 1)",
                    row.payment_count
                ),
                context: serde_json::json!({
                    "checkout_id": row.checkout_id,
                    "payment_count": row.payment_count,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 4: usage counters never go negative.
    async fn check_usage_non_negative(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<NegativeUsageRow> = sqlx::query_as(
            r#"
            SELECT tu.tenant_id, f.slug as feature_slug, tu.used
            FROM tenant_usage tu
            JOIN features f ON f.id = tu.feature_id
            WHERE tu.used < 0
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "usage_non_negative".to_string(),
                tenant_ids: vec![row.tenant_id],
                description: format!(
                    "Usage for feature '{}' is negative ({})",
                    row.feature_slug, row.used
                ),
                context: serde_json::json!({
                    "feature": row.feature_slug,
                    "used": row.used,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 5: an add-on marked active has not expired. Stale rows
    /// grant entitlement the tenant no longer pays for.
    async fn check_active_addons_not_expired(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<StaleAddonRow> = sqlx::query_as(
            r#"
            SELECT tenant_id, addon_id, expires_at
            FROM tenant_addons
            WHERE is_active = TRUE
              AND expires_at IS NOT NULL
              AND expires_at <= NOW() - INTERVAL '1 day'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "active_addons_not_expired".to_string(),
                tenant_ids: vec![row.tenant_id],
                description: "Add-on is active but expired over a day ago".to_string(),
                context: serde_json::json!({
                    "addon_id": row.addon_id,
                    "expires_at": row.expires_at,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Invariant 6: terminal checkout timestamps are consistent —
    /// completed rows carry `completed_at`, failed rows carry a reason.
    async fn check_terminal_checkout_timestamps(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<TerminalTimestampRow> = sqlx::query_as(
            r#"
            SELECT id as checkout_id, tenant_id, status
            FROM checkouts
            WHERE (status = 'completed' AND completed_at IS NULL)
               OR (status IN ('failed', 'expired') AND failure_reason IS NULL)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "terminal_checkout_timestamps".to_string(),
                tenant_ids: vec![row.tenant_id],
                description: format!(
                    "Checkout in terminal state '{}' is missing its terminal metadata",
                    row.status
                ),
                context: serde_json::json!({
                    "checkout_id": row.checkout_id,
                    "status": row.status,
                }),
                severity: ViolationSeverity::Low,
            })
            .collect())
    }

    /// Run a single invariant check by name.
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "single_current_subscription" => self.check_single_current_subscription().await,
            "completed_checkout_has_payment" => self.check_completed_checkout_has_payment().await,
            "one_payment_per_checkout" => self.check_one_payment_per_checkout().await,
            "usage_non_negative" => self.check_usage_non_negative().await,
            "active_addons_not_expired" => self.check_active_addons_not_expired().await,
            "terminal_checkout_timestamps" => self.check_terminal_checkout_timestamps().await,
            _ => Ok(vec![]),
        }
    }

    /// List of all available invariant checks.
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "single_current_subscription",
            "completed_checkout_has_payment",
            "one_payment_per_checkout",
            "usage_non_negative",
            "active_addons_not_expired",
            "terminal_checkout_timestamps",
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::High.to_string(), "HIGH");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
        assert_eq!(ViolationSeverity::Low.to_string(), "LOW");
    }

    #[test]
    fn test_available_checks() {
        let checks = InvariantChecker::available_checks();
        assert_eq!(checks.len(), 6);
        assert!(checks.contains(&"single_current_subscription"));
        assert!(checks.contains(&"one_payment_per_checkout"));
    }
}
