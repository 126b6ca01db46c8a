//! Subscription lifecycle management
//!
//! Status is derived, never trusted from storage: `derive_status` is the
//! single authority and the `status` column is only a cache written back
//! opportunistically and reconciled by a scheduled job. This module also
//! applies scheduled downgrades at period end and runs the read-only
//! reminder sweeps.

use std::sync::Arc;

use sqlx::PgPool;
use subflow_shared::{BillingInterval, Clock, ProrationPolicy, SubscriptionStatus};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::events::{BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::proration::{classify_change, PlanChangeKind};

/// A tenant's subscription row. The `status` field is the cache column;
/// business logic must go through [`Subscription::derived_status`].
#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct Subscription {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub plan_price_id: Uuid,
    pub next_plan_price_id: Option<Uuid>,
    /// Negotiated per-tenant price overriding the plan price amount.
    pub custom_price_cents: Option<i64>,
    pub starts_at: OffsetDateTime,
    pub ends_at: OffsetDateTime,
    pub trial_ends_at: Option<OffsetDateTime>,
    pub canceled_at: Option<OffsetDateTime>,
    pub grace_period_ends_at: Option<OffsetDateTime>,
    pub status: String,
    pub created_at: OffsetDateTime,
}

impl Subscription {
    pub fn derived_status(&self, now: OffsetDateTime) -> SubscriptionStatus {
        derive_status(
            now,
            self.trial_ends_at,
            self.ends_at,
            self.canceled_at,
            self.grace_period_ends_at,
        )
    }

    /// Effective recurring price: the tenant override wins over the plan
    /// price amount.
    pub fn effective_price_cents(&self, plan_price_amount_cents: i64) -> i64 {
        self.custom_price_cents.unwrap_or(plan_price_amount_cents)
    }
}

/// Derive the subscription status from its timestamps. Pure; same inputs
/// always yield the same status.
///
/// Precedence: trialing, then past_due, then expired, then canceled,
/// then active.
pub fn derive_status(
    now: OffsetDateTime,
    trial_ends_at: Option<OffsetDateTime>,
    ends_at: OffsetDateTime,
    canceled_at: Option<OffsetDateTime>,
    grace_period_ends_at: Option<OffsetDateTime>,
) -> SubscriptionStatus {
    if trial_ends_at.is_some_and(|t| t > now) {
        return SubscriptionStatus::Trialing;
    }
    if ends_at <= now {
        return match grace_period_ends_at {
            Some(grace) if grace > now => SubscriptionStatus::PastDue,
            _ => SubscriptionStatus::Expired,
        };
    }
    if canceled_at.is_some() {
        return SubscriptionStatus::Canceled;
    }
    SubscriptionStatus::Active
}

/// Immutable catalog price row. Subscriptions pin a price id; amount
/// changes always create a new row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PlanPrice {
    pub id: Uuid,
    pub plan_id: Uuid,
    pub amount_cents: i64,
    pub currency: String,
    pub billing_interval: String,
    pub interval_count: i32,
    pub trial_days: i32,
}

impl PlanPrice {
    pub fn interval(&self) -> BillingResult<BillingInterval> {
        Ok(self.billing_interval.parse()?)
    }

    /// End of a period starting at `from`.
    pub fn period_end(&self, from: OffsetDateTime) -> BillingResult<OffsetDateTime> {
        Ok(self.interval()?.advance(from, self.interval_count.max(1)))
    }
}

/// Plan-level proration policy overrides, both optional.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlanPolicies {
    pub upgrade: Option<ProrationPolicy>,
    pub downgrade: Option<ProrationPolicy>,
}

/// Summary of one scheduled-change sweep.
#[derive(Debug, Clone, Copy, Default)]
pub struct AppliedChanges {
    pub applied: usize,
    pub upgrades: usize,
    pub downgrades: usize,
}

/// A subscription matched by a reminder sweep. Sweeps never mutate.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ReminderRow {
    pub subscription_id: Uuid,
    pub tenant_id: Uuid,
    pub at: OffsetDateTime,
}

#[derive(Debug, sqlx::FromRow)]
struct DueChangeRow {
    id: Uuid,
    tenant_id: Uuid,
    ends_at: OffsetDateTime,
    custom_price_cents: Option<i64>,
    old_amount_cents: i64,
    next_plan_price_id: Uuid,
    new_amount_cents: i64,
    new_interval: String,
    new_interval_count: i32,
}

/// Service owning subscription reads, scheduled changes, and sweeps.
pub struct SubscriptionService {
    pool: PgPool,
    clock: Arc<dyn Clock>,
    event_logger: BillingEventLogger,
}

impl SubscriptionService {
    pub fn new(pool: PgPool, clock: Arc<dyn Clock>) -> Self {
        let event_logger = BillingEventLogger::new(pool.clone());
        Self {
            pool,
            clock,
            event_logger,
        }
    }

    /// The tenant's current subscription: latest by creation. At most one
    /// subscription is current per tenant by construction.
    pub async fn current_for_tenant(&self, tenant_id: Uuid) -> BillingResult<Option<Subscription>> {
        let row = sqlx::query_as(
            r#"
            SELECT id, tenant_id, plan_price_id, next_plan_price_id, custom_price_cents,
                   starts_at, ends_at, trial_ends_at, canceled_at, grace_period_ends_at,
                   status, created_at
            FROM subscriptions
            WHERE tenant_id = $1
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Current subscription or a fatal invariant error.
    pub async fn require_current(&self, tenant_id: Uuid) -> BillingResult<Subscription> {
        self.current_for_tenant(tenant_id)
            .await?
            .ok_or(BillingError::MissingSubscription(tenant_id))
    }

    pub async fn load_plan_price(&self, plan_price_id: Uuid) -> BillingResult<PlanPrice> {
        sqlx::query_as(
            r#"
            SELECT id, plan_id, amount_cents, currency, billing_interval, interval_count, trial_days
            FROM plan_prices
            WHERE id = $1
            "#,
        )
        .bind(plan_price_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| BillingError::NotFound(format!("plan price {plan_price_id}")))
    }

    /// Proration policy overrides configured on the plan owning a price.
    pub async fn plan_policies(&self, plan_price_id: Uuid) -> BillingResult<PlanPolicies> {
        let row: Option<(Option<String>, Option<String>)> = sqlx::query_as(
            r#"
            SELECT p.upgrade_proration_policy, p.downgrade_proration_policy
            FROM plans p
            JOIN plan_prices pp ON pp.plan_id = p.id
            WHERE pp.id = $1
            "#,
        )
        .bind(plan_price_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some((upgrade, downgrade)) = row else {
            return Ok(PlanPolicies::default());
        };
        Ok(PlanPolicies {
            upgrade: upgrade.as_deref().map(str::parse).transpose()?,
            downgrade: downgrade.as_deref().map(str::parse).transpose()?,
        })
    }

    /// Derive the status for a subscription and write the cache column
    /// back when it drifted.
    pub async fn refresh_status_cache(
        &self,
        sub: &Subscription,
    ) -> BillingResult<SubscriptionStatus> {
        let status = sub.derived_status(self.clock.now());
        if sub.status != status.as_str() {
            sqlx::query("UPDATE subscriptions SET status = $1, updated_at = NOW() WHERE id = $2")
                .bind(status.as_str())
                .bind(sub.id)
                .execute(&self.pool)
                .await?;
        }
        Ok(status)
    }

    /// Record a scheduled downgrade to be applied at period end.
    pub async fn schedule_change(
        &self,
        tenant_id: Uuid,
        new_plan_price_id: Uuid,
    ) -> BillingResult<Subscription> {
        let sub = self.require_current(tenant_id).await?;

        if sub.next_plan_price_id == Some(new_plan_price_id) {
            return Ok(sub);
        }
        if let Some(existing) = sub.next_plan_price_id {
            tracing::warn!(
                tenant_id = %tenant_id,
                existing_plan_price_id = %existing,
                new_plan_price_id = %new_plan_price_id,
                "Replacing an existing scheduled plan change"
            );
        }

        sqlx::query(
            "UPDATE subscriptions SET next_plan_price_id = $1, updated_at = NOW() WHERE id = $2",
        )
        .bind(new_plan_price_id)
        .bind(sub.id)
        .execute(&self.pool)
        .await?;

        self.event_logger
            .emit(
                BillingEventBuilder::new(
                    tenant_id,
                    BillingEventType::SubscriptionDowngradeScheduled,
                )
                .data(serde_json::json!({
                    "subscription_id": sub.id,
                    "new_plan_price_id": new_plan_price_id,
                    "effective_at": sub.ends_at,
                })),
            )
            .await;

        self.require_current(tenant_id).await
    }

    /// Mark the current subscription canceled. Already-canceled is a
    /// no-op returning the existing row.
    pub async fn cancel_current(&self, tenant_id: Uuid) -> BillingResult<Subscription> {
        let sub = self.require_current(tenant_id).await?;
        if sub.canceled_at.is_some() {
            return Ok(sub);
        }
        sqlx::query(
            "UPDATE subscriptions SET canceled_at = $1, status = $2, updated_at = NOW() WHERE id = $3",
        )
        .bind(self.clock.now())
        .bind(SubscriptionStatus::Canceled.as_str())
        .bind(sub.id)
        .execute(&self.pool)
        .await?;
        self.require_current(tenant_id).await
    }

    /// Apply every scheduled plan change whose period has ended. Each row
    /// is advanced atomically under a row lock; the new period is anchored
    /// at the old `ends_at`.
    pub async fn apply_scheduled_changes(&self) -> BillingResult<AppliedChanges> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;

        let due: Vec<DueChangeRow> = sqlx::query_as(
            r#"
            SELECT s.id, s.tenant_id, s.ends_at, s.custom_price_cents,
                   op.amount_cents AS old_amount_cents,
                   s.next_plan_price_id,
                   np.amount_cents AS new_amount_cents,
                   np.billing_interval AS new_interval,
                   np.interval_count AS new_interval_count
            FROM subscriptions s
            JOIN plan_prices op ON op.id = s.plan_price_id
            JOIN plan_prices np ON np.id = s.next_plan_price_id
            WHERE s.next_plan_price_id IS NOT NULL
              AND s.ends_at <= $1
            FOR UPDATE OF s SKIP LOCKED
            "#,
        )
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;

        let mut summary = AppliedChanges::default();
        let mut events = Vec::with_capacity(due.len());

        for row in due {
            let interval: BillingInterval = row.new_interval.parse()?;
            let new_starts = row.ends_at;
            let new_ends = interval.advance(new_starts, row.new_interval_count.max(1));
            let old_price = row.custom_price_cents.unwrap_or(row.old_amount_cents);
            let kind = classify_change(old_price, row.new_amount_cents);

            sqlx::query(
                r#"
                UPDATE subscriptions SET
                    plan_price_id = next_plan_price_id,
                    next_plan_price_id = NULL,
                    custom_price_cents = NULL,
                    starts_at = $1,
                    ends_at = $2,
                    status = $3,
                    updated_at = NOW()
                WHERE id = $4
                "#,
            )
            .bind(new_starts)
            .bind(new_ends)
            .bind(SubscriptionStatus::Active.as_str())
            .bind(row.id)
            .execute(&mut *tx)
            .await?;

            let event_type = match kind {
                PlanChangeKind::Upgrade => {
                    summary.upgrades += 1;
                    BillingEventType::SubscriptionUpgraded
                }
                PlanChangeKind::Downgrade => {
                    summary.downgrades += 1;
                    BillingEventType::SubscriptionDowngraded
                }
            };
            summary.applied += 1;
            events.push(
                BillingEventBuilder::new(row.tenant_id, event_type).data(serde_json::json!({
                    "subscription_id": row.id,
                    "plan_price_id": row.next_plan_price_id,
                    "scheduled": true,
                    "new_period_ends_at": new_ends,
                })),
            );

            tracing::info!(
                subscription_id = %row.id,
                tenant_id = %row.tenant_id,
                change = ?kind,
                "Applied scheduled plan change"
            );
        }

        tx.commit().await?;

        for event in events {
            self.event_logger.emit(event).await;
        }

        Ok(summary)
    }

    /// Subscriptions whose trial ends on the day `days_ahead` from now.
    /// Read-only; callers emit the reminders.
    pub async fn trials_ending_on(&self, days_ahead: i64) -> BillingResult<Vec<ReminderRow>> {
        let (from, to) = day_window(self.clock.now(), days_ahead);
        let rows = sqlx::query_as(
            r#"
            SELECT id AS subscription_id, tenant_id, trial_ends_at AS at
            FROM subscriptions
            WHERE trial_ends_at >= $1 AND trial_ends_at < $2
            "#,
        )
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Subscriptions ending on the day `days_ahead` from now, skipping
    /// those with a scheduled change (they roll into the new plan).
    pub async fn expiring_on(&self, days_ahead: i64) -> BillingResult<Vec<ReminderRow>> {
        let (from, to) = day_window(self.clock.now(), days_ahead);
        let rows = sqlx::query_as(
            r#"
            SELECT id AS subscription_id, tenant_id, ends_at AS at
            FROM subscriptions
            WHERE ends_at >= $1 AND ends_at < $2
              AND next_plan_price_id IS NULL
            "#,
        )
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Reconcile stale status caches against the derivation, emitting
    /// expiry events for subscriptions that just lost access.
    pub async fn reconcile_status_cache(&self, batch: i64) -> BillingResult<usize> {
        let now = self.clock.now();
        let rows: Vec<Subscription> = sqlx::query_as(
            r#"
            SELECT id, tenant_id, plan_price_id, next_plan_price_id, custom_price_cents,
                   starts_at, ends_at, trial_ends_at, canceled_at, grace_period_ends_at,
                   status, created_at
            FROM subscriptions
            ORDER BY updated_at ASC
            LIMIT $1
            "#,
        )
        .bind(batch)
        .fetch_all(&self.pool)
        .await?;

        let mut reconciled = 0;
        for sub in rows {
            let derived = sub.derived_status(now);
            if sub.status == derived.as_str() {
                continue;
            }

            sqlx::query("UPDATE subscriptions SET status = $1, updated_at = NOW() WHERE id = $2")
                .bind(derived.as_str())
                .bind(sub.id)
                .execute(&self.pool)
                .await?;
            reconciled += 1;

            let was_granting = sub
                .status
                .parse::<SubscriptionStatus>()
                .map(|s| s.grants_access())
                .unwrap_or(false);
            if was_granting && derived == SubscriptionStatus::Expired {
                self.event_logger
                    .emit(
                        BillingEventBuilder::new(
                            sub.tenant_id,
                            BillingEventType::SubscriptionExpired,
                        )
                        .data(serde_json::json!({
                            "subscription_id": sub.id,
                            "ended_at": sub.ends_at,
                        })),
                    )
                    .await;
            }

            tracing::debug!(
                subscription_id = %sub.id,
                cached = %sub.status,
                derived = %derived,
                "Reconciled subscription status cache"
            );
        }

        Ok(reconciled)
    }
}

/// UTC day window `days_ahead` days from `now`.
fn day_window(now: OffsetDateTime, days_ahead: i64) -> (OffsetDateTime, OffsetDateTime) {
    let target = (now + Duration::days(days_ahead))
        .to_offset(time::UtcOffset::UTC)
        .date();
    let start = OffsetDateTime::new_utc(target, time::Time::MIDNIGHT);
    (start, start + Duration::days(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    const NOW: OffsetDateTime = datetime!(2026-06-15 12:00 UTC);

    fn days(n: i64) -> OffsetDateTime {
        NOW + Duration::days(n)
    }

    fn sub(
        trial_ends_at: Option<OffsetDateTime>,
        ends_at: OffsetDateTime,
        canceled_at: Option<OffsetDateTime>,
        grace: Option<OffsetDateTime>,
    ) -> Subscription {
        Subscription {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            plan_price_id: Uuid::new_v4(),
            next_plan_price_id: None,
            custom_price_cents: None,
            starts_at: days(-30),
            ends_at,
            trial_ends_at,
            canceled_at,
            grace_period_ends_at: grace,
            status: "active".to_string(),
            created_at: days(-30),
        }
    }

    #[test]
    fn test_derive_status_active() {
        assert_eq!(
            derive_status(NOW, None, days(10), None, None),
            SubscriptionStatus::Active
        );
    }

    #[test]
    fn test_derive_status_trialing_wins_over_cancellation() {
        assert_eq!(
            derive_status(NOW, Some(days(5)), days(10), Some(days(-1)), None),
            SubscriptionStatus::Trialing
        );
    }

    #[test]
    fn test_derive_status_expired_trial_falls_through() {
        assert_eq!(
            derive_status(NOW, Some(days(-1)), days(10), None, None),
            SubscriptionStatus::Active
        );
    }

    #[test]
    fn test_derive_status_past_due_within_grace() {
        assert_eq!(
            derive_status(NOW, None, days(-1), None, Some(days(3))),
            SubscriptionStatus::PastDue
        );
    }

    #[test]
    fn test_derive_status_expired_without_or_past_grace() {
        assert_eq!(
            derive_status(NOW, None, days(-1), None, None),
            SubscriptionStatus::Expired
        );
        assert_eq!(
            derive_status(NOW, None, days(-5), None, Some(days(-1))),
            SubscriptionStatus::Expired
        );
    }

    #[test]
    fn test_derive_status_canceled_before_period_end() {
        assert_eq!(
            derive_status(NOW, None, days(10), Some(days(-2)), None),
            SubscriptionStatus::Canceled
        );
    }

    #[test]
    fn test_derive_status_ends_exactly_now_is_expired() {
        assert_eq!(
            derive_status(NOW, None, NOW, None, None),
            SubscriptionStatus::Expired
        );
    }

    #[test]
    fn test_subscription_derived_status_matches_free_function() {
        let s = sub(None, days(-2), None, Some(days(2)));
        assert_eq!(s.derived_status(NOW), SubscriptionStatus::PastDue);
    }

    #[test]
    fn test_effective_price_prefers_override() {
        let mut s = sub(None, days(30), None, None);
        s.custom_price_cents = Some(39_900);
        assert_eq!(s.effective_price_cents(45_000), 39_900);
        s.custom_price_cents = None;
        assert_eq!(s.effective_price_cents(45_000), 45_000);
    }

    #[test]
    fn test_day_window_covers_target_day() {
        let (from, to) = day_window(NOW, 3);
        assert_eq!(from, datetime!(2026-06-18 00:00 UTC));
        assert_eq!(to, datetime!(2026-06-19 00:00 UTC));
    }
}
