//! Purchase post-processors
//!
//! Applies the business effect of a completed checkout inside the same
//! transaction that records the payment: subscription creation and
//! renewal, plan swaps, scheduled downgrades, and add-on attachment.
//! Processing is idempotent under at-least-once delivery: a payment that
//! already references a subscription or add-on is left alone.

use sqlx::{Postgres, Transaction};
use subflow_shared::{BillingInterval, CheckoutType, ProrationPolicy, SubscriptionStatus};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::checkout::{Checkout, CheckoutTarget, Payment};
use crate::error::{BillingError, BillingResult};
use crate::events::{BillingEventBuilder, BillingEventType};
use crate::subscriptions::PlanPrice;

/// Apply a completed checkout's effect. Returns the domain events to
/// emit after the enclosing transaction commits.
pub async fn apply(
    tx: &mut Transaction<'_, Postgres>,
    checkout: &Checkout,
    payment: Option<&Payment>,
    now: OffsetDateTime,
) -> BillingResult<Vec<BillingEventBuilder>> {
    // Already post-processed; at-least-once delivery makes this a no-op.
    if payment.is_some_and(|p| p.subscription_id.is_some() || p.addon_id.is_some()) {
        tracing::info!(
            checkout_id = %checkout.id,
            "Payment already post-processed, skipping"
        );
        return Ok(Vec::new());
    }

    match checkout.target()? {
        CheckoutTarget::Plan { plan_price_id } => {
            apply_plan(tx, checkout, payment, plan_price_id, now).await
        }
        CheckoutTarget::Addon { addon_id, quantity } => {
            apply_addon(tx, checkout, payment, addon_id, quantity, now).await
        }
    }
}

async fn apply_plan(
    tx: &mut Transaction<'_, Postgres>,
    checkout: &Checkout,
    payment: Option<&Payment>,
    plan_price_id: Uuid,
    now: OffsetDateTime,
) -> BillingResult<Vec<BillingEventBuilder>> {
    let price = load_price(tx, plan_price_id).await?;

    let (subscription_id, event) = match checkout.checkout_type()? {
        CheckoutType::New => {
            let trial_ends_at = (price.trial_days > 0)
                .then(|| now + time::Duration::days(price.trial_days as i64));
            let ends_at = price.period_end(now)?;
            let status = if trial_ends_at.is_some() {
                SubscriptionStatus::Trialing
            } else {
                SubscriptionStatus::Active
            };

            let (id,): (Uuid,) = sqlx::query_as(
                r#"
                INSERT INTO subscriptions (
                    tenant_id, plan_price_id, starts_at, ends_at, trial_ends_at, status
                )
                VALUES ($1, $2, $3, $4, $5, $6)
                RETURNING id
                "#,
            )
            .bind(checkout.tenant_id)
            .bind(plan_price_id)
            .bind(now)
            .bind(ends_at)
            .bind(trial_ends_at)
            .bind(status.as_str())
            .fetch_one(&mut **tx)
            .await?;

            let event = BillingEventBuilder::new(
                checkout.tenant_id,
                BillingEventType::SubscriptionPurchased,
            )
            .data(serde_json::json!({
                "subscription_id": id,
                "plan_price_id": plan_price_id,
                "ends_at": ends_at,
            }));
            (id, event)
        }

        CheckoutType::Renew => {
            let sub = lock_current_subscription(tx, checkout.tenant_id).await?;
            // Renewal extends from whichever is later, so early renewals
            // do not lose remaining time.
            let base = if sub.ends_at > now { sub.ends_at } else { now };
            let ends_at = price.period_end(base)?;

            sqlx::query(
                r#"
                UPDATE subscriptions
                SET ends_at = $1, canceled_at = NULL, grace_period_ends_at = NULL,
                    status = $2, updated_at = NOW()
                WHERE id = $3
                "#,
            )
            .bind(ends_at)
            .bind(SubscriptionStatus::Active.as_str())
            .bind(sub.id)
            .execute(&mut **tx)
            .await?;

            let event =
                BillingEventBuilder::new(checkout.tenant_id, BillingEventType::SubscriptionRenewed)
                    .data(serde_json::json!({
                        "subscription_id": sub.id,
                        "ends_at": ends_at,
                    }));
            (sub.id, event)
        }

        CheckoutType::Upgrade => {
            let sub = lock_current_subscription(tx, checkout.tenant_id).await?;
            let ends_at = price.period_end(now)?;
            swap_plan(tx, sub.id, plan_price_id, now, ends_at).await?;

            let event = BillingEventBuilder::new(
                checkout.tenant_id,
                BillingEventType::SubscriptionUpgraded,
            )
            .data(serde_json::json!({
                "subscription_id": sub.id,
                "plan_price_id": plan_price_id,
                "proration_credit_cents": checkout.proration_credit_cents,
            }));
            (sub.id, event)
        }

        CheckoutType::Downgrade => {
            let sub = lock_current_subscription(tx, checkout.tenant_id).await?;
            let policy = checkout
                .proration_policy()?
                .unwrap_or(ProrationPolicy::EndOfPeriod);

            let event = match policy {
                ProrationPolicy::Immediate => {
                    let ends_at = price.period_end(now)?;
                    swap_plan(tx, sub.id, plan_price_id, now, ends_at).await?;
                    BillingEventBuilder::new(
                        checkout.tenant_id,
                        BillingEventType::SubscriptionDowngraded,
                    )
                    .data(serde_json::json!({
                        "subscription_id": sub.id,
                        "plan_price_id": plan_price_id,
                    }))
                }
                ProrationPolicy::EndOfPeriod => {
                    sqlx::query(
                        "UPDATE subscriptions SET next_plan_price_id = $1, updated_at = NOW() WHERE id = $2",
                    )
                    .bind(plan_price_id)
                    .bind(sub.id)
                    .execute(&mut **tx)
                    .await?;
                    BillingEventBuilder::new(
                        checkout.tenant_id,
                        BillingEventType::SubscriptionDowngradeScheduled,
                    )
                    .data(serde_json::json!({
                        "subscription_id": sub.id,
                        "new_plan_price_id": plan_price_id,
                        "effective_at": sub.ends_at,
                    }))
                }
            };
            (sub.id, event)
        }

        other => {
            return Err(BillingError::Invariant(format!(
                "checkout {} has plan target but type {other}",
                checkout.id
            )))
        }
    };

    if let Some(payment) = payment {
        sqlx::query("UPDATE payments SET subscription_id = $1 WHERE id = $2")
            .bind(subscription_id)
            .bind(payment.id)
            .execute(&mut **tx)
            .await?;
    }
    Ok(vec![event])
}

async fn apply_addon(
    tx: &mut Transaction<'_, Postgres>,
    checkout: &Checkout,
    payment: Option<&Payment>,
    addon_id: Uuid,
    quantity: i32,
    now: OffsetDateTime,
) -> BillingResult<Vec<BillingEventBuilder>> {
    let addon: AddonRow = sqlx::query_as(
        "SELECT id, billing_interval, interval_count FROM addons WHERE id = $1",
    )
    .bind(addon_id)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or_else(|| BillingError::NotFound(format!("addon {addon_id}")))?;

    // One-off add-ons never expire; recurring ones run one interval.
    let expires_at = match addon.billing_interval.as_deref() {
        Some(raw) => {
            let interval: BillingInterval = raw.parse()?;
            Some(interval.advance(now, addon.interval_count.max(1)))
        }
        None => None,
    };

    sqlx::query(
        r#"
        INSERT INTO tenant_addons (tenant_id, addon_id, quantity, started_at, expires_at, is_active)
        VALUES ($1, $2, $3, $4, $5, TRUE)
        ON CONFLICT (tenant_id, addon_id) DO UPDATE SET
            quantity = EXCLUDED.quantity,
            started_at = EXCLUDED.started_at,
            expires_at = EXCLUDED.expires_at,
            is_active = TRUE,
            updated_at = NOW()
        "#,
    )
    .bind(checkout.tenant_id)
    .bind(addon_id)
    .bind(quantity)
    .bind(now)
    .bind(expires_at)
    .execute(&mut **tx)
    .await?;

    if let Some(payment) = payment {
        sqlx::query("UPDATE payments SET addon_id = $1 WHERE id = $2")
            .bind(addon_id)
            .bind(payment.id)
            .execute(&mut **tx)
            .await?;
    }

    let event_type = match checkout.checkout_type()? {
        CheckoutType::AddonRenew => BillingEventType::SubscriptionRenewed,
        _ => BillingEventType::SubscriptionPurchased,
    };
    Ok(vec![BillingEventBuilder::new(checkout.tenant_id, event_type).data(
        serde_json::json!({
            "addon_id": addon_id,
            "quantity": quantity,
            "expires_at": expires_at,
        }),
    )])
}

#[derive(Debug, sqlx::FromRow)]
struct AddonRow {
    #[allow(dead_code)]
    id: Uuid,
    billing_interval: Option<String>,
    interval_count: i32,
}

#[derive(Debug, sqlx::FromRow)]
struct LockedSubscription {
    id: Uuid,
    ends_at: OffsetDateTime,
}

/// Lock the tenant's current subscription for the plan swap. A plan
/// checkout for a tenant without one is an invariant violation that
/// aborts the transaction.
async fn lock_current_subscription(
    tx: &mut Transaction<'_, Postgres>,
    tenant_id: Uuid,
) -> BillingResult<LockedSubscription> {
    sqlx::query_as(
        r#"
        SELECT id, ends_at
        FROM subscriptions
        WHERE tenant_id = $1
        ORDER BY created_at DESC
        LIMIT 1
        FOR UPDATE
        "#,
    )
    .bind(tenant_id)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or(BillingError::MissingSubscription(tenant_id))
}

async fn load_price(
    tx: &mut Transaction<'_, Postgres>,
    plan_price_id: Uuid,
) -> BillingResult<PlanPrice> {
    sqlx::query_as(
        r#"
        SELECT id, plan_id, amount_cents, currency, billing_interval, interval_count, trial_days
        FROM plan_prices
        WHERE id = $1
        "#,
    )
    .bind(plan_price_id)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or_else(|| BillingError::NotFound(format!("plan price {plan_price_id}")))
}

/// Swap the subscription onto a new price and start a fresh period.
async fn swap_plan(
    tx: &mut Transaction<'_, Postgres>,
    subscription_id: Uuid,
    plan_price_id: Uuid,
    starts_at: OffsetDateTime,
    ends_at: OffsetDateTime,
) -> BillingResult<()> {
    sqlx::query(
        r#"
        UPDATE subscriptions SET
            plan_price_id = $1,
            next_plan_price_id = NULL,
            custom_price_cents = NULL,
            starts_at = $2,
            ends_at = $3,
            status = $4,
            updated_at = NOW()
        WHERE id = $5
        "#,
    )
    .bind(plan_price_id)
    .bind(starts_at)
    .bind(ends_at)
    .bind(SubscriptionStatus::Active.as_str())
    .bind(subscription_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}
