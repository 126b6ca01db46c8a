//! Checkout state machine
//!
//! A checkout moves `pending -> processing -> completed`, or falls into
//! one of the terminal failure states (`failed`, `expired`, `cancelled`).
//! Terminal states admit no transition; a duplicate callback for a
//! terminal checkout resolves to the stored result instead of an error.
//! All state transitions happen under a row lock in one transaction,
//! and the gateway is never called while a lock is held.

use std::sync::Arc;

use sqlx::PgPool;
use subflow_shared::{
    money::apply_tax, CheckoutStatus, CheckoutType, Clock, PaymentStatus, ProrationPolicy,
};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::config::BillingConfig;
use crate::error::{BillingError, BillingResult};
use crate::events::{BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::fulfillment;
use crate::gateway::{parse_callback, BuyerInfo, CallbackPayload, PaymentGateway, TokenRequest};
use crate::proration::{self, classify_change, policy_for_change, PlanChangeKind};
use crate::subscriptions::SubscriptionService;

/// What a checkout is buying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckoutTarget {
    Plan { plan_price_id: Uuid },
    Addon { addon_id: Uuid, quantity: i32 },
}

/// A purchase attempt. `status` and `checkout_type` are stored as TEXT;
/// go through the typed accessors.
#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct Checkout {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub checkout_type: String,
    pub status: String,
    pub plan_price_id: Option<Uuid>,
    pub addon_id: Option<Uuid>,
    pub quantity: Option<i32>,
    pub amount_cents: i64,
    pub proration_credit_cents: i64,
    pub final_amount_cents: i64,
    pub currency: String,
    /// Policy resolved at creation for plan changes; fulfillment reads it
    /// to decide between an immediate swap and scheduling.
    pub proration_policy: Option<String>,
    pub merchant_order_id: String,
    pub gateway_token: Option<String>,
    pub payment_url: Option<String>,
    pub failure_reason: Option<String>,
    pub expires_at: OffsetDateTime,
    pub completed_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

impl Checkout {
    pub fn status(&self) -> BillingResult<CheckoutStatus> {
        Ok(self.status.parse()?)
    }

    pub fn checkout_type(&self) -> BillingResult<CheckoutType> {
        Ok(self.checkout_type.parse()?)
    }

    pub fn proration_policy(&self) -> BillingResult<Option<ProrationPolicy>> {
        self.proration_policy
            .as_deref()
            .map(str::parse)
            .transpose()
            .map_err(Into::into)
    }

    /// The target columns must match the checkout type.
    pub fn target(&self) -> BillingResult<CheckoutTarget> {
        if self.checkout_type()?.is_addon() {
            match (self.addon_id, self.quantity) {
                (Some(addon_id), Some(quantity)) => Ok(CheckoutTarget::Addon { addon_id, quantity }),
                _ => Err(BillingError::Invariant(format!(
                    "add-on checkout {} is missing its target columns",
                    self.id
                ))),
            }
        } else {
            self.plan_price_id
                .map(|plan_price_id| CheckoutTarget::Plan { plan_price_id })
                .ok_or_else(|| {
                    BillingError::Invariant(format!(
                        "plan checkout {} has no plan_price_id",
                        self.id
                    ))
                })
        }
    }
}

/// Gateway-confirmed money movement. At most one per checkout.
#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct Payment {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub checkout_id: Uuid,
    pub merchant_order_id: String,
    pub amount_cents: i64,
    pub currency: String,
    pub status: String,
    pub subscription_id: Option<Uuid>,
    pub addon_id: Option<Uuid>,
    pub paid_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

/// Result of processing one gateway callback. Replays of a terminal
/// checkout return the stored state with `already_processed` set.
#[derive(Debug, Clone)]
pub struct CallbackOutcome {
    pub checkout: Checkout,
    pub payment: Option<Payment>,
    pub already_processed: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct AddonPricingRow {
    unit_price_cents: i64,
    currency: String,
}

/// Owns checkout creation, token generation, callback processing, and
/// the expiry sweep. Generic over the gateway so tests can plug a stub.
pub struct CheckoutService<G: PaymentGateway> {
    pool: PgPool,
    clock: Arc<dyn Clock>,
    gateway: G,
    config: BillingConfig,
    event_logger: BillingEventLogger,
    subscriptions: SubscriptionService,
}

impl<G: PaymentGateway> CheckoutService<G> {
    pub fn new(pool: PgPool, clock: Arc<dyn Clock>, gateway: G, config: BillingConfig) -> Self {
        let event_logger = BillingEventLogger::new(pool.clone());
        let subscriptions = SubscriptionService::new(pool.clone(), clock.clone());
        Self {
            pool,
            clock,
            gateway,
            config,
            event_logger,
            subscriptions,
        }
    }

    /// Create a checkout for a plan or add-on purchase. The type (new,
    /// renew, upgrade, downgrade, addon, addon_renew) is classified from
    /// the tenant's current state; amounts are computed here and frozen
    /// on the row.
    pub async fn create(&self, tenant_id: Uuid, target: CheckoutTarget) -> BillingResult<Checkout> {
        let now = self.clock.now();
        let pricing = match target {
            CheckoutTarget::Plan { plan_price_id } => {
                self.price_plan_checkout(tenant_id, plan_price_id, now).await?
            }
            CheckoutTarget::Addon { addon_id, quantity } => {
                self.price_addon_checkout(tenant_id, addon_id, quantity).await?
            }
        };

        let merchant_order_id = format!("sf-{}", Uuid::new_v4().simple());
        let expires_at = now + Duration::minutes(self.config.checkout_session_timeout_minutes);
        let (plan_price_id, addon_id, quantity) = match target {
            CheckoutTarget::Plan { plan_price_id } => (Some(plan_price_id), None, None),
            CheckoutTarget::Addon { addon_id, quantity } => (None, Some(addon_id), Some(quantity)),
        };

        let checkout: Checkout = sqlx::query_as(
            r#"
            INSERT INTO checkouts (
                tenant_id, checkout_type, status, plan_price_id, addon_id, quantity,
                amount_cents, proration_credit_cents, final_amount_cents, currency,
                proration_policy, merchant_order_id, expires_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING id, tenant_id, checkout_type, status, plan_price_id, addon_id, quantity,
                      amount_cents, proration_credit_cents, final_amount_cents, currency,
                      proration_policy, merchant_order_id, gateway_token, payment_url,
                      failure_reason, expires_at, completed_at, created_at
            "#,
        )
        .bind(tenant_id)
        .bind(pricing.checkout_type.as_str())
        .bind(CheckoutStatus::Pending.as_str())
        .bind(plan_price_id)
        .bind(addon_id)
        .bind(quantity)
        .bind(pricing.amount_cents)
        .bind(pricing.proration_credit_cents)
        .bind(pricing.final_amount_cents)
        .bind(&pricing.currency)
        .bind(pricing.policy.map(|p| p.as_str()))
        .bind(&merchant_order_id)
        .bind(expires_at)
        .fetch_one(&self.pool)
        .await?;

        self.event_logger
            .emit(
                BillingEventBuilder::new(tenant_id, BillingEventType::CheckoutInitiated).data(
                    serde_json::json!({
                        "checkout_id": checkout.id,
                        "checkout_type": checkout.checkout_type,
                        "final_amount_cents": checkout.final_amount_cents,
                        "currency": checkout.currency,
                    }),
                ),
            )
            .await;

        tracing::info!(
            checkout_id = %checkout.id,
            tenant_id = %tenant_id,
            checkout_type = %checkout.checkout_type,
            final_amount_cents = checkout.final_amount_cents,
            "Checkout created"
        );
        Ok(checkout)
    }

    /// Create a payment token for a pending/processing checkout. The
    /// gateway call happens without any row lock; on success the checkout
    /// moves to `processing` and stores the token. A gateway failure
    /// leaves the row untouched so the caller may retry.
    pub async fn generate_token(
        &self,
        checkout_id: Uuid,
        buyer: BuyerInfo,
    ) -> BillingResult<Checkout> {
        let checkout = self.load(checkout_id).await?;
        let status = checkout.status()?;
        if !status.can_generate_token() {
            return Err(BillingError::Validation(format!(
                "checkout {checkout_id} is {status}, token generation is not legal"
            )));
        }
        if checkout.expires_at <= self.clock.now() {
            return Err(BillingError::Validation(format!(
                "checkout {checkout_id} has expired"
            )));
        }

        let token = self
            .gateway
            .create_token(&TokenRequest {
                merchant_order_id: checkout.merchant_order_id.clone(),
                amount_cents: checkout.final_amount_cents,
                currency: checkout.currency.clone(),
                description: format!("{} checkout", checkout.checkout_type),
                buyer,
            })
            .await?;

        // A terminal transition may have raced the gateway call; the
        // guarded UPDATE refuses to resurrect a terminal row.
        let updated: Option<Checkout> = sqlx::query_as(
            r#"
            UPDATE checkouts
            SET status = $1, gateway_token = $2, payment_url = $3, updated_at = NOW()
            WHERE id = $4 AND status IN ('pending', 'processing')
            RETURNING id, tenant_id, checkout_type, status, plan_price_id, addon_id, quantity,
                      amount_cents, proration_credit_cents, final_amount_cents, currency,
                      proration_policy, merchant_order_id, gateway_token, payment_url,
                      failure_reason, expires_at, completed_at, created_at
            "#,
        )
        .bind(CheckoutStatus::Processing.as_str())
        .bind(&token.token)
        .bind(&token.payment_url)
        .bind(checkout_id)
        .fetch_optional(&self.pool)
        .await?;

        updated.ok_or_else(|| {
            BillingError::Validation(format!(
                "checkout {checkout_id} reached a terminal state during token generation"
            ))
        })
    }

    /// Process an inbound gateway callback.
    ///
    /// Verify the signature first; a bad signature drops the payload
    /// without touching any row. Then lock the checkout by merchant
    /// order id, absorb duplicates, re-check expiry, and apply the
    /// terminal transition plus the purchase effect in one transaction.
    pub async fn process_callback(&self, payload: &CallbackPayload) -> BillingResult<CallbackOutcome> {
        if !self.gateway.verify_callback(payload) {
            tracing::warn!(
                merchant_order_id = %payload.merchant_order_id,
                "Rejected callback with invalid signature"
            );
            return Err(BillingError::SignatureInvalid);
        }
        let parsed = parse_callback(payload);
        let now = self.clock.now();

        let mut tx = self.pool.begin().await?;
        let checkout: Checkout = sqlx::query_as(
            r#"
            SELECT id, tenant_id, checkout_type, status, plan_price_id, addon_id, quantity,
                   amount_cents, proration_credit_cents, final_amount_cents, currency,
                   proration_policy, merchant_order_id, gateway_token, payment_url,
                   failure_reason, expires_at, completed_at, created_at
            FROM checkouts
            WHERE merchant_order_id = $1
            FOR UPDATE
            "#,
        )
        .bind(&parsed.merchant_order_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| {
            BillingError::NotFound(format!("checkout for order {}", parsed.merchant_order_id))
        })?;

        // Duplicate webhook: the row is terminal, return what happened.
        if checkout.status()?.is_terminal() {
            let payment = self.payment_for_checkout(&mut tx, checkout.id).await?;
            tx.commit().await?;
            tracing::info!(
                checkout_id = %checkout.id,
                status = %checkout.status,
                "Duplicate callback absorbed"
            );
            return Ok(CallbackOutcome {
                checkout,
                payment,
                already_processed: true,
            });
        }

        // A token for an expired checkout is rejected here, not completed.
        if checkout.expires_at <= now {
            let checkout = mark_terminal(
                &mut tx,
                checkout.id,
                CheckoutStatus::Expired,
                Some("session expired before the callback arrived"),
                None,
            )
            .await?;
            tx.commit().await?;
            self.event_logger
                .emit(
                    BillingEventBuilder::new(checkout.tenant_id, BillingEventType::CheckoutExpired)
                        .data(serde_json::json!({ "checkout_id": checkout.id })),
                )
                .await;
            return Ok(CallbackOutcome {
                checkout,
                payment: None,
                already_processed: false,
            });
        }

        if !parsed.success {
            let checkout = mark_terminal(
                &mut tx,
                checkout.id,
                CheckoutStatus::Failed,
                Some(&format!("gateway reported '{}'", payload.status)),
                None,
            )
            .await?;
            tx.commit().await?;
            self.event_logger
                .emit(
                    BillingEventBuilder::new(checkout.tenant_id, BillingEventType::PaymentFailed)
                        .data(serde_json::json!({
                            "checkout_id": checkout.id,
                            "gateway_status": payload.status,
                        })),
                )
                .await;
            return Ok(CallbackOutcome {
                checkout,
                payment: None,
                already_processed: false,
            });
        }

        if parsed.amount_cents != checkout.final_amount_cents {
            return Err(BillingError::Validation(format!(
                "callback amount {} does not match checkout amount {}",
                parsed.amount_cents, checkout.final_amount_cents
            )));
        }

        let payment: Payment = sqlx::query_as(
            r#"
            INSERT INTO payments (
                tenant_id, checkout_id, merchant_order_id, amount_cents, currency, status, paid_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id, tenant_id, checkout_id, merchant_order_id, amount_cents, currency,
                      status, subscription_id, addon_id, paid_at, created_at
            "#,
        )
        .bind(checkout.tenant_id)
        .bind(checkout.id)
        .bind(&checkout.merchant_order_id)
        .bind(checkout.final_amount_cents)
        .bind(&checkout.currency)
        .bind(PaymentStatus::Completed.as_str())
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        let events = fulfillment::apply(&mut tx, &checkout, Some(&payment), now).await?;
        let checkout =
            mark_terminal(&mut tx, checkout.id, CheckoutStatus::Completed, None, Some(now)).await?;
        tx.commit().await?;

        self.event_logger
            .emit(
                BillingEventBuilder::new(checkout.tenant_id, BillingEventType::PaymentSucceeded)
                    .data(serde_json::json!({
                        "checkout_id": checkout.id,
                        "payment_id": payment.id,
                        "amount_cents": payment.amount_cents,
                    })),
            )
            .await;
        for event in events {
            self.event_logger.emit(event).await;
        }

        tracing::info!(
            checkout_id = %checkout.id,
            payment_id = %payment.id,
            "Checkout completed"
        );
        Ok(CallbackOutcome {
            checkout,
            payment: Some(payment),
            already_processed: false,
        })
    }

    /// Complete a zero-amount checkout without gateway involvement, e.g.
    /// an immediate downgrade fully covered by the proration credit.
    pub async fn complete_without_payment(&self, checkout_id: Uuid) -> BillingResult<CallbackOutcome> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;
        let checkout: Checkout = sqlx::query_as(
            r#"
            SELECT id, tenant_id, checkout_type, status, plan_price_id, addon_id, quantity,
                   amount_cents, proration_credit_cents, final_amount_cents, currency,
                   proration_policy, merchant_order_id, gateway_token, payment_url,
                   failure_reason, expires_at, completed_at, created_at
            FROM checkouts
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(checkout_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| BillingError::NotFound(format!("checkout {checkout_id}")))?;

        if checkout.status()?.is_terminal() {
            let payment = self.payment_for_checkout(&mut tx, checkout.id).await?;
            tx.commit().await?;
            return Ok(CallbackOutcome {
                checkout,
                payment,
                already_processed: true,
            });
        }
        if checkout.final_amount_cents != 0 {
            return Err(BillingError::Validation(format!(
                "checkout {checkout_id} owes {} cents and requires a payment",
                checkout.final_amount_cents
            )));
        }

        let events = fulfillment::apply(&mut tx, &checkout, None, now).await?;
        let checkout =
            mark_terminal(&mut tx, checkout.id, CheckoutStatus::Completed, None, Some(now)).await?;
        tx.commit().await?;

        for event in events {
            self.event_logger.emit(event).await;
        }
        Ok(CallbackOutcome {
            checkout,
            payment: None,
            already_processed: false,
        })
    }

    /// Cancel an in-flight checkout. Terminal rows are left as they are
    /// and returned unchanged.
    pub async fn cancel(&self, checkout_id: Uuid) -> BillingResult<Checkout> {
        let mut tx = self.pool.begin().await?;
        let checkout: Checkout = sqlx::query_as(
            r#"
            SELECT id, tenant_id, checkout_type, status, plan_price_id, addon_id, quantity,
                   amount_cents, proration_credit_cents, final_amount_cents, currency,
                   proration_policy, merchant_order_id, gateway_token, payment_url,
                   failure_reason, expires_at, completed_at, created_at
            FROM checkouts
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(checkout_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| BillingError::NotFound(format!("checkout {checkout_id}")))?;

        if !checkout.status()?.is_cancellable() {
            tx.commit().await?;
            return Ok(checkout);
        }

        let checkout = mark_terminal(
            &mut tx,
            checkout.id,
            CheckoutStatus::Cancelled,
            Some("cancelled by the tenant"),
            None,
        )
        .await?;
        tx.commit().await?;

        self.event_logger
            .emit(
                BillingEventBuilder::new(checkout.tenant_id, BillingEventType::CheckoutCancelled)
                    .data(serde_json::json!({ "checkout_id": checkout.id })),
            )
            .await;
        Ok(checkout)
    }

    /// Sweep pending/processing checkouts past their `expires_at` into
    /// `expired`. Returns how many rows transitioned.
    pub async fn expire_stale(&self) -> BillingResult<usize> {
        let now = self.clock.now();
        let expired: Vec<(Uuid, Uuid)> = sqlx::query_as(
            r#"
            UPDATE checkouts
            SET status = $1, failure_reason = 'session timed out', updated_at = NOW()
            WHERE status IN ('pending', 'processing') AND expires_at <= $2
            RETURNING id, tenant_id
            "#,
        )
        .bind(CheckoutStatus::Expired.as_str())
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        for (checkout_id, tenant_id) in &expired {
            self.event_logger
                .emit(
                    BillingEventBuilder::new(*tenant_id, BillingEventType::CheckoutExpired)
                        .data(serde_json::json!({ "checkout_id": checkout_id })),
                )
                .await;
        }
        if !expired.is_empty() {
            tracing::info!(expired = expired.len(), "Checkout expiry sweep complete");
        }
        Ok(expired.len())
    }

    pub async fn load(&self, checkout_id: Uuid) -> BillingResult<Checkout> {
        sqlx::query_as(
            r#"
            SELECT id, tenant_id, checkout_type, status, plan_price_id, addon_id, quantity,
                   amount_cents, proration_credit_cents, final_amount_cents, currency,
                   proration_policy, merchant_order_id, gateway_token, payment_url,
                   failure_reason, expires_at, completed_at, created_at
            FROM checkouts
            WHERE id = $1
            "#,
        )
        .bind(checkout_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| BillingError::NotFound(format!("checkout {checkout_id}")))
    }

    async fn payment_for_checkout(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        checkout_id: Uuid,
    ) -> BillingResult<Option<Payment>> {
        let payment = sqlx::query_as(
            r#"
            SELECT id, tenant_id, checkout_id, merchant_order_id, amount_cents, currency,
                   status, subscription_id, addon_id, paid_at, created_at
            FROM payments
            WHERE checkout_id = $1
            "#,
        )
        .bind(checkout_id)
        .fetch_optional(&mut **tx)
        .await?;
        Ok(payment)
    }

    async fn price_plan_checkout(
        &self,
        tenant_id: Uuid,
        plan_price_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<CheckoutPricing> {
        let price = self.subscriptions.load_plan_price(plan_price_id).await?;
        let current = self.subscriptions.current_for_tenant(tenant_id).await?;
        let current = current.filter(|s| s.derived_status(now).grants_access());

        let Some(sub) = current else {
            return Ok(CheckoutPricing {
                checkout_type: CheckoutType::New,
                amount_cents: price.amount_cents,
                proration_credit_cents: 0,
                final_amount_cents: price.amount_cents,
                currency: price.currency,
                policy: None,
            });
        };

        if sub.plan_price_id == plan_price_id {
            let amount = sub.effective_price_cents(price.amount_cents);
            return Ok(CheckoutPricing {
                checkout_type: CheckoutType::Renew,
                amount_cents: amount,
                proration_credit_cents: 0,
                final_amount_cents: amount,
                currency: price.currency,
                policy: None,
            });
        }

        let old_price = self.subscriptions.load_plan_price(sub.plan_price_id).await?;
        let current_cents = sub.effective_price_cents(old_price.amount_cents);
        let kind = classify_change(current_cents, price.amount_cents);
        let policies = self.subscriptions.plan_policies(plan_price_id).await?;
        let policy = policy_for_change(
            kind,
            policies.upgrade,
            policies.downgrade,
            self.config.default_upgrade_policy,
            self.config.default_downgrade_policy,
        );
        let proration = proration::calculate(
            sub.starts_at,
            sub.ends_at,
            current_cents,
            price.amount_cents,
            policy,
            now,
        );

        Ok(CheckoutPricing {
            checkout_type: match kind {
                PlanChangeKind::Upgrade => CheckoutType::Upgrade,
                PlanChangeKind::Downgrade => CheckoutType::Downgrade,
            },
            amount_cents: proration.new_amount_cents,
            proration_credit_cents: proration.credit_cents,
            final_amount_cents: proration.final_amount_cents,
            currency: price.currency,
            policy: Some(policy),
        })
    }

    async fn price_addon_checkout(
        &self,
        tenant_id: Uuid,
        addon_id: Uuid,
        quantity: i32,
    ) -> BillingResult<CheckoutPricing> {
        if quantity < 1 {
            return Err(BillingError::Validation(format!(
                "add-on quantity must be at least 1, got {quantity}"
            )));
        }
        let addon: AddonPricingRow = sqlx::query_as(
            "SELECT unit_price_cents, currency FROM addons WHERE id = $1",
        )
        .bind(addon_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| BillingError::NotFound(format!("addon {addon_id}")))?;

        let already_attached: Option<(Uuid,)> = sqlx::query_as(
            "SELECT addon_id FROM tenant_addons WHERE tenant_id = $1 AND addon_id = $2",
        )
        .bind(tenant_id)
        .bind(addon_id)
        .fetch_optional(&self.pool)
        .await?;

        let subtotal = addon.unit_price_cents * quantity as i64;
        let total = subtotal + apply_tax(subtotal, self.config.tax_rate_bp);
        Ok(CheckoutPricing {
            checkout_type: if already_attached.is_some() {
                CheckoutType::AddonRenew
            } else {
                CheckoutType::Addon
            },
            amount_cents: subtotal,
            proration_credit_cents: 0,
            final_amount_cents: total,
            currency: addon.currency,
            policy: None,
        })
    }
}

struct CheckoutPricing {
    checkout_type: CheckoutType,
    amount_cents: i64,
    proration_credit_cents: i64,
    final_amount_cents: i64,
    currency: String,
    policy: Option<ProrationPolicy>,
}

/// Apply a terminal transition under the caller's row lock.
async fn mark_terminal(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    checkout_id: Uuid,
    status: CheckoutStatus,
    failure_reason: Option<&str>,
    completed_at: Option<OffsetDateTime>,
) -> BillingResult<Checkout> {
    let checkout = sqlx::query_as(
        r#"
        UPDATE checkouts
        SET status = $1, failure_reason = $2, completed_at = $3, updated_at = NOW()
        WHERE id = $4
        RETURNING id, tenant_id, checkout_type, status, plan_price_id, addon_id, quantity,
                  amount_cents, proration_credit_cents, final_amount_cents, currency,
                  proration_policy, merchant_order_id, gateway_token, payment_url,
                  failure_reason, expires_at, completed_at, created_at
        "#,
    )
    .bind(status.as_str())
    .bind(failure_reason)
    .bind(completed_at)
    .bind(checkout_id)
    .fetch_one(&mut **tx)
    .await?;
    Ok(checkout)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkout(checkout_type: CheckoutType, status: CheckoutStatus) -> Checkout {
        Checkout {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            checkout_type: checkout_type.as_str().to_string(),
            status: status.as_str().to_string(),
            plan_price_id: None,
            addon_id: None,
            quantity: None,
            amount_cents: 45_000,
            proration_credit_cents: 0,
            final_amount_cents: 45_000,
            currency: "USD".to_string(),
            proration_policy: None,
            merchant_order_id: "sf-test".to_string(),
            gateway_token: None,
            payment_url: None,
            failure_reason: None,
            expires_at: OffsetDateTime::UNIX_EPOCH,
            completed_at: None,
            created_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn test_plan_target_requires_plan_price_id() {
        let c = checkout(CheckoutType::Upgrade, CheckoutStatus::Pending);
        assert!(matches!(c.target(), Err(BillingError::Invariant(_))));

        let mut c = checkout(CheckoutType::Upgrade, CheckoutStatus::Pending);
        let price_id = Uuid::new_v4();
        c.plan_price_id = Some(price_id);
        assert_eq!(
            c.target().unwrap(),
            CheckoutTarget::Plan {
                plan_price_id: price_id
            }
        );
    }

    #[test]
    fn test_addon_target_requires_both_columns() {
        let mut c = checkout(CheckoutType::Addon, CheckoutStatus::Pending);
        c.addon_id = Some(Uuid::new_v4());
        // quantity still missing
        assert!(matches!(c.target(), Err(BillingError::Invariant(_))));

        c.quantity = Some(3);
        assert!(matches!(
            c.target().unwrap(),
            CheckoutTarget::Addon { quantity: 3, .. }
        ));
    }

    #[test]
    fn test_typed_accessors_reject_corrupt_rows() {
        let mut c = checkout(CheckoutType::New, CheckoutStatus::Pending);
        c.status = "sideways".to_string();
        assert!(c.status().is_err());

        let mut c = checkout(CheckoutType::New, CheckoutStatus::Pending);
        c.proration_policy = Some("whenever".to_string());
        assert!(c.proration_policy().is_err());
    }
}
