//! Payment refunds
//!
//! Refunds go back through the gateway by merchant order id. Gateway
//! failures are folded into a structured result instead of an error so
//! callers can surface the reason; an already-refunded payment resolves
//! to the existing outcome.

use serde::Serialize;
use sqlx::PgPool;
use subflow_shared::PaymentStatus;
use uuid::Uuid;

use crate::checkout::Payment;
use crate::error::{BillingError, BillingResult};
use crate::events::{BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::gateway::PaymentGateway;

/// Outcome of a refund attempt.
#[derive(Debug, Clone, Serialize)]
pub struct RefundResult {
    pub payment_id: Uuid,
    pub success: bool,
    pub error: Option<String>,
}

pub struct RefundService<G: PaymentGateway> {
    pool: PgPool,
    gateway: G,
    event_logger: BillingEventLogger,
}

impl<G: PaymentGateway> RefundService<G> {
    pub fn new(pool: PgPool, gateway: G) -> Self {
        let event_logger = BillingEventLogger::new(pool.clone());
        Self {
            pool,
            gateway,
            event_logger,
        }
    }

    /// Refund a completed payment in full.
    ///
    /// The gateway round trip happens before any lock is taken; the row
    /// transition is guarded afterwards so a racing refund collapses to
    /// one state change.
    pub async fn refund_payment(&self, payment_id: Uuid) -> BillingResult<RefundResult> {
        let payment = self.load(payment_id).await?;
        let status: PaymentStatus = payment.status.parse()?;

        match status {
            // Double refund resolves to the existing outcome.
            PaymentStatus::Refunded => {
                return Ok(RefundResult {
                    payment_id,
                    success: true,
                    error: None,
                })
            }
            PaymentStatus::Completed => {}
            other => {
                return Err(BillingError::Validation(format!(
                    "payment {payment_id} is {other} and cannot be refunded"
                )))
            }
        }

        let refunded = match self
            .gateway
            .refund(&payment.merchant_order_id, payment.amount_cents)
            .await
        {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!(
                    payment_id = %payment_id,
                    error = %e,
                    "Gateway refund call failed"
                );
                return Ok(RefundResult {
                    payment_id,
                    success: false,
                    error: Some(e.to_string()),
                });
            }
        };
        if !refunded {
            return Ok(RefundResult {
                payment_id,
                success: false,
                error: Some("gateway declined the refund".to_string()),
            });
        }

        let updated = sqlx::query(
            "UPDATE payments SET status = $1, refunded_at = NOW() WHERE id = $2 AND status = $3",
        )
        .bind(PaymentStatus::Refunded.as_str())
        .bind(payment_id)
        .bind(PaymentStatus::Completed.as_str())
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() > 0 {
            self.event_logger
                .emit(
                    BillingEventBuilder::new(payment.tenant_id, BillingEventType::PaymentRefunded)
                        .data(serde_json::json!({
                            "payment_id": payment_id,
                            "amount_cents": payment.amount_cents,
                            "merchant_order_id": payment.merchant_order_id,
                        })),
                )
                .await;
            tracing::info!(
                payment_id = %payment_id,
                amount_cents = payment.amount_cents,
                "Payment refunded"
            );
        }

        Ok(RefundResult {
            payment_id,
            success: true,
            error: None,
        })
    }

    async fn load(&self, payment_id: Uuid) -> BillingResult<Payment> {
        sqlx::query_as(
            r#"
            SELECT id, tenant_id, checkout_id, merchant_order_id, amount_cents, currency,
                   status, subscription_id, addon_id, paid_at, created_at
            FROM payments
            WHERE id = $1
            "#,
        )
        .bind(payment_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| BillingError::NotFound(format!("payment {payment_id}")))
    }
}
