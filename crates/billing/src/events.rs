//! Domain event outbox
//!
//! Every business mutation appends a row to `billing_events`; downstream
//! consumers (mail, in-app notifications, activity log) read the outbox
//! on their own schedule. Events are written after the owning transaction
//! commits — a failed append is logged and never fails the mutation.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// All domain signals the engine emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingEventType {
    CheckoutInitiated,
    CheckoutExpired,
    CheckoutCancelled,
    PaymentSucceeded,
    PaymentFailed,
    PaymentRefunded,
    SubscriptionPurchased,
    SubscriptionRenewed,
    SubscriptionUpgraded,
    SubscriptionDowngraded,
    SubscriptionDowngradeScheduled,
    SubscriptionExpired,
    TrialEndingSoon,
    SubscriptionEndingSoon,
    UsageLimitReached,
    UsageReset,
}

impl BillingEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingEventType::CheckoutInitiated => "checkout_initiated",
            BillingEventType::CheckoutExpired => "checkout_expired",
            BillingEventType::CheckoutCancelled => "checkout_cancelled",
            BillingEventType::PaymentSucceeded => "payment_succeeded",
            BillingEventType::PaymentFailed => "payment_failed",
            BillingEventType::PaymentRefunded => "payment_refunded",
            BillingEventType::SubscriptionPurchased => "subscription_purchased",
            BillingEventType::SubscriptionRenewed => "subscription_renewed",
            BillingEventType::SubscriptionUpgraded => "subscription_upgraded",
            BillingEventType::SubscriptionDowngraded => "subscription_downgraded",
            BillingEventType::SubscriptionDowngradeScheduled => "subscription_downgrade_scheduled",
            BillingEventType::SubscriptionExpired => "subscription_expired",
            BillingEventType::TrialEndingSoon => "trial_ending_soon",
            BillingEventType::SubscriptionEndingSoon => "subscription_ending_soon",
            BillingEventType::UsageLimitReached => "usage_limit_reached",
            BillingEventType::UsageReset => "usage_reset",
        }
    }
}

impl std::fmt::Display for BillingEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A domain event ready to be appended to the outbox.
#[derive(Debug, Clone, Serialize)]
pub struct BillingEvent {
    pub tenant_id: Uuid,
    pub event_type: BillingEventType,
    pub data: serde_json::Value,
}

/// Builder mirroring the call sites: tenant + type, then optional payload.
pub struct BillingEventBuilder {
    event: BillingEvent,
}

impl BillingEventBuilder {
    pub fn new(tenant_id: Uuid, event_type: BillingEventType) -> Self {
        Self {
            event: BillingEvent {
                tenant_id,
                event_type,
                data: serde_json::Value::Null,
            },
        }
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.event.data = data;
        self
    }

    pub fn build(self) -> BillingEvent {
        self.event
    }
}

/// Stored outbox row.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct BillingEventRecord {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub event_type: String,
    pub data: serde_json::Value,
    pub created_at: OffsetDateTime,
}

/// Appends events to the `billing_events` outbox.
#[derive(Clone)]
pub struct BillingEventLogger {
    pool: PgPool,
}

impl BillingEventLogger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn log_event(&self, builder: BillingEventBuilder) -> BillingResult<Uuid> {
        let event = builder.build();
        let id: (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO billing_events (tenant_id, event_type, data)
            VALUES ($1, $2, $3)
            RETURNING id
            "#,
        )
        .bind(event.tenant_id)
        .bind(event.event_type.as_str())
        .bind(&event.data)
        .fetch_one(&self.pool)
        .await?;

        tracing::debug!(
            tenant_id = %event.tenant_id,
            event_type = %event.event_type,
            "Billing event recorded"
        );

        Ok(id.0)
    }

    /// Fire-and-forget append. Delivery is at-least-once on the consumer
    /// side, so a lost event is logged loudly but never fails the caller.
    pub async fn emit(&self, builder: BillingEventBuilder) {
        let tenant_id = builder.event.tenant_id;
        let event_type = builder.event.event_type;
        if let Err(e) = self.log_event(builder).await {
            tracing::warn!(
                tenant_id = %tenant_id,
                event_type = %event_type,
                error = %e,
                "Failed to record billing event"
            );
        }
    }

    /// Recent events for a tenant, newest first.
    pub async fn recent_for_tenant(
        &self,
        tenant_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<BillingEventRecord>> {
        let rows = sqlx::query_as(
            r#"
            SELECT id, tenant_id, event_type, data, created_at
            FROM billing_events
            WHERE tenant_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(tenant_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_strings() {
        assert_eq!(BillingEventType::UsageLimitReached.as_str(), "usage_limit_reached");
        assert_eq!(
            BillingEventType::SubscriptionDowngradeScheduled.as_str(),
            "subscription_downgrade_scheduled"
        );
    }

    #[test]
    fn test_builder_defaults_null_data() {
        let event = BillingEventBuilder::new(Uuid::new_v4(), BillingEventType::PaymentSucceeded)
            .build();
        assert!(event.data.is_null());
    }
}
