//! Usage accounting for metered and limited features
//!
//! Consumption rows are created lazily on first increment and reset on
//! cycle boundaries derived from the feature's reset period. Increments
//! clamp at a finite limit; crossing the limit is surfaced in the
//! returned snapshot and as a `usage_limit_reached` event so callers can
//! raise the signal outward.

use std::sync::Arc;

use serde::Serialize;
use sqlx::PgPool;
use subflow_shared::{money::percentage_of_limit, Clock, ResetPeriod};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::entitlement::{EffectiveLimit, EntitlementService, FeatureRow};
use crate::error::{BillingError, BillingResult};
use crate::events::{BillingEventBuilder, BillingEventLogger, BillingEventType};

/// Point-in-time view of a tenant's consumption for one feature.
#[derive(Debug, Clone, Serialize)]
pub struct UsageSnapshot {
    pub feature: String,
    pub used: i64,
    pub limit: EffectiveLimit,
    /// `None` when the limit is unlimited; never negative otherwise.
    pub remaining: Option<i64>,
    /// Share of a finite limit consumed, capped at 100.
    pub percentage: u8,
    pub reset_at: Option<OffsetDateTime>,
    /// Set when a finite limit has been reached or exceeded.
    pub limit_reached: bool,
}

/// Assemble a snapshot from raw numbers. Pure.
pub fn snapshot(
    feature: &str,
    used: i64,
    limit: EffectiveLimit,
    reset_at: Option<OffsetDateTime>,
) -> UsageSnapshot {
    let (remaining, percentage, limit_reached) = match limit.finite() {
        Some(l) => (
            Some((l - used).max(0)),
            percentage_of_limit(used, l),
            used >= l,
        ),
        None => (None, 0, false),
    };
    UsageSnapshot {
        feature: feature.to_string(),
        used,
        limit,
        remaining,
        percentage,
        reset_at,
        limit_reached,
    }
}

/// Clamped post-increment consumption against a limit.
///
/// Usage never exceeds a finite limit and an already-over row never
/// shrinks (the limit may have been lowered under it).
pub fn clamp_increment(used: i64, amount: i64, limit: EffectiveLimit) -> i64 {
    match limit.finite() {
        Some(l) if used >= l => used,
        Some(l) => (used + amount).min(l),
        None => used.saturating_add(amount),
    }
}

#[derive(Debug, sqlx::FromRow)]
struct UsageRow {
    used: i64,
    cycle_ends_at: Option<OffsetDateTime>,
}

#[derive(Debug, sqlx::FromRow)]
struct ExpiredCycleRow {
    id: Uuid,
    tenant_id: Uuid,
    used: i64,
    slug: String,
    reset_period: String,
}

/// Tracks consumption against entitlements.
pub struct UsageLedger {
    pool: PgPool,
    clock: Arc<dyn Clock>,
    entitlements: EntitlementService,
    event_logger: BillingEventLogger,
}

impl UsageLedger {
    pub fn new(pool: PgPool, clock: Arc<dyn Clock>) -> Self {
        let entitlements = EntitlementService::new(pool.clone(), clock.clone());
        let event_logger = BillingEventLogger::new(pool.clone());
        Self {
            pool,
            clock,
            entitlements,
            event_logger,
        }
    }

    /// Consume `amount` units of a feature. Returns the post-increment
    /// snapshot; `limit_reached` tells the caller to raise the signal.
    pub async fn increment(
        &self,
        tenant_id: Uuid,
        slug: &str,
        amount: i64,
    ) -> BillingResult<UsageSnapshot> {
        let (feature, limit) = self.consumable_feature(tenant_id, slug, amount).await?;
        let reset_period = feature.reset_period()?;
        let now = self.clock.now();

        let mut tx = self.pool.begin().await?;
        let (row, was_reset, reset_from) =
            lock_row_with_reset(&mut tx, tenant_id, &feature, reset_period, now).await?;

        let new_used = clamp_increment(row.used, amount, limit);
        let crossed = match limit.finite() {
            Some(l) => row.used < l && new_used >= l,
            None => false,
        };

        sqlx::query(
            "UPDATE tenant_usage SET used = $1, updated_at = NOW() WHERE tenant_id = $2 AND feature_id = $3",
        )
        .bind(new_used)
        .bind(tenant_id)
        .bind(feature.id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        if was_reset {
            self.emit_reset(tenant_id, &feature.slug, reset_from).await;
        }
        if crossed {
            self.event_logger
                .emit(
                    BillingEventBuilder::new(tenant_id, BillingEventType::UsageLimitReached).data(
                        serde_json::json!({
                            "feature": feature.slug,
                            "used": new_used,
                            "limit": limit.finite(),
                        }),
                    ),
                )
                .await;
            tracing::info!(
                tenant_id = %tenant_id,
                feature = %feature.slug,
                used = new_used,
                "Usage limit reached"
            );
        }

        Ok(snapshot(&feature.slug, new_used, limit, row.cycle_ends_at))
    }

    /// Release `amount` units. Floors at zero; never emits events.
    pub async fn decrement(
        &self,
        tenant_id: Uuid,
        slug: &str,
        amount: i64,
    ) -> BillingResult<UsageSnapshot> {
        let (feature, limit) = self.consumable_feature(tenant_id, slug, amount).await?;
        let reset_period = feature.reset_period()?;
        let now = self.clock.now();

        let mut tx = self.pool.begin().await?;
        let (row, was_reset, reset_from) =
            lock_row_with_reset(&mut tx, tenant_id, &feature, reset_period, now).await?;

        let new_used = (row.used - amount).max(0);
        sqlx::query(
            "UPDATE tenant_usage SET used = $1, updated_at = NOW() WHERE tenant_id = $2 AND feature_id = $3",
        )
        .bind(new_used)
        .bind(tenant_id)
        .bind(feature.id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        if was_reset {
            self.emit_reset(tenant_id, &feature.slug, reset_from).await;
        }

        Ok(snapshot(&feature.slug, new_used, limit, row.cycle_ends_at))
    }

    /// Read-only view. An elapsed cycle is reported as already reset
    /// (used 0, next boundary) without writing; the sweep persists it.
    pub async fn current_usage(&self, tenant_id: Uuid, slug: &str) -> BillingResult<UsageSnapshot> {
        let feature = self.entitlements.feature_by_slug(slug).await?;
        let limit = self.entitlements.resolve_limit_for(tenant_id, &feature).await?;
        let reset_period = feature.reset_period()?;
        let now = self.clock.now();

        let row: Option<UsageRow> = sqlx::query_as(
            "SELECT used, cycle_ends_at FROM tenant_usage WHERE tenant_id = $1 AND feature_id = $2",
        )
        .bind(tenant_id)
        .bind(feature.id)
        .fetch_optional(&self.pool)
        .await?;

        let (used, reset_at) = match row {
            Some(row) => match row.cycle_ends_at {
                Some(cycle_end) if cycle_end <= now => (0, reset_period.next_boundary(now)),
                other => (row.used, other),
            },
            None => (0, reset_period.next_boundary(now)),
        };

        Ok(snapshot(&feature.slug, used, limit, reset_at))
    }

    /// Reset every ledger row whose cycle has elapsed, advancing the
    /// boundary from the feature's reset period. Resets of already-zero
    /// usage are silent.
    pub async fn reset_expired_cycles(&self) -> BillingResult<usize> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;

        let expired: Vec<ExpiredCycleRow> = sqlx::query_as(
            r#"
            SELECT tu.id, tu.tenant_id, tu.used, f.slug, f.reset_period
            FROM tenant_usage tu
            JOIN features f ON f.id = tu.feature_id
            WHERE tu.cycle_ends_at IS NOT NULL
              AND tu.cycle_ends_at <= $1
            FOR UPDATE OF tu SKIP LOCKED
            "#,
        )
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;

        let mut events = Vec::new();
        for row in &expired {
            let reset_period: ResetPeriod = row.reset_period.parse()?;
            sqlx::query(
                "UPDATE tenant_usage SET used = 0, cycle_ends_at = $1, updated_at = NOW() WHERE id = $2",
            )
            .bind(reset_period.next_boundary(now))
            .bind(row.id)
            .execute(&mut *tx)
            .await?;

            if row.used > 0 {
                events.push((row.tenant_id, row.slug.clone(), row.used));
            }
        }
        tx.commit().await?;

        let count = expired.len();
        for (tenant_id, slug, used) in events {
            self.emit_reset(tenant_id, &slug, used).await;
        }
        if count > 0 {
            tracing::info!(reset = count, "Usage cycle reset sweep complete");
        }
        Ok(count)
    }

    async fn consumable_feature(
        &self,
        tenant_id: Uuid,
        slug: &str,
        amount: i64,
    ) -> BillingResult<(FeatureRow, EffectiveLimit)> {
        if amount <= 0 {
            return Err(BillingError::Validation(format!(
                "usage amount must be positive, got {amount}"
            )));
        }
        let feature = self.entitlements.feature_by_slug(slug).await?;
        if !feature.feature_type()?.is_consumable() {
            return Err(BillingError::Validation(format!(
                "feature '{slug}' is not a metered or limited feature"
            )));
        }
        let limit = self.entitlements.resolve_limit_for(tenant_id, &feature).await?;
        if !limit.is_available() {
            return Err(BillingError::Validation(format!(
                "feature '{slug}' is not available to tenant {tenant_id}"
            )));
        }
        Ok((feature, limit))
    }

    async fn emit_reset(&self, tenant_id: Uuid, slug: &str, previous_used: i64) {
        self.event_logger
            .emit(
                BillingEventBuilder::new(tenant_id, BillingEventType::UsageReset).data(
                    serde_json::json!({
                        "feature": slug,
                        "previous_used": previous_used,
                    }),
                ),
            )
            .await;
    }
}

/// Lock the ledger row (creating it lazily), applying an in-row cycle
/// reset when the boundary has passed. Returns the row as it stands
/// after the reset, whether a non-silent reset happened, and the
/// pre-reset usage.
async fn lock_row_with_reset(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    tenant_id: Uuid,
    feature: &FeatureRow,
    reset_period: ResetPeriod,
    now: OffsetDateTime,
) -> BillingResult<(UsageRow, bool, i64)> {
    sqlx::query(
        r#"
        INSERT INTO tenant_usage (tenant_id, feature_id, used, cycle_ends_at)
        VALUES ($1, $2, 0, $3)
        ON CONFLICT (tenant_id, feature_id) DO NOTHING
        "#,
    )
    .bind(tenant_id)
    .bind(feature.id)
    .bind(reset_period.next_boundary(now))
    .execute(&mut **tx)
    .await?;

    let row: UsageRow = sqlx::query_as(
        r#"
        SELECT used, cycle_ends_at
        FROM tenant_usage
        WHERE tenant_id = $1 AND feature_id = $2
        FOR UPDATE
        "#,
    )
    .bind(tenant_id)
    .bind(feature.id)
    .fetch_one(&mut **tx)
    .await?;

    match row.cycle_ends_at {
        Some(cycle_end) if cycle_end <= now => {
            let next = reset_period.next_boundary(now);
            sqlx::query(
                r#"
                UPDATE tenant_usage SET used = 0, cycle_ends_at = $1, updated_at = NOW()
                WHERE tenant_id = $2 AND feature_id = $3
                "#,
            )
            .bind(next)
            .bind(tenant_id)
            .bind(feature.id)
            .execute(&mut **tx)
            .await?;

            let pre_used = row.used;
            Ok((
                UsageRow {
                    used: 0,
                    cycle_ends_at: next,
                },
                pre_used > 0,
                pre_used,
            ))
        }
        _ => Ok((row, false, 0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_increment_stops_at_limit() {
        // used 9 of 10, increment by 2: lands exactly on 10, never 11
        assert_eq!(clamp_increment(9, 2, EffectiveLimit::Limited(10)), 10);
    }

    #[test]
    fn test_clamp_increment_below_limit() {
        assert_eq!(clamp_increment(3, 2, EffectiveLimit::Limited(10)), 5);
    }

    #[test]
    fn test_clamp_increment_already_over_does_not_shrink() {
        // limit was lowered under existing usage; the row holds
        assert_eq!(clamp_increment(15, 2, EffectiveLimit::Limited(10)), 15);
    }

    #[test]
    fn test_clamp_increment_unlimited_accumulates() {
        assert_eq!(clamp_increment(1_000, 500, EffectiveLimit::Unlimited), 1_500);
    }

    #[test]
    fn test_snapshot_limit_reached_and_remaining() {
        let s = snapshot("api_calls", 10, EffectiveLimit::Limited(10), None);
        assert!(s.limit_reached);
        assert_eq!(s.remaining, Some(0));
        assert_eq!(s.percentage, 100);
    }

    #[test]
    fn test_snapshot_remaining_never_negative() {
        let s = snapshot("api_calls", 15, EffectiveLimit::Limited(10), None);
        assert_eq!(s.remaining, Some(0));
        assert_eq!(s.percentage, 100, "capped");
    }

    #[test]
    fn test_snapshot_partial_usage() {
        let s = snapshot("api_calls", 5, EffectiveLimit::Limited(10), None);
        assert!(!s.limit_reached);
        assert_eq!(s.remaining, Some(5));
        assert_eq!(s.percentage, 50);
    }

    #[test]
    fn test_snapshot_zero_limit_percentage_is_zero() {
        let s = snapshot("api_calls", 0, EffectiveLimit::Limited(0), None);
        assert_eq!(s.percentage, 0, "divide-by-zero avoided");
        assert!(s.limit_reached);
    }

    #[test]
    fn test_snapshot_unlimited_is_unbounded() {
        let s = snapshot("api_calls", 1_000_000, EffectiveLimit::Unlimited, None);
        assert_eq!(s.remaining, None);
        assert!(!s.limit_reached);
        assert_eq!(s.percentage, 0);
    }
}
