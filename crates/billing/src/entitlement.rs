//! Feature entitlement resolution
//!
//! Answers "what does this tenant get for this feature right now?" from
//! three layers, first match wins for the baseline:
//!
//! 1. tenant override — taken verbatim, no add-on math
//! 2. current subscription's plan value — missing means unavailable,
//!    which is distinct from zero
//! 3. active, non-expired add-ons folded into the plan value
//!
//! The fold itself is pure so the precedence rules are testable without
//! a database.

use std::sync::Arc;

use serde::Serialize;
use sqlx::PgPool;
use subflow_shared::{AddonType, Clock, FeatureType, FeatureValue, ResetPeriod};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Effective limit for a tenant/feature pair.
///
/// `Unavailable` means the feature is not part of the tenant's plan at
/// all; callers must not treat it as a zero limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum EffectiveLimit {
    Unavailable,
    Unlimited,
    Limited(i64),
}

impl EffectiveLimit {
    pub fn is_available(&self) -> bool {
        !matches!(self, EffectiveLimit::Unavailable)
    }

    /// Finite limit value, if any.
    pub fn finite(&self) -> Option<i64> {
        match self {
            EffectiveLimit::Limited(n) => Some(*n),
            _ => None,
        }
    }
}

/// An active add-on grant tied to a feature, already joined with its
/// purchase quantity.
#[derive(Debug, Clone, Copy)]
pub struct AddonGrant {
    pub addon_type: AddonType,
    /// Per-unit contribution for increment add-ons.
    pub value: i64,
    pub quantity: i64,
}

/// Fold active add-ons into a plan baseline value.
///
/// An `unlimited` add-on short-circuits regardless of what follows;
/// `increment` add-ons contribute `value * quantity`; `boolean` add-ons
/// do not participate in limit resolution.
pub fn fold_addons(plan_value: FeatureValue, addons: &[AddonGrant]) -> EffectiveLimit {
    let FeatureValue::Number(base) = plan_value else {
        return EffectiveLimit::Unlimited;
    };

    let mut total = base;
    for addon in addons {
        match addon.addon_type {
            AddonType::Unlimited => return EffectiveLimit::Unlimited,
            AddonType::Increment => {
                total = total.saturating_add(addon.value.saturating_mul(addon.quantity));
            }
            AddonType::Boolean => {}
        }
    }
    EffectiveLimit::Limited(total)
}

/// Fold add-ons into a boolean access baseline: any boolean or unlimited
/// grant turns access on.
pub fn fold_access(plan_access: bool, addons: &[AddonGrant]) -> bool {
    plan_access
        || addons
            .iter()
            .any(|a| matches!(a.addon_type, AddonType::Boolean | AddonType::Unlimited))
}

/// Catalog feature row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FeatureRow {
    pub id: Uuid,
    pub slug: String,
    pub feature_type: String,
    pub reset_period: String,
}

impl FeatureRow {
    pub fn feature_type(&self) -> BillingResult<FeatureType> {
        Ok(self.feature_type.parse()?)
    }

    pub fn reset_period(&self) -> BillingResult<ResetPeriod> {
        Ok(self.reset_period.parse()?)
    }
}

#[derive(Debug, sqlx::FromRow)]
struct AddonGrantRow {
    addon_type: String,
    value: String,
    quantity: i32,
}

/// Resolves effective limits and access for tenant/feature pairs.
pub struct EntitlementService {
    pool: PgPool,
    clock: Arc<dyn Clock>,
}

impl EntitlementService {
    pub fn new(pool: PgPool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    pub async fn feature_by_slug(&self, slug: &str) -> BillingResult<FeatureRow> {
        sqlx::query_as(
            "SELECT id, slug, feature_type, reset_period FROM features WHERE slug = $1",
        )
        .bind(slug)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| BillingError::NotFound(format!("feature '{slug}'")))
    }

    /// Effective numeric limit for a tenant and feature.
    pub async fn resolve_limit(&self, tenant_id: Uuid, slug: &str) -> BillingResult<EffectiveLimit> {
        let feature = self.feature_by_slug(slug).await?;
        self.resolve_limit_for(tenant_id, &feature).await
    }

    /// As [`resolve_limit`](Self::resolve_limit), with the feature row
    /// already loaded (the usage ledger path).
    pub async fn resolve_limit_for(
        &self,
        tenant_id: Uuid,
        feature: &FeatureRow,
    ) -> BillingResult<EffectiveLimit> {
        // 1. Tenant override wins outright; no add-on math applies.
        if let Some(value) = self.override_value(tenant_id, feature.id).await? {
            return Ok(match value {
                FeatureValue::Unlimited => EffectiveLimit::Unlimited,
                FeatureValue::Number(n) => EffectiveLimit::Limited(n),
            });
        }

        // 2. Plan baseline; absent means the feature is unavailable.
        let Some(plan_value) = self.plan_value(tenant_id, feature.id).await? else {
            return Ok(EffectiveLimit::Unavailable);
        };

        // 3. Active add-ons fold into the baseline.
        let addons = self.active_addon_grants(tenant_id, feature.id).await?;
        Ok(fold_addons(plan_value, &addons))
    }

    /// Effective boolean access for a tenant and feature.
    pub async fn resolve_access(&self, tenant_id: Uuid, slug: &str) -> BillingResult<bool> {
        let feature = self.feature_by_slug(slug).await?;

        if let Some(value) = self.override_value(tenant_id, feature.id).await? {
            return Ok(value.as_bool());
        }

        let plan_access = self
            .plan_value(tenant_id, feature.id)
            .await?
            .map(|v| v.as_bool())
            .unwrap_or(false);
        let addons = self.active_addon_grants(tenant_id, feature.id).await?;
        Ok(fold_access(plan_access, &addons))
    }

    async fn override_value(
        &self,
        tenant_id: Uuid,
        feature_id: Uuid,
    ) -> BillingResult<Option<FeatureValue>> {
        let raw: Option<(String,)> = sqlx::query_as(
            "SELECT value FROM tenant_features WHERE tenant_id = $1 AND feature_id = $2",
        )
        .bind(tenant_id)
        .bind(feature_id)
        .fetch_optional(&self.pool)
        .await?;

        raw.map(|(value,)| {
            FeatureValue::parse(&value).ok_or_else(|| {
                BillingError::Invariant(format!(
                    "tenant {tenant_id} has unparseable override '{value}' for feature {feature_id}"
                ))
            })
        })
        .transpose()
    }

    /// Plan value via the tenant's current subscription. `None` when the
    /// tenant has no subscription or the plan has no association for this
    /// feature.
    async fn plan_value(
        &self,
        tenant_id: Uuid,
        feature_id: Uuid,
    ) -> BillingResult<Option<FeatureValue>> {
        let raw: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT pf.value
            FROM subscriptions s
            JOIN plan_prices pp ON pp.id = s.plan_price_id
            JOIN plan_features pf ON pf.plan_id = pp.plan_id AND pf.feature_id = $2
            WHERE s.tenant_id = $1
            ORDER BY s.created_at DESC
            LIMIT 1
            "#,
        )
        .bind(tenant_id)
        .bind(feature_id)
        .fetch_optional(&self.pool)
        .await?;

        raw.map(|(value,)| {
            FeatureValue::parse(&value).ok_or_else(|| {
                BillingError::Invariant(format!(
                    "plan carries unparseable value '{value}' for feature {feature_id}"
                ))
            })
        })
        .transpose()
    }

    async fn active_addon_grants(
        &self,
        tenant_id: Uuid,
        feature_id: Uuid,
    ) -> BillingResult<Vec<AddonGrant>> {
        let now = self.clock.now();
        let rows: Vec<AddonGrantRow> = sqlx::query_as(
            r#"
            SELECT a.addon_type, a.value, ta.quantity
            FROM tenant_addons ta
            JOIN addons a ON a.id = ta.addon_id
            WHERE ta.tenant_id = $1
              AND a.feature_id = $2
              AND ta.is_active = TRUE
              AND (ta.expires_at IS NULL OR ta.expires_at > $3)
            "#,
        )
        .bind(tenant_id)
        .bind(feature_id)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let addon_type: AddonType = row.addon_type.parse()?;
                let value = match FeatureValue::parse(&row.value) {
                    Some(FeatureValue::Number(n)) => n,
                    // Unlimited add-ons never read their value field.
                    Some(FeatureValue::Unlimited) => 0,
                    None => {
                        return Err(BillingError::Invariant(format!(
                            "add-on carries unparseable value '{}'",
                            row.value
                        )))
                    }
                };
                Ok(AddonGrant {
                    addon_type,
                    value,
                    quantity: row.quantity.max(0) as i64,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grant(addon_type: AddonType, value: i64, quantity: i64) -> AddonGrant {
        AddonGrant {
            addon_type,
            value,
            quantity,
        }
    }

    #[test]
    fn test_fold_increment_addons_onto_plan_limit() {
        // plan limit 5 + increment add-on of 10 x quantity 2 = 25
        let limit = fold_addons(
            FeatureValue::Number(5),
            &[grant(AddonType::Increment, 10, 2)],
        );
        assert_eq!(limit, EffectiveLimit::Limited(25));
    }

    #[test]
    fn test_fold_multiple_increments_accumulate() {
        let limit = fold_addons(
            FeatureValue::Number(5),
            &[
                grant(AddonType::Increment, 10, 1),
                grant(AddonType::Increment, 3, 4),
            ],
        );
        assert_eq!(limit, EffectiveLimit::Limited(27));
    }

    #[test]
    fn test_fold_unlimited_addon_short_circuits() {
        let limit = fold_addons(
            FeatureValue::Number(5),
            &[
                grant(AddonType::Unlimited, 0, 1),
                grant(AddonType::Increment, 10, 2),
            ],
        );
        assert_eq!(limit, EffectiveLimit::Unlimited);
    }

    #[test]
    fn test_fold_unlimited_plan_value_stays_unlimited() {
        let limit = fold_addons(FeatureValue::Unlimited, &[grant(AddonType::Increment, 10, 2)]);
        assert_eq!(limit, EffectiveLimit::Unlimited);
    }

    #[test]
    fn test_fold_boolean_addons_ignored_for_limits() {
        let limit = fold_addons(FeatureValue::Number(5), &[grant(AddonType::Boolean, 1, 3)]);
        assert_eq!(limit, EffectiveLimit::Limited(5));
    }

    #[test]
    fn test_fold_no_addons_is_plan_value() {
        assert_eq!(fold_addons(FeatureValue::Number(0), &[]), EffectiveLimit::Limited(0));
    }

    #[test]
    fn test_fold_access_or_semantics() {
        assert!(fold_access(true, &[]));
        assert!(!fold_access(false, &[]));
        assert!(fold_access(false, &[grant(AddonType::Boolean, 1, 1)]));
        assert!(fold_access(false, &[grant(AddonType::Unlimited, 0, 1)]));
        // increment add-ons do not grant boolean access
        assert!(!fold_access(false, &[grant(AddonType::Increment, 10, 2)]));
    }

    #[test]
    fn test_effective_limit_helpers() {
        assert!(!EffectiveLimit::Unavailable.is_available());
        assert!(EffectiveLimit::Unlimited.is_available());
        assert_eq!(EffectiveLimit::Limited(7).finite(), Some(7));
        assert_eq!(EffectiveLimit::Unlimited.finite(), None);
    }
}
