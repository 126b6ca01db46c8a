//! Tenant-facing subscription, entitlement, and usage endpoints

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::ApiResult;
use crate::state::AppState;

/// Current subscription plus its freshly derived status. The stored
/// status column is only a cache, so reads go through the derivation
/// and write the cache back when it drifted.
pub async fn subscription(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let Some(sub) = state.billing.subscriptions.current_for_tenant(tenant_id).await? else {
        return Ok(Json(serde_json::json!({ "subscription": null })));
    };
    let status = state.billing.subscriptions.refresh_status_cache(&sub).await?;
    Ok(Json(serde_json::json!({
        "subscription": sub,
        "status": status.as_str(),
        "grants_access": status.grants_access(),
    })))
}

pub async fn cancel_subscription(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let sub = state.billing.subscriptions.cancel_current(tenant_id).await?;
    Ok(Json(serde_json::json!({ "subscription": sub })))
}

pub async fn entitlement(
    State(state): State<AppState>,
    Path((tenant_id, slug)): Path<(Uuid, String)>,
) -> ApiResult<Json<serde_json::Value>> {
    let limit = state.billing.entitlements.resolve_limit(tenant_id, &slug).await?;
    let access = state.billing.entitlements.resolve_access(tenant_id, &slug).await?;
    Ok(Json(serde_json::json!({
        "feature": slug,
        "limit": limit,
        "access": access,
    })))
}

pub async fn usage(
    State(state): State<AppState>,
    Path((tenant_id, slug)): Path<(Uuid, String)>,
) -> ApiResult<Json<serde_json::Value>> {
    let snapshot = state.billing.usage.current_usage(tenant_id, &slug).await?;
    Ok(Json(serde_json::json!({ "usage": snapshot })))
}

/// Optional delta for usage mutations; omitting `amount` means 1.
#[derive(Debug, Deserialize)]
pub struct UsageDelta {
    pub amount: Option<i64>,
}

impl UsageDelta {
    fn amount(&self) -> i64 {
        self.amount.unwrap_or(1)
    }
}

pub async fn increment_usage(
    State(state): State<AppState>,
    Path((tenant_id, slug)): Path<(Uuid, String)>,
    Json(delta): Json<UsageDelta>,
) -> ApiResult<Json<serde_json::Value>> {
    let snapshot = state
        .billing
        .usage
        .increment(tenant_id, &slug, delta.amount())
        .await?;
    Ok(Json(serde_json::json!({ "usage": snapshot })))
}

pub async fn decrement_usage(
    State(state): State<AppState>,
    Path((tenant_id, slug)): Path<(Uuid, String)>,
    Json(delta): Json<UsageDelta>,
) -> ApiResult<Json<serde_json::Value>> {
    let snapshot = state
        .billing
        .usage
        .decrement(tenant_id, &slug, delta.amount())
        .await?;
    Ok(Json(serde_json::json!({ "usage": snapshot })))
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub limit: Option<i64>,
}

pub async fn events(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let limit = query.limit.unwrap_or(50).clamp(1, 200);
    let events = state.billing.events.recent_for_tenant(tenant_id, limit).await?;
    Ok(Json(serde_json::json!({ "events": events })))
}
