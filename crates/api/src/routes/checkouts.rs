//! Checkout and payment endpoints

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use subflow_billing::{BillingError, BuyerInfo, CallbackPayload, CheckoutTarget};
use uuid::Uuid;

use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateCheckoutRequest {
    pub tenant_id: Uuid,
    pub plan_price_id: Option<Uuid>,
    pub addon_id: Option<Uuid>,
    pub quantity: Option<i32>,
}

impl CreateCheckoutRequest {
    fn target(&self) -> Result<CheckoutTarget, BillingError> {
        match (self.plan_price_id, self.addon_id) {
            (Some(plan_price_id), None) => Ok(CheckoutTarget::Plan { plan_price_id }),
            (None, Some(addon_id)) => Ok(CheckoutTarget::Addon {
                addon_id,
                quantity: self.quantity.unwrap_or(1),
            }),
            _ => Err(BillingError::Validation(
                "exactly one of plan_price_id or addon_id must be set".to_string(),
            )),
        }
    }
}

pub async fn create(
    State(state): State<AppState>,
    Json(request): Json<CreateCheckoutRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let target = request.target()?;
    let checkout = state.billing.checkout.create(request.tenant_id, target).await?;
    Ok(Json(serde_json::json!({ "checkout": checkout })))
}

pub async fn show(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let checkout = state.billing.checkout.load(id).await?;
    Ok(Json(serde_json::json!({ "checkout": checkout })))
}

#[derive(Debug, Deserialize)]
pub struct TokenRequestBody {
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
}

pub async fn generate_token(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<TokenRequestBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let checkout = state
        .billing
        .checkout
        .generate_token(
            id,
            BuyerInfo {
                name: body.name,
                email: body.email,
                phone: body.phone,
            },
        )
        .await?;
    Ok(Json(serde_json::json!({
        "checkout": &checkout,
        "payment_url": checkout.payment_url,
    })))
}

pub async fn cancel(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let checkout = state.billing.checkout.cancel(id).await?;
    Ok(Json(serde_json::json!({ "checkout": checkout })))
}

/// Complete a zero-amount checkout (e.g. a fully-credited downgrade)
/// without a gateway payment.
pub async fn complete_free(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let outcome = state.billing.checkout.complete_without_payment(id).await?;
    Ok(Json(serde_json::json!({
        "checkout": outcome.checkout,
        "already_processed": outcome.already_processed,
    })))
}

/// Inbound webhook from the payment gateway.
pub async fn callback(
    State(state): State<AppState>,
    Json(payload): Json<CallbackPayload>,
) -> ApiResult<Json<serde_json::Value>> {
    let outcome = state.billing.checkout.process_callback(&payload).await?;
    Ok(Json(serde_json::json!({
        "checkout": outcome.checkout,
        "payment": outcome.payment,
        "already_processed": outcome.already_processed,
    })))
}

pub async fn refund(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let result = state.billing.refund.refund_payment(id).await?;
    Ok(Json(serde_json::json!({ "refund": result })))
}
