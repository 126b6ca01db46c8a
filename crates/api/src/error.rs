//! HTTP error mapping

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use subflow_billing::BillingError;

/// Wrapper giving [`BillingError`] an HTTP representation.
pub struct ApiError(pub BillingError);

pub type ApiResult<T> = Result<T, ApiError>;

impl From<BillingError> for ApiError {
    fn from(e: BillingError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self.0 {
            BillingError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            BillingError::SignatureInvalid => {
                (StatusCode::UNAUTHORIZED, "invalid signature".to_string())
            }
            BillingError::NotFound(what) => (StatusCode::NOT_FOUND, format!("{what} not found")),
            BillingError::MissingSubscription(_) => (StatusCode::CONFLICT, self.0.to_string()),
            BillingError::Gateway(_) => (StatusCode::BAD_GATEWAY, self.0.to_string()),
            // Internal failures get a generic body; details go to the log.
            BillingError::Invariant(_) | BillingError::Config(_) | BillingError::Database(_) => {
                tracing::error!(error = %self.0, "Internal error serving request");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error".to_string(),
                )
            }
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}
