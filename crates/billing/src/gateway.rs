//! Redirect/iframe payment gateway adapter
//!
//! Outbound calls (token creation, refund) are signed and time-bounded;
//! inbound callbacks are verified with an HMAC over
//! `merchant_order_id + salt + status + amount` compared in constant
//! time. The [`PaymentGateway`] trait keeps the boundary pluggable so
//! checkout and refund logic can be exercised without a live gateway.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;

use crate::config::GatewayConfig;
use crate::error::{BillingError, BillingResult};

type HmacSha256 = Hmac<Sha256>;

/// Inbound callback body as the gateway posts it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackPayload {
    pub merchant_order_id: String,
    /// Raw gateway status string; signed verbatim.
    pub status: String,
    pub amount_cents: i64,
    /// Base64 HMAC-SHA256 signature over the other fields.
    pub signature: String,
}

/// Callback reduced to what the state machine acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCallback {
    pub merchant_order_id: String,
    pub success: bool,
    pub amount_cents: i64,
}

/// Purchaser details forwarded to the gateway's hosted page.
#[derive(Debug, Clone, Serialize)]
pub struct BuyerInfo {
    pub name: String,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

/// Outbound token request for one checkout.
#[derive(Debug, Clone, Serialize)]
pub struct TokenRequest {
    pub merchant_order_id: String,
    pub amount_cents: i64,
    pub currency: String,
    pub description: String,
    pub buyer: BuyerInfo,
}

/// Successful token creation: the opaque token plus the hosted page URL
/// when the gateway returns one.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResult {
    pub token: String,
    pub payment_url: Option<String>,
}

/// Sign a callback's fields the way the gateway does.
pub fn sign_callback(
    secret: &str,
    salt: &str,
    merchant_order_id: &str,
    status: &str,
    amount_cents: i64,
) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .unwrap_or_else(|_| unreachable!("HMAC accepts keys of any length"));
    mac.update(merchant_order_id.as_bytes());
    mac.update(salt.as_bytes());
    mac.update(status.as_bytes());
    mac.update(amount_cents.to_string().as_bytes());
    BASE64.encode(mac.finalize().into_bytes())
}

/// Verify an inbound callback signature in constant time. Any decoding
/// failure counts as a mismatch.
pub fn verify_callback(secret: &str, salt: &str, payload: &CallbackPayload) -> bool {
    let expected = sign_callback(
        secret,
        salt,
        &payload.merchant_order_id,
        &payload.status,
        payload.amount_cents,
    );
    let Ok(provided) = BASE64.decode(&payload.signature) else {
        return false;
    };
    let Ok(expected) = BASE64.decode(&expected) else {
        return false;
    };
    expected.ct_eq(&provided).into()
}

/// Reduce a verified callback to the success flag the state machine
/// branches on.
pub fn parse_callback(payload: &CallbackPayload) -> ParsedCallback {
    let success = matches!(payload.status.as_str(), "success" | "paid" | "completed");
    ParsedCallback {
        merchant_order_id: payload.merchant_order_id.clone(),
        success,
        amount_cents: payload.amount_cents,
    }
}

/// Pluggable gateway boundary.
///
/// Implementations must not hold any database lock across these calls;
/// checkout code acquires row locks only after the network round trip.
pub trait PaymentGateway: Send + Sync {
    /// Create a payment token for a checkout.
    fn create_token(
        &self,
        request: &TokenRequest,
    ) -> impl std::future::Future<Output = BillingResult<TokenResult>> + Send;

    /// Refund a completed payment by its merchant order id.
    fn refund(
        &self,
        merchant_order_id: &str,
        amount_cents: i64,
    ) -> impl std::future::Future<Output = BillingResult<bool>> + Send;

    /// Constant-time signature check for an inbound callback.
    fn verify_callback(&self, payload: &CallbackPayload) -> bool;
}

#[derive(Debug, Serialize)]
struct TokenApiRequest<'a> {
    merchant_id: &'a str,
    #[serde(flatten)]
    request: &'a TokenRequest,
    signature: String,
}

#[derive(Debug, Deserialize)]
struct TokenApiResponse {
    success: bool,
    token: Option<String>,
    payment_url: Option<String>,
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct RefundApiRequest<'a> {
    merchant_id: &'a str,
    merchant_order_id: &'a str,
    amount_cents: i64,
    signature: String,
}

#[derive(Debug, Deserialize)]
struct RefundApiResponse {
    success: bool,
    error: Option<String>,
}

/// Production gateway over HTTPS with a bounded timeout and a short
/// retry on transient transport failures.
#[derive(Clone)]
pub struct HttpGateway {
    client: reqwest::Client,
    config: GatewayConfig,
}

impl HttpGateway {
    pub fn new(config: GatewayConfig) -> BillingResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| BillingError::Config(format!("gateway HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    pub fn from_env() -> BillingResult<Self> {
        Self::new(GatewayConfig::from_env()?)
    }

    fn retry_strategy() -> impl Iterator<Item = std::time::Duration> {
        ExponentialBackoff::from_millis(100).map(jitter).take(2)
    }

    async fn post_json<B: Serialize, R: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> BillingResult<R> {
        let url = format!("{}/{path}", self.config.base_url.trim_end_matches('/'));
        let response = Retry::spawn(Self::retry_strategy(), || async {
            self.client.post(&url).json(body).send().await
        })
        .await
        .map_err(|e| BillingError::Gateway(format!("request to {path} failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(BillingError::Gateway(format!(
                "gateway returned {status} for {path}"
            )));
        }
        response
            .json()
            .await
            .map_err(|e| BillingError::Gateway(format!("malformed {path} response: {e}")))
    }
}

impl PaymentGateway for HttpGateway {
    async fn create_token(&self, request: &TokenRequest) -> BillingResult<TokenResult> {
        let signature = sign_callback(
            &self.config.secret,
            &self.config.salt,
            &request.merchant_order_id,
            "token",
            request.amount_cents,
        );
        let body = TokenApiRequest {
            merchant_id: &self.config.merchant_id,
            request,
            signature,
        };

        let reply: TokenApiResponse = self.post_json("token", &body).await?;
        if !reply.success {
            return Err(BillingError::Gateway(
                reply.error.unwrap_or_else(|| "token creation declined".to_string()),
            ));
        }
        let token = reply.token.ok_or_else(|| {
            BillingError::Gateway("gateway reported success without a token".to_string())
        })?;

        tracing::debug!(
            merchant_order_id = %request.merchant_order_id,
            "Gateway token created"
        );
        Ok(TokenResult {
            token,
            payment_url: reply.payment_url,
        })
    }

    async fn refund(&self, merchant_order_id: &str, amount_cents: i64) -> BillingResult<bool> {
        let signature = sign_callback(
            &self.config.secret,
            &self.config.salt,
            merchant_order_id,
            "refund",
            amount_cents,
        );
        let body = RefundApiRequest {
            merchant_id: &self.config.merchant_id,
            merchant_order_id,
            amount_cents,
            signature,
        };

        let reply: RefundApiResponse = self.post_json("refund", &body).await?;
        if !reply.success {
            tracing::warn!(
                merchant_order_id = %merchant_order_id,
                error = reply.error.as_deref().unwrap_or("unspecified"),
                "Gateway declined refund"
            );
        }
        Ok(reply.success)
    }

    fn verify_callback(&self, payload: &CallbackPayload) -> bool {
        verify_callback(&self.config.secret, &self.config.salt, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-secret";
    const SALT: &str = "test-salt";

    fn signed_payload(status: &str, amount_cents: i64) -> CallbackPayload {
        CallbackPayload {
            merchant_order_id: "sf-abc123".to_string(),
            status: status.to_string(),
            amount_cents,
            signature: sign_callback(SECRET, SALT, "sf-abc123", status, amount_cents),
        }
    }

    fn test_config(base_url: String) -> GatewayConfig {
        GatewayConfig {
            base_url,
            merchant_id: "m-1".to_string(),
            secret: SECRET.to_string(),
            salt: SALT.to_string(),
            timeout_secs: 5,
        }
    }

    #[test]
    fn test_valid_signature_verifies() {
        let payload = signed_payload("success", 50_000);
        assert!(verify_callback(SECRET, SALT, &payload));
    }

    #[test]
    fn test_tampered_status_rejected() {
        // payload signed for "failed", attacker flips it to "success"
        let mut payload = signed_payload("failed", 50_000);
        payload.status = "success".to_string();
        assert!(!verify_callback(SECRET, SALT, &payload));
    }

    #[test]
    fn test_tampered_amount_rejected() {
        let mut payload = signed_payload("success", 50_000);
        payload.amount_cents = 1;
        assert!(!verify_callback(SECRET, SALT, &payload));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let payload = signed_payload("success", 50_000);
        assert!(!verify_callback("other-secret", SALT, &payload));
    }

    #[test]
    fn test_garbage_signature_rejected() {
        let mut payload = signed_payload("success", 50_000);
        payload.signature = "not base64 !!!".to_string();
        assert!(!verify_callback(SECRET, SALT, &payload));
    }

    #[test]
    fn test_parse_callback_success_statuses() {
        assert!(parse_callback(&signed_payload("success", 100)).success);
        assert!(parse_callback(&signed_payload("paid", 100)).success);
        assert!(!parse_callback(&signed_payload("failed", 100)).success);
        assert!(!parse_callback(&signed_payload("declined", 100)).success);
    }

    #[tokio::test]
    async fn test_create_token_success() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"success":true,"token":"tok_123","payment_url":"https://pay.example/p/tok_123","error":null}"#)
            .create_async()
            .await;

        let gateway = HttpGateway::new(test_config(server.url())).unwrap();
        let result = gateway
            .create_token(&TokenRequest {
                merchant_order_id: "sf-abc123".to_string(),
                amount_cents: 50_000,
                currency: "USD".to_string(),
                description: "Pro plan".to_string(),
                buyer: BuyerInfo {
                    name: "Ada".to_string(),
                    email: "ada@example.com".to_string(),
                    phone: None,
                },
            })
            .await
            .unwrap();

        assert_eq!(result.token, "tok_123");
        assert!(result.payment_url.is_some());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_create_token_declined_surfaces_gateway_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"success":false,"token":null,"payment_url":null,"error":"card region blocked"}"#)
            .create_async()
            .await;

        let gateway = HttpGateway::new(test_config(server.url())).unwrap();
        let err = gateway
            .create_token(&TokenRequest {
                merchant_order_id: "sf-abc123".to_string(),
                amount_cents: 50_000,
                currency: "USD".to_string(),
                description: "Pro plan".to_string(),
                buyer: BuyerInfo {
                    name: "Ada".to_string(),
                    email: "ada@example.com".to_string(),
                    phone: None,
                },
            })
            .await
            .unwrap_err();

        assert!(matches!(err, BillingError::Gateway(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_refund_round_trip() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/refund")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"success":true,"error":null}"#)
            .create_async()
            .await;

        let gateway = HttpGateway::new(test_config(server.url())).unwrap();
        assert!(gateway.refund("sf-abc123", 50_000).await.unwrap());
    }
}
