//! Route table

pub mod admin;
pub mod checkouts;
pub mod tenants;

use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        // Checkouts and payments
        .route("/api/checkouts", post(checkouts::create))
        .route("/api/checkouts/{id}", get(checkouts::show))
        .route("/api/checkouts/{id}/token", post(checkouts::generate_token))
        .route("/api/checkouts/{id}/cancel", post(checkouts::cancel))
        .route("/api/checkouts/{id}/complete", post(checkouts::complete_free))
        .route("/api/gateway/callback", post(checkouts::callback))
        .route("/api/payments/{id}/refund", post(checkouts::refund))
        // Tenant-facing reads and usage
        .route("/api/tenants/{tenant_id}/subscription", get(tenants::subscription))
        .route(
            "/api/tenants/{tenant_id}/subscription/cancel",
            post(tenants::cancel_subscription),
        )
        .route(
            "/api/tenants/{tenant_id}/entitlements/{slug}",
            get(tenants::entitlement),
        )
        .route("/api/tenants/{tenant_id}/usage/{slug}", get(tenants::usage))
        .route(
            "/api/tenants/{tenant_id}/usage/{slug}/increment",
            post(tenants::increment_usage),
        )
        .route(
            "/api/tenants/{tenant_id}/usage/{slug}/decrement",
            post(tenants::decrement_usage),
        )
        .route("/api/tenants/{tenant_id}/events", get(tenants::events))
        // Admin
        .route("/api/admin/invariants", get(admin::run_invariants))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}
