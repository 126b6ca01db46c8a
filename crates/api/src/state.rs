//! Application state

use std::sync::Arc;

use sqlx::PgPool;
use subflow_billing::BillingService;

use crate::config::Config;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub billing: Arc<BillingService>,
}

impl AppState {
    pub fn new(pool: PgPool, _config: &Config) -> anyhow::Result<Self> {
        let billing = BillingService::from_env(pool.clone())
            .map_err(|e| anyhow::anyhow!("billing service initialization failed: {e}"))?;
        tracing::info!("Billing service initialized");

        Ok(Self {
            pool,
            billing: Arc::new(billing),
        })
    }
}
