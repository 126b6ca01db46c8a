//! Environment-driven configuration
//!
//! Required gateway credentials fail fast at startup; tunables fall back
//! to documented defaults.

use subflow_shared::ProrationPolicy;

use crate::error::{BillingError, BillingResult};

/// Credentials and endpoint for the redirect/iframe payment gateway.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Base URL of the gateway API, e.g. `https://pay.example.com/api`.
    pub base_url: String,
    pub merchant_id: String,
    /// HMAC secret shared with the gateway.
    pub secret: String,
    /// Salt concatenated into the callback signature.
    pub salt: String,
    /// Bound on every outbound gateway call.
    pub timeout_secs: u64,
}

impl GatewayConfig {
    pub fn from_env() -> BillingResult<Self> {
        Ok(Self {
            base_url: require_env("GATEWAY_BASE_URL")?,
            merchant_id: require_env("GATEWAY_MERCHANT_ID")?,
            secret: require_env("GATEWAY_SECRET")?,
            salt: require_env("GATEWAY_SALT")?,
            timeout_secs: optional_env("GATEWAY_TIMEOUT_SECS", 10)?,
        })
    }
}

/// Tunables for checkout sessions, tax, and proration defaults.
#[derive(Debug, Clone)]
pub struct BillingConfig {
    /// Minutes before a pending checkout session expires.
    pub checkout_session_timeout_minutes: i64,
    /// Flat tax applied to add-on checkouts, in basis points (1% = 100).
    pub tax_rate_bp: i64,
    /// Default policy when the plan does not configure one.
    pub default_upgrade_policy: ProrationPolicy,
    pub default_downgrade_policy: ProrationPolicy,
    /// How many days ahead trial/expiry reminders look.
    pub reminder_days_ahead: i64,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            checkout_session_timeout_minutes: 30,
            tax_rate_bp: 0,
            default_upgrade_policy: ProrationPolicy::Immediate,
            default_downgrade_policy: ProrationPolicy::EndOfPeriod,
            reminder_days_ahead: 3,
        }
    }
}

impl BillingConfig {
    pub fn from_env() -> BillingResult<Self> {
        let defaults = Self::default();
        Ok(Self {
            checkout_session_timeout_minutes: optional_env(
                "CHECKOUT_SESSION_TIMEOUT_MINUTES",
                defaults.checkout_session_timeout_minutes,
            )?,
            tax_rate_bp: optional_env("TAX_RATE_BASIS_POINTS", defaults.tax_rate_bp)?,
            default_upgrade_policy: policy_env(
                "DEFAULT_UPGRADE_PRORATION_POLICY",
                defaults.default_upgrade_policy,
            )?,
            default_downgrade_policy: policy_env(
                "DEFAULT_DOWNGRADE_PRORATION_POLICY",
                defaults.default_downgrade_policy,
            )?,
            reminder_days_ahead: optional_env("REMINDER_DAYS_AHEAD", defaults.reminder_days_ahead)?,
        })
    }
}

fn require_env(name: &str) -> BillingResult<String> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| BillingError::Config(format!("{name} must be set")))
}

fn optional_env<T: std::str::FromStr>(name: &str, default: T) -> BillingResult<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| BillingError::Config(format!("{name} has an invalid value '{raw}'"))),
        Err(_) => Ok(default),
    }
}

fn policy_env(name: &str, default: ProrationPolicy) -> BillingResult<ProrationPolicy> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| BillingError::Config(format!("{name} has an invalid value '{raw}'"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_billing_config_defaults() {
        let config = BillingConfig::default();
        assert_eq!(config.checkout_session_timeout_minutes, 30);
        assert_eq!(config.tax_rate_bp, 0);
        assert_eq!(config.default_upgrade_policy, ProrationPolicy::Immediate);
        assert_eq!(config.default_downgrade_policy, ProrationPolicy::EndOfPeriod);
    }
}
