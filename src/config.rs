//! Application configuration management.
//!
//! This module handles loading configuration from environment variables.
//! It uses the `envy` crate to deserialize environment variables into a type-safe struct.

use std::time::Duration;

use serde::Deserialize;

use crate::models::order::OwnerId;
use crate::scheduler::SchedulerIntervals;
use crate::services::lifecycle::OrderPolicy;
use crate::services::provisioning::ProvisioningSettings;

/// Application configuration loaded from environment variables.
///
/// # Environment Variables
///
/// Required:
/// - `DATABASE_URL`: PostgreSQL connection string
/// - `PROVISIONING_URL`: management URL of the key server
/// - `NOTIFY_URL`: chat gateway callback for notifications
/// - `NOTIFY_SECRET`: HMAC key used to sign notifications
/// - `GATEWAY_TOKEN_SHA256`: hex SHA-256 of the gateway's bearer token
/// - `OPERATOR_ID`: the operator's chat id
///
/// Optional (default):
/// - `SERVER_PORT` (3000)
/// - `PROVISIONING_TIMEOUT_SECS` (3), `PROVISIONING_ACCEPT_INVALID_CERTS` (false)
/// - `NOTIFY_TIMEOUT_SECS` (5)
/// - `ORDER_TTL_DAYS` (30), `PRICE_PER_KEY` (150), `MAX_KEYS_PER_OWNER` (10)
/// - `NOTIFY_BEFORE_EXPIRY_HOURS` (72)
/// - `NOTIFY_EXPIRING_INTERVAL_SECS` (30), `DEACTIVATE_EXPIRED_INTERVAL_SECS` (3600)
/// - `CONVERSATION_TTL_SECS` (86400)
/// - `PAYMENT_URL` (unset)
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database_url: String,

    #[serde(default = "default_port")]
    pub server_port: u16,

    pub provisioning_url: String,

    #[serde(default = "default_provisioning_timeout_secs")]
    pub provisioning_timeout_secs: u64,

    #[serde(default)]
    pub provisioning_accept_invalid_certs: bool,

    pub notify_url: String,

    pub notify_secret: String,

    #[serde(default = "default_notify_timeout_secs")]
    pub notify_timeout_secs: u64,

    pub gateway_token_sha256: String,

    pub operator_id: i64,

    #[serde(default = "default_order_ttl_days")]
    pub order_ttl_days: i64,

    #[serde(default = "default_price_per_key")]
    pub price_per_key: i64,

    #[serde(default = "default_max_keys_per_owner")]
    pub max_keys_per_owner: i64,

    #[serde(default = "default_notify_before_expiry_hours")]
    pub notify_before_expiry_hours: i64,

    #[serde(default = "default_notify_expiring_interval_secs")]
    pub notify_expiring_interval_secs: u64,

    #[serde(default = "default_deactivate_expired_interval_secs")]
    pub deactivate_expired_interval_secs: u64,

    #[serde(default = "default_conversation_ttl_secs")]
    pub conversation_ttl_secs: u64,

    pub payment_url: Option<String>,
}

/// Default port if SERVER_PORT environment variable is not set.
fn default_port() -> u16 {
    3000
}

fn default_provisioning_timeout_secs() -> u64 {
    3
}

fn default_notify_timeout_secs() -> u64 {
    5
}

fn default_order_ttl_days() -> i64 {
    30
}

fn default_price_per_key() -> i64 {
    150
}

fn default_max_keys_per_owner() -> i64 {
    10
}

fn default_notify_before_expiry_hours() -> i64 {
    72
}

fn default_notify_expiring_interval_secs() -> u64 {
    30
}

fn default_deactivate_expired_interval_secs() -> u64 {
    3600
}

fn default_conversation_ttl_secs() -> u64 {
    86_400
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// This method first attempts to load a `.env` file (which is optional),
    /// then reads environment variables and deserializes them into a Config struct.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Required environment variables are missing (e.g., DATABASE_URL)
    /// - Environment variable values cannot be parsed into expected types
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();

        // Field names are converted automatically: database_url -> DATABASE_URL
        envy::from_env::<Config>()
    }

    pub fn policy(&self) -> OrderPolicy {
        OrderPolicy {
            order_ttl: chrono::Duration::days(self.order_ttl_days),
            price_per_key: self.price_per_key,
            max_keys_per_owner: self.max_keys_per_owner,
            operator_id: OwnerId(self.operator_id),
            notify_before_expiry: chrono::Duration::hours(self.notify_before_expiry_hours),
            payment_url: self.payment_url.clone().filter(|url| !url.is_empty()),
        }
    }

    pub fn provisioning_settings(&self) -> ProvisioningSettings {
        ProvisioningSettings {
            timeout: Duration::from_secs(self.provisioning_timeout_secs),
            accept_invalid_certs: self.provisioning_accept_invalid_certs,
        }
    }

    pub fn scheduler_intervals(&self) -> SchedulerIntervals {
        SchedulerIntervals {
            notify_expiring: Duration::from_secs(self.notify_expiring_interval_secs),
            deactivate_expired: Duration::from_secs(self.deactivate_expired_interval_secs),
        }
    }

    pub fn notify_timeout(&self) -> Duration {
        Duration::from_secs(self.notify_timeout_secs)
    }

    pub fn conversation_ttl(&self) -> Duration {
        Duration::from_secs(self.conversation_ttl_secs)
    }
}
