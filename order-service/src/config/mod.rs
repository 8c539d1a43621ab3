//! Configuration module for order-service.

use crate::services::pricing::{FREE_SHIPPING_THRESHOLD, STANDARD_SHIPPING_FEE};
use dotenvy::dotenv;
use secrecy::Secret;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct OrderConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub checkout: CheckoutConfig,
    pub webhook: WebhookConfig,
    pub notifications: NotificationSettings,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct CheckoutConfig {
    pub order_number_prefix: String,
    /// Fixed UTC offset in which the order-number day rolls over.
    pub timezone_offset_hours: i32,
    pub free_shipping_threshold: i64,
    pub standard_shipping_fee: i64,
}

impl Default for CheckoutConfig {
    fn default() -> Self {
        Self {
            order_number_prefix: "ENZ".to_string(),
            timezone_offset_hours: 7,
            free_shipping_threshold: FREE_SHIPPING_THRESHOLD,
            standard_shipping_fee: STANDARD_SHIPPING_FEE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    /// Shared key expected in `Authorization: Apikey <key>`. Empty rejects every call.
    pub api_key: Secret<String>,
}

#[derive(Debug, Clone)]
pub struct NotificationSettings {
    /// Delivery endpoint; notifications are only logged when unset.
    pub url: Option<String>,
    pub queue_size: usize,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            url: None,
            queue_size: 256,
        }
    }
}

impl OrderConfig {
    pub fn from_env() -> Result<Self, AppError> {
        dotenv().ok();
        let mut common = core_config::Config::load()?;
        if let Some(port) = parse_env::<u16>("ORDER_SERVICE_PORT")? {
            common.port = port;
        }

        let defaults = CheckoutConfig::default();

        Ok(Self {
            service_name: env::var("SERVICE_NAME").unwrap_or_else(|_| "order-service".to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| common.log_level.clone()),
            otlp_endpoint: env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
                .ok()
                .filter(|s| !s.is_empty())
                .or_else(|| common.otlp_endpoint.clone()),
            database: DatabaseConfig {
                url: env::var("ORDER_DATABASE_URL").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("ORDER_DATABASE_URL is required"))
                })?,
                max_connections: parse_env("ORDER_DB_MAX_CONNECTIONS")?.unwrap_or(10),
                min_connections: parse_env("ORDER_DB_MIN_CONNECTIONS")?.unwrap_or(2),
            },
            checkout: CheckoutConfig {
                order_number_prefix: env::var("ORDER_NUMBER_PREFIX")
                    .unwrap_or(defaults.order_number_prefix),
                timezone_offset_hours: parse_env("ORDER_TIMEZONE_OFFSET_HOURS")?
                    .unwrap_or(defaults.timezone_offset_hours),
                free_shipping_threshold: parse_env("ORDER_FREE_SHIPPING_THRESHOLD")?
                    .unwrap_or(defaults.free_shipping_threshold),
                standard_shipping_fee: parse_env("ORDER_STANDARD_SHIPPING_FEE")?
                    .unwrap_or(defaults.standard_shipping_fee),
            },
            webhook: WebhookConfig {
                api_key: Secret::new(env::var("ORDER_WEBHOOK_API_KEY").unwrap_or_default()),
            },
            notifications: NotificationSettings {
                url: env::var("ORDER_NOTIFICATION_URL").ok().filter(|s| !s.is_empty()),
                queue_size: parse_env("ORDER_NOTIFICATION_QUEUE_SIZE")?.unwrap_or(256),
            },
            common,
        })
    }
}

/// Parse an optional variable; a present but malformed value is an error.
fn parse_env<T: FromStr>(key: &str) -> Result<Option<T>, AppError> {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().map(Some).map_err(|_| {
            AppError::ConfigError(anyhow::anyhow!("{} has an invalid value: '{}'", key, raw))
        }),
        Err(_) => Ok(None),
    }
}
