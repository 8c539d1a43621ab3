//! Human-facing order numbers: `PREFIX-YYYYMMDD-NNNN`, sequence reset daily.

use crate::services::metrics::DB_QUERY_DURATION;
use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use regex::Regex;
use service_core::error::AppError;
use sqlx::PgConnection;
use tracing::{debug, instrument, warn};

/// Highest sequence that fits the four-digit `NNNN` part.
pub const MAX_DAILY_SEQUENCE: i32 = 9_999;

#[derive(Debug, Clone)]
pub struct OrderNumberGenerator {
    prefix: String,
    offset: FixedOffset,
    pattern: Regex,
}

impl OrderNumberGenerator {
    /// `offset_hours` fixes the timezone in which the business day rolls over.
    pub fn new(prefix: &str, offset_hours: i32) -> Result<Self, AppError> {
        let prefix = prefix.trim().to_uppercase();
        if prefix.is_empty() || !prefix.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "Order number prefix must be non-empty and alphanumeric, got '{}'",
                prefix
            )));
        }

        let offset = FixedOffset::east_opt(offset_hours * 3600).ok_or_else(|| {
            AppError::ConfigError(anyhow::anyhow!(
                "Invalid timezone offset: {} hours",
                offset_hours
            ))
        })?;

        // Bank transfer descriptions often drop or keep the hyphens.
        let pattern = Regex::new(&format!(
            r"(?i){}-?(\d{{8}})-?(\d{{4}})(?:\D|$)",
            regex::escape(&prefix)
        ))
        .map_err(|e| AppError::ConfigError(anyhow::anyhow!("Invalid order number pattern: {}", e)))?;

        Ok(Self {
            prefix,
            offset,
            pattern,
        })
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// Calendar day of `now` in the configured timezone.
    pub fn business_date(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.offset).date_naive()
    }

    pub fn format(&self, date: NaiveDate, sequence: i32) -> String {
        format!("{}-{}-{:04}", self.prefix, date.format("%Y%m%d"), sequence)
    }

    /// Sequence part of a number issued by this generator.
    pub fn parse_sequence(&self, order_number: &str) -> Option<i32> {
        let rest = order_number.strip_prefix(&self.prefix)?.strip_prefix('-')?;
        let (date, sequence) = rest.split_once('-')?;
        if date.len() != 8 || !date.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        sequence.parse().ok()
    }

    /// Find an order number inside free text, normalised to canonical form.
    pub fn extract_from_text(&self, text: &str) -> Option<String> {
        let captures = self.pattern.captures(text)?;
        Some(format!("{}-{}-{}", self.prefix, &captures[1], &captures[2]))
    }

    /// Allocate the next number for the business day of `now`.
    ///
    /// Must run on the order-creation transaction: the counter row stays
    /// locked until commit, so concurrent checkouts get distinct numbers and a
    /// rolled-back checkout releases its number.
    #[instrument(skip(self, conn))]
    pub async fn next(&self, conn: &mut PgConnection, now: DateTime<Utc>) -> Result<String, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["next_order_number"])
            .start_timer();

        let date = self.business_date(now);
        let day_prefix = format!("{}-{}-", self.prefix, date.format("%Y%m%d"));

        // Seed from existing orders so a fresh counter table never reissues
        // numbers that are already taken.
        let highest: Option<String> = sqlx::query_scalar(
            "SELECT MAX(order_number) FROM orders WHERE order_number LIKE $1",
        )
        .bind(format!("{}%", day_prefix))
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| AppError::database("Failed to read latest order number", e))?;

        let seed = highest
            .as_deref()
            .and_then(|n| self.parse_sequence(n))
            .unwrap_or(0)
            + 1;

        let sequence: i32 = sqlx::query_scalar(
            r#"
            INSERT INTO order_number_sequences (prefix, business_date, last_value)
            VALUES ($1, $2, $3)
            ON CONFLICT (prefix, business_date)
            DO UPDATE SET last_value = GREATEST(order_number_sequences.last_value + 1, EXCLUDED.last_value)
            RETURNING last_value
            "#,
        )
        .bind(&self.prefix)
        .bind(date)
        .bind(seed)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| AppError::database("Failed to allocate order number", e))?;

        timer.observe_duration();

        if sequence > MAX_DAILY_SEQUENCE {
            warn!(business_date = %date, "Daily order number range exhausted");
            return Err(AppError::BusinessRule(anyhow::anyhow!(
                "No order numbers left for {}, please try again tomorrow",
                date
            )));
        }

        let order_number = self.format(date, sequence);
        debug!(order_number = %order_number, "Allocated order number");
        Ok(order_number)
    }
}
