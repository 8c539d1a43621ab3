//! Payment confirmation and the inbound bank-transfer webhook.

use crate::models::{Order, OrderStatus, PaymentStatus, TIMELINE_PAYMENT_CONFIRMED};
use crate::services::database;
use crate::services::metrics::PAYMENTS;
use crate::services::notifications::{Notification, OrderSnapshot};
use crate::services::orders::OrderService;
use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use std::fmt;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Result of [`OrderService::confirm_payment`].
#[derive(Debug, Clone, Serialize)]
pub struct PaymentConfirmation {
    pub order: Order,
    /// True when the order was already paid and nothing changed.
    pub already_paid: bool,
}

/// Provider transaction id; some banks send a number, others a string.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum TransactionId {
    Number(i64),
    Text(String),
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionId::Number(n) => write!(f, "{}", n),
            TransactionId::Text(s) => f.write_str(s),
        }
    }
}

/// Bank-transfer notification body.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BankTransferWebhook {
    pub id: TransactionId,
    pub transfer_type: String,
    pub transfer_amount: i64,
    #[serde(default)]
    pub content: String,
    pub transaction_date: Option<String>,
    pub reference_code: Option<String>,
}

impl BankTransferWebhook {
    pub fn is_incoming(&self) -> bool {
        self.transfer_type.eq_ignore_ascii_case("in")
    }
}

/// What the webhook did. Every variant is acknowledged with success so the
/// provider stops retrying.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WebhookOutcome {
    Confirmed { order_number: String },
    AlreadyPaid { order_number: String },
    Ignored { reason: String },
}

impl WebhookOutcome {
    fn ignored(reason: impl Into<String>) -> Self {
        WebhookOutcome::Ignored {
            reason: reason.into(),
        }
    }

    pub fn message(&self) -> String {
        match self {
            WebhookOutcome::Confirmed { order_number } => {
                format!("Payment confirmed for {}", order_number)
            }
            WebhookOutcome::AlreadyPaid { order_number } => {
                format!("Order {} was already paid", order_number)
            }
            WebhookOutcome::Ignored { reason } => format!("Ignored: {}", reason),
        }
    }
}

/// Parse the provider's transaction time: RFC 3339 first, then a naive
/// `YYYY-MM-DD HH:MM:SS` in the shop's timezone. Falls back to `fallback`.
pub fn parse_transaction_date(
    raw: Option<&str>,
    offset: FixedOffset,
    fallback: DateTime<Utc>,
) -> DateTime<Utc> {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return fallback;
    };

    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return parsed.with_timezone(&Utc);
    }

    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .ok()
        .and_then(|naive| offset.from_local_datetime(&naive).single())
        .map(|local| local.with_timezone(&Utc))
        .unwrap_or(fallback)
}

impl OrderService {
    /// Mark an order paid. Calling it again for a paid order changes nothing.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn confirm_payment(
        &self,
        order_id: Uuid,
        external_tx_id: &str,
        paid_at: DateTime<Utc>,
        actor: &str,
    ) -> Result<PaymentConfirmation, AppError> {
        let mut tx = self
            .db
            .pool()
            .begin()
            .await
            .map_err(|e| AppError::database("Failed to begin transaction", e))?;

        let order = database::lock_order(&mut tx, order_id).await?;

        if order.payment_status == PaymentStatus::Paid {
            warn!(
                order_number = %order.order_number,
                existing_tx_id = ?order.external_tx_id,
                external_tx_id,
                "Payment already confirmed, ignoring duplicate"
            );
            PAYMENTS.with_label_values(&["duplicate"]).inc();
            return Ok(PaymentConfirmation {
                order,
                already_paid: true,
            });
        }

        let order = sqlx::query_as::<_, Order>(
            r#"
            UPDATE orders
            SET payment_status = $2, external_tx_id = $3, paid_at = $4, updated_utc = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(order_id)
        .bind(PaymentStatus::Paid.as_str())
        .bind(external_tx_id)
        .bind(paid_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| AppError::database("Failed to record payment", e))?;

        database::append_timeline(
            &mut tx,
            order.id,
            TIMELINE_PAYMENT_CONFIRMED,
            Some(&format!("Payment received, transaction {}", external_tx_id)),
            actor,
        )
        .await?;

        if matches!(order.status, OrderStatus::Cancelled | OrderStatus::Refunded) {
            warn!(
                order_number = %order.order_number,
                status = %order.status,
                external_tx_id,
                total = order.total,
                "Payment received for a closed order, refund required"
            );
            database::append_timeline(
                &mut tx,
                order.id,
                order.status.as_str(),
                Some(&format!(
                    "Payment {} received after the order was {}; refund required",
                    external_tx_id,
                    order.status.as_str().to_lowercase()
                )),
                actor,
            )
            .await?;
        }

        let items = database::load_items(&mut tx, order.id).await?;

        tx.commit()
            .await
            .map_err(|e| AppError::database("Failed to commit payment", e))?;

        PAYMENTS.with_label_values(&["confirmed"]).inc();
        info!(
            order_number = %order.order_number,
            external_tx_id,
            total = order.total,
            "Payment confirmed"
        );

        self.notifications
            .dispatch(Notification::PaymentSuccess(OrderSnapshot::new(&order, &items)));

        Ok(PaymentConfirmation {
            order,
            already_paid: false,
        })
    }

    /// Match a bank transfer to an order and confirm payment.
    ///
    /// Transfers that cannot be applied are logged and reported as ignored,
    /// never as errors.
    #[instrument(skip(self, payload), fields(transaction_id = %payload.id))]
    pub async fn handle_bank_transfer(
        &self,
        payload: &BankTransferWebhook,
    ) -> Result<WebhookOutcome, AppError> {
        if !payload.is_incoming() {
            return Ok(self.ignore(format!(
                "transfer type '{}' is not incoming",
                payload.transfer_type
            )));
        }

        let Some(order_number) = self.numbers.extract_from_text(&payload.content) else {
            return Ok(self.ignore("no order number in transfer content"));
        };

        let mut conn = self
            .db
            .pool()
            .acquire()
            .await
            .map_err(|e| AppError::database("Failed to acquire connection", e))?;
        let Some(order) = database::find_by_number(&mut conn, &order_number).await? else {
            return Ok(self.ignore(format!("order {} not found", order_number)));
        };
        drop(conn);

        if payload.transfer_amount < order.total {
            return Ok(self.ignore(format!(
                "amount {} is less than order total {} for {}",
                payload.transfer_amount, order.total, order_number
            )));
        }

        let paid_at = parse_transaction_date(
            payload.transaction_date.as_deref(),
            self.numbers.offset(),
            Utc::now(),
        );

        let confirmation = self
            .confirm_payment(order.id, &payload.id.to_string(), paid_at, "bank-webhook")
            .await?;

        Ok(if confirmation.already_paid {
            WebhookOutcome::AlreadyPaid { order_number }
        } else {
            WebhookOutcome::Confirmed { order_number }
        })
    }

    fn ignore(&self, reason: impl Into<String>) -> WebhookOutcome {
        let outcome = WebhookOutcome::ignored(reason);
        if let WebhookOutcome::Ignored { reason } = &outcome {
            warn!(reason = %reason, "Bank transfer ignored");
        }
        PAYMENTS.with_label_values(&["ignored"]).inc();
        outcome
    }
}
