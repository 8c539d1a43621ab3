//! Order, order item and timeline models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;
use validator::Validate;

use super::UnknownVariant;

/// Fulfillment status of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Confirmed,
    Processing,
    Shipping,
    Delivered,
    Cancelled,
    Refunded,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Confirmed => "CONFIRMED",
            OrderStatus::Processing => "PROCESSING",
            OrderStatus::Shipping => "SHIPPING",
            OrderStatus::Delivered => "DELIVERED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Refunded => "REFUNDED",
        }
    }

    /// Transitions permitted on the administrative status-update path.
    ///
    /// Customers can only reach CANCELLED from PENDING, through the
    /// dedicated cancellation operation.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, next),
            (Pending, Confirmed)
                | (Pending, Cancelled)
                | (Confirmed, Processing)
                | (Confirmed, Cancelled)
                | (Processing, Shipping)
                | (Processing, Cancelled)
                | (Shipping, Delivered)
                | (Delivered, Refunded)
        )
    }

    /// Statuses an order may move to from here.
    pub fn next_statuses(&self) -> Vec<OrderStatus> {
        ALL_STATUSES
            .iter()
            .copied()
            .filter(|s| self.can_transition_to(*s))
            .collect()
    }
}

const ALL_STATUSES: [OrderStatus; 7] = [
    OrderStatus::Pending,
    OrderStatus::Confirmed,
    OrderStatus::Processing,
    OrderStatus::Shipping,
    OrderStatus::Delivered,
    OrderStatus::Cancelled,
    OrderStatus::Refunded,
];

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for OrderStatus {
    type Error = UnknownVariant;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        ALL_STATUSES
            .iter()
            .copied()
            .find(|s| s.as_str() == value)
            .ok_or_else(|| UnknownVariant::new("order status", value))
    }
}

/// Payment status, independent of the fulfillment status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "PENDING",
            PaymentStatus::Paid => "PAID",
            PaymentStatus::Failed => "FAILED",
        }
    }
}

impl TryFrom<String> for PaymentStatus {
    type Error = UnknownVariant;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "PENDING" => Ok(PaymentStatus::Pending),
            "PAID" => Ok(PaymentStatus::Paid),
            "FAILED" => Ok(PaymentStatus::Failed),
            _ => Err(UnknownVariant::new("payment status", value)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentMethod {
    /// Cash collected by the carrier on delivery.
    #[default]
    Cod,
    /// Bank transfer confirmed through the payment webhook.
    BankTransfer,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Cod => "COD",
            PaymentMethod::BankTransfer => "BANK_TRANSFER",
        }
    }
}

impl TryFrom<String> for PaymentMethod {
    type Error = UnknownVariant;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "COD" => Ok(PaymentMethod::Cod),
            "BANK_TRANSFER" => Ok(PaymentMethod::BankTransfer),
            _ => Err(UnknownVariant::new("payment method", value)),
        }
    }
}

/// Persisted order row.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub order_number: String,
    pub user_id: Option<String>,
    #[sqlx(try_from = "String")]
    pub status: OrderStatus,
    #[sqlx(try_from = "String")]
    pub payment_status: PaymentStatus,
    #[sqlx(try_from = "String")]
    pub payment_method: PaymentMethod,
    pub subtotal: i64,
    pub voucher_discount: i64,
    pub loyalty_discount: i64,
    pub discount_amount: i64,
    pub shipping_fee: i64,
    pub total: i64,
    pub loyalty_points_used: i64,
    pub voucher_id: Option<Uuid>,
    pub voucher_code: Option<String>,
    pub customer_name: String,
    pub customer_phone: String,
    pub customer_email: Option<String>,
    pub shipping_address: String,
    pub note: Option<String>,
    pub external_tx_id: Option<String>,
    pub cancel_reason: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    pub shipped_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Order {
    pub fn is_owned_by(&self, user_id: &str) -> bool {
        self.user_id.as_deref() == Some(user_id)
    }

    /// `total == subtotal - discount_amount + shipping_fee`, with the discount
    /// split into its voucher and loyalty parts, all non-negative.
    pub fn amounts_consistent(&self) -> bool {
        self.subtotal >= 0
            && self.voucher_discount >= 0
            && self.loyalty_discount >= 0
            && self.discount_amount == self.voucher_discount + self.loyalty_discount
            && self.discount_amount <= self.subtotal
            && self.shipping_fee >= 0
            && self.total >= 0
            && self.total == self.subtotal - self.discount_amount + self.shipping_fee
    }
}

/// Line item with catalog fields snapshotted at checkout.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct OrderItem {
    pub id: Uuid,
    pub order_id: Uuid,
    pub position: i32,
    pub product_id: Uuid,
    pub variant_id: Option<Uuid>,
    pub product_name: String,
    pub variant_name: Option<String>,
    pub sku: Option<String>,
    pub unit_price: i64,
    pub quantity: i32,
    pub line_total: i64,
}

/// Append-only audit entry. `status` holds an order status or an event label
/// such as `PAYMENT_CONFIRMED`.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub id: Uuid,
    pub order_id: Uuid,
    pub status: String,
    pub note: Option<String>,
    pub actor: Option<String>,
    pub created_utc: DateTime<Utc>,
}

pub const TIMELINE_PAYMENT_CONFIRMED: &str = "PAYMENT_CONFIRMED";

/// Order with its items and timeline, as returned by the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderDetails {
    #[serde(flatten)]
    pub order: Order,
    pub items: Vec<OrderItem>,
    pub timeline: Vec<TimelineEntry>,
}

/// One requested cart line. Prices are never accepted from the client.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CartItemRequest {
    pub product_id: Uuid,
    pub variant_id: Option<Uuid>,
    #[validate(range(min = 1, max = 1000, message = "Quantity must be between 1 and 1000"))]
    pub quantity: i32,
}

/// Checkout request.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateOrderRequest {
    #[validate(nested)]
    pub items: Vec<CartItemRequest>,
    pub voucher_code: Option<String>,
    #[serde(default)]
    #[validate(range(min = 0, message = "Loyalty points cannot be negative"))]
    pub loyalty_points: i64,
    #[serde(default)]
    pub payment_method: PaymentMethod,
    #[validate(length(min = 1, max = 200))]
    pub customer_name: String,
    #[validate(length(min = 6, max = 32))]
    pub customer_phone: String,
    #[validate(email)]
    pub customer_email: Option<String>,
    #[validate(length(min = 1, max = 1000))]
    pub shipping_address: String,
    #[validate(length(max = 1000))]
    pub note: Option<String>,
}

/// Administrative status change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: OrderStatus,
    pub note: Option<String>,
    pub cancel_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CancelOrderRequest {
    #[validate(length(max = 500))]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AddTimelineRequest {
    #[validate(length(min = 1, max = 2000))]
    pub note: String,
}
