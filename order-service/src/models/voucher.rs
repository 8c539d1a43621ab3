//! Voucher model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;
use validator::Validate;

use super::UnknownVariant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VoucherType {
    /// `value` is a percentage of the subtotal, optionally capped by `max_discount`.
    Percentage,
    /// `value` is an amount in currency units, never more than the subtotal.
    FixedAmount,
    /// Waives the shipping fee; contributes nothing to the discount amount.
    FreeShipping,
}

impl VoucherType {
    pub fn as_str(&self) -> &'static str {
        match self {
            VoucherType::Percentage => "PERCENTAGE",
            VoucherType::FixedAmount => "FIXED_AMOUNT",
            VoucherType::FreeShipping => "FREE_SHIPPING",
        }
    }
}

impl TryFrom<String> for VoucherType {
    type Error = UnknownVariant;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "PERCENTAGE" => Ok(VoucherType::Percentage),
            "FIXED_AMOUNT" => Ok(VoucherType::FixedAmount),
            "FREE_SHIPPING" => Ok(VoucherType::FreeShipping),
            _ => Err(UnknownVariant::new("voucher type", value)),
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Voucher {
    pub id: Uuid,
    pub code: String,
    #[sqlx(try_from = "String")]
    pub voucher_type: VoucherType,
    pub value: i64,
    pub min_order_amount: Option<i64>,
    pub max_discount: Option<i64>,
    pub usage_limit: Option<i32>,
    pub per_user_limit: Option<i32>,
    pub used_count: i32,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub is_active: bool,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Voucher {
    pub fn waives_shipping(&self) -> bool {
        self.voucher_type == VoucherType::FreeShipping
    }
}

/// Non-mutating voucher check from the checkout page.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ValidateVoucherRequest {
    #[validate(length(min = 1, max = 64))]
    pub code: String,
    #[validate(range(min = 0))]
    pub subtotal: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VoucherPreview {
    pub valid: bool,
    pub discount: i64,
    pub free_shipping: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}
