//! Domain models for order-service.

mod catalog;
mod loyalty;
mod order;
mod voucher;

pub use catalog::{Product, ProductVariant};
pub use loyalty::{
    AdjustPointsRequest, LedgerEntryType, LoyaltyBalance, LoyaltyLedgerEntry, Tier,
};
pub use order::{
    AddTimelineRequest, CancelOrderRequest, CartItemRequest, CreateOrderRequest, Order,
    OrderDetails, OrderItem, OrderStatus, PaymentMethod, PaymentStatus, TimelineEntry,
    UpdateStatusRequest, TIMELINE_PAYMENT_CONFIRMED,
};
pub use voucher::{ValidateVoucherRequest, Voucher, VoucherPreview, VoucherType};

/// Raised when a database text column holds a value with no matching variant.
#[derive(Debug, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct UnknownVariant {
    kind: &'static str,
    value: String,
}

impl UnknownVariant {
    pub(crate) fn new(kind: &'static str, value: String) -> Self {
        Self { kind, value }
    }
}
