//! Pricing primitives.
//!
//! All amounts are integer currency units. Percentage discounts round down.

pub const FREE_SHIPPING_THRESHOLD: i64 = 500_000;
pub const STANDARD_SHIPPING_FEE: i64 = 30_000;
/// Currency units granted per redeemed loyalty point.
pub const POINT_TO_CURRENCY_RATE: i64 = 10;
/// Order total required per earned base loyalty point.
pub const CURRENCY_PER_EARNED_POINT: i64 = 100;

/// Shipping fee rule, configurable per deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShippingPolicy {
    pub free_threshold: i64,
    pub standard_fee: i64,
}

impl Default for ShippingPolicy {
    fn default() -> Self {
        Self {
            free_threshold: FREE_SHIPPING_THRESHOLD,
            standard_fee: STANDARD_SHIPPING_FEE,
        }
    }
}

impl ShippingPolicy {
    /// Fee for `subtotal`; `waived` covers free-shipping vouchers and tier perks.
    pub fn fee(&self, subtotal: i64, waived: bool) -> i64 {
        if waived || subtotal >= self.free_threshold {
            0
        } else {
            self.standard_fee
        }
    }
}

pub fn line_total(unit_price: i64, quantity: i32) -> i64 {
    unit_price * i64::from(quantity)
}

/// `floor(subtotal * pct / 100)`, optionally capped. `pct` is clamped to 0..=100.
pub fn percentage_discount(subtotal: i64, pct: i64, cap: Option<i64>) -> i64 {
    let pct = pct.clamp(0, 100);
    let raw = (i128::from(subtotal.max(0)) * i128::from(pct) / 100) as i64;
    match cap {
        Some(cap) => raw.min(cap.max(0)),
        None => raw,
    }
}

pub fn fixed_discount(subtotal: i64, amount: i64) -> i64 {
    amount.max(0).min(subtotal.max(0))
}

pub fn redemption_value(points: i64) -> i64 {
    points.max(0) * POINT_TO_CURRENCY_RATE
}

/// Loyalty discount bounded by what remains payable after the voucher.
pub fn loyalty_discount(points: i64, subtotal: i64, voucher_discount: i64) -> i64 {
    let remaining = (subtotal - voucher_discount).max(0);
    redemption_value(points).min(remaining)
}

/// Points actually consumed for a given loyalty discount, rounded up so a
/// partial point is never given away.
pub fn points_for_discount(discount: i64) -> i64 {
    if discount <= 0 {
        return 0;
    }
    (discount + POINT_TO_CURRENCY_RATE - 1) / POINT_TO_CURRENCY_RATE
}

/// `subtotal - discount + shipping`, never negative.
pub fn order_total(subtotal: i64, discount: i64, shipping_fee: i64) -> i64 {
    (subtotal - discount + shipping_fee).max(0)
}

/// Base loyalty points for a delivered order, before the tier multiplier.
pub fn base_points_for_total(total: i64) -> i64 {
    total.max(0) / CURRENCY_PER_EARNED_POINT
}
