//! Voucher validation and usage counters.

use crate::models::{Voucher, VoucherPreview, VoucherType};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::pricing;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use sqlx::{PgConnection, PgPool};
use tracing::{debug, instrument};
use uuid::Uuid;

/// Why a voucher cannot be applied, in predicate order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoucherRejection {
    NotFound,
    Inactive,
    NotStarted,
    Expired,
    UsageLimitReached,
    BelowMinimum { min_order_amount: i64 },
    PerUserLimitReached,
}

impl VoucherRejection {
    pub fn reason(&self) -> String {
        match self {
            VoucherRejection::NotFound => "Voucher code does not exist".to_string(),
            VoucherRejection::Inactive => "Voucher is no longer active".to_string(),
            VoucherRejection::NotStarted => "Voucher is not valid yet".to_string(),
            VoucherRejection::Expired => "Voucher has expired".to_string(),
            VoucherRejection::UsageLimitReached => "Voucher usage limit has been reached".to_string(),
            VoucherRejection::BelowMinimum { min_order_amount } => {
                format!("Order subtotal must be at least {}", min_order_amount)
            }
            VoucherRejection::PerUserLimitReached => {
                "You have already used this voucher the maximum number of times".to_string()
            }
        }
    }
}

impl From<VoucherRejection> for AppError {
    fn from(rejection: VoucherRejection) -> Self {
        match rejection {
            VoucherRejection::NotFound => AppError::NotFound(anyhow::anyhow!(rejection.reason())),
            _ => AppError::BusinessRule(anyhow::anyhow!(rejection.reason())),
        }
    }
}

/// Codes are matched case-insensitively and stored upper-case.
pub fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}

/// Discount granted by `voucher` on `subtotal`. Free-shipping vouchers grant
/// no discount; they waive the fee instead.
pub fn discount_for(voucher: &Voucher, subtotal: i64) -> i64 {
    match voucher.voucher_type {
        VoucherType::Percentage => {
            pricing::percentage_discount(subtotal, voucher.value, voucher.max_discount)
        }
        VoucherType::FixedAmount => pricing::fixed_discount(subtotal, voucher.value),
        VoucherType::FreeShipping => 0,
    }
}

/// Run the eligibility checks, stopping at the first failure, and compute the
/// discount. `user_usage` is the caller's prior non-cancelled usage, when the
/// caller is known.
pub fn evaluate(
    voucher: &Voucher,
    subtotal: i64,
    now: DateTime<Utc>,
    user_usage: Option<i64>,
) -> Result<i64, VoucherRejection> {
    if !voucher.is_active {
        return Err(VoucherRejection::Inactive);
    }
    if now < voucher.start_date {
        return Err(VoucherRejection::NotStarted);
    }
    if now > voucher.end_date {
        return Err(VoucherRejection::Expired);
    }
    if let Some(limit) = voucher.usage_limit {
        if voucher.used_count >= limit {
            return Err(VoucherRejection::UsageLimitReached);
        }
    }
    if let Some(min_order_amount) = voucher.min_order_amount {
        if subtotal < min_order_amount {
            return Err(VoucherRejection::BelowMinimum { min_order_amount });
        }
    }
    if let (Some(limit), Some(used)) = (voucher.per_user_limit, user_usage) {
        if used >= i64::from(limit) {
            return Err(VoucherRejection::PerUserLimitReached);
        }
    }

    Ok(discount_for(voucher, subtotal))
}

/// Load a voucher by code, optionally taking the row lock for the rest of the
/// transaction.
pub async fn find_by_code(
    conn: &mut PgConnection,
    code: &str,
    for_update: bool,
) -> Result<Option<Voucher>, AppError> {
    let sql = if for_update {
        "SELECT * FROM vouchers WHERE code = $1 FOR UPDATE"
    } else {
        "SELECT * FROM vouchers WHERE code = $1"
    };

    sqlx::query_as::<_, Voucher>(sql)
        .bind(normalize_code(code))
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| AppError::database("Failed to load voucher", e))
}

/// Orders by `user_id` that still count as using the voucher.
pub async fn user_usage_count(
    conn: &mut PgConnection,
    voucher_id: Uuid,
    user_id: &str,
) -> Result<i64, AppError> {
    sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM orders
        WHERE voucher_id = $1 AND user_id = $2 AND status NOT IN ('CANCELLED', 'REFUNDED')
        "#,
    )
    .bind(voucher_id)
    .bind(user_id)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| AppError::database("Failed to count voucher usage", e))
}

pub async fn increment_usage(conn: &mut PgConnection, voucher_id: Uuid) -> Result<(), AppError> {
    sqlx::query("UPDATE vouchers SET used_count = used_count + 1, updated_utc = NOW() WHERE id = $1")
        .bind(voucher_id)
        .execute(&mut *conn)
        .await
        .map_err(|e| AppError::database("Failed to increment voucher usage", e))?;
    Ok(())
}

pub async fn decrement_usage(conn: &mut PgConnection, voucher_id: Uuid) -> Result<(), AppError> {
    sqlx::query(
        "UPDATE vouchers SET used_count = GREATEST(used_count - 1, 0), updated_utc = NOW() WHERE id = $1",
    )
    .bind(voucher_id)
    .execute(&mut *conn)
    .await
    .map_err(|e| AppError::database("Failed to decrement voucher usage", e))?;
    Ok(())
}

/// Read-only voucher checks for the checkout page.
#[derive(Clone)]
pub struct VoucherService {
    pool: PgPool,
}

impl VoucherService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Same checks and discount as checkout, without touching any counter.
    #[instrument(skip(self), fields(code = %code))]
    pub async fn preview(
        &self,
        code: &str,
        subtotal: i64,
        user_id: Option<&str>,
    ) -> Result<VoucherPreview, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["preview_voucher"])
            .start_timer();

        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| AppError::database("Failed to acquire connection", e))?;

        let Some(voucher) = find_by_code(&mut conn, code, false).await? else {
            return Ok(rejected(VoucherRejection::NotFound));
        };

        let user_usage = match user_id {
            Some(user_id) => Some(user_usage_count(&mut conn, voucher.id, user_id).await?),
            None => None,
        };

        timer.observe_duration();

        let preview = match evaluate(&voucher, subtotal, Utc::now(), user_usage) {
            Ok(discount) => VoucherPreview {
                valid: true,
                discount,
                free_shipping: voucher.waives_shipping(),
                reason: None,
            },
            Err(rejection) => rejected(rejection),
        };

        debug!(valid = preview.valid, discount = preview.discount, "Voucher previewed");
        Ok(preview)
    }
}

fn rejected(rejection: VoucherRejection) -> VoucherPreview {
    VoucherPreview {
        valid: false,
        discount: 0,
        free_shipping: false,
        reason: Some(rejection.reason()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn voucher(voucher_type: VoucherType, value: i64) -> Voucher {
        let now = Utc::now();
        Voucher {
            id: Uuid::new_v4(),
            code: "SALE10".to_string(),
            voucher_type,
            value,
            min_order_amount: None,
            max_discount: None,
            usage_limit: None,
            per_user_limit: None,
            used_count: 0,
            start_date: now - Duration::days(1),
            end_date: now + Duration::days(1),
            is_active: true,
            created_utc: now,
            updated_utc: now,
        }
    }

    #[test]
    fn percentage_voucher_is_capped() {
        let mut v = voucher(VoucherType::Percentage, 10);
        v.max_discount = Some(50_000);
        assert_eq!(evaluate(&v, 1_000_000, Utc::now(), None), Ok(50_000));
    }

    #[test]
    fn fixed_voucher_bounded_by_subtotal() {
        let v = voucher(VoucherType::FixedAmount, 100_000);
        assert_eq!(evaluate(&v, 60_000, Utc::now(), None), Ok(60_000));
    }

    #[test]
    fn free_shipping_voucher_has_no_discount() {
        let v = voucher(VoucherType::FreeShipping, 0);
        assert_eq!(evaluate(&v, 60_000, Utc::now(), None), Ok(0));
        assert!(v.waives_shipping());
    }

    #[test]
    fn inactive_checked_before_expiry() {
        let mut v = voucher(VoucherType::FixedAmount, 10_000);
        v.is_active = false;
        v.end_date = Utc::now() - Duration::hours(1);
        assert_eq!(
            evaluate(&v, 100_000, Utc::now(), None),
            Err(VoucherRejection::Inactive)
        );
    }

    #[test]
    fn window_boundaries() {
        let mut v = voucher(VoucherType::FixedAmount, 10_000);
        v.start_date = Utc::now() + Duration::hours(1);
        assert_eq!(
            evaluate(&v, 100_000, Utc::now(), None),
            Err(VoucherRejection::NotStarted)
        );

        let mut v = voucher(VoucherType::FixedAmount, 10_000);
        v.end_date = Utc::now() - Duration::hours(1);
        assert_eq!(
            evaluate(&v, 100_000, Utc::now(), None),
            Err(VoucherRejection::Expired)
        );
    }

    #[test]
    fn usage_limit_checked_before_minimum() {
        let mut v = voucher(VoucherType::FixedAmount, 10_000);
        v.usage_limit = Some(5);
        v.used_count = 5;
        v.min_order_amount = Some(1_000_000);
        assert_eq!(
            evaluate(&v, 100_000, Utc::now(), None),
            Err(VoucherRejection::UsageLimitReached)
        );
    }

    #[test]
    fn minimum_order_amount() {
        let mut v = voucher(VoucherType::FixedAmount, 10_000);
        v.min_order_amount = Some(200_000);
        assert_eq!(
            evaluate(&v, 199_999, Utc::now(), None),
            Err(VoucherRejection::BelowMinimum {
                min_order_amount: 200_000
            })
        );
        assert_eq!(evaluate(&v, 200_000, Utc::now(), None), Ok(10_000));
    }

    #[test]
    fn per_user_limit_only_applies_to_known_users() {
        let mut v = voucher(VoucherType::FixedAmount, 10_000);
        v.per_user_limit = Some(1);
        assert_eq!(evaluate(&v, 100_000, Utc::now(), None), Ok(10_000));
        assert_eq!(evaluate(&v, 100_000, Utc::now(), Some(0)), Ok(10_000));
        assert_eq!(
            evaluate(&v, 100_000, Utc::now(), Some(1)),
            Err(VoucherRejection::PerUserLimitReached)
        );
    }

    #[test]
    fn evaluation_is_repeatable() {
        let mut v = voucher(VoucherType::Percentage, 15);
        v.max_discount = Some(40_000);
        let now = Utc::now();
        assert_eq!(evaluate(&v, 250_000, now, Some(0)), evaluate(&v, 250_000, now, Some(0)));
    }

    #[test]
    fn codes_are_normalized() {
        assert_eq!(normalize_code("  sale10 "), "SALE10");
    }
}
