use crate::middleware::CallerContext;
use crate::models::{ValidateVoucherRequest, VoucherPreview};
use crate::startup::AppState;
use axum::{extract::State, Json};
use service_core::error::AppError;
use validator::Validate;

/// Checkout-page preview. Never changes usage counters.
pub async fn validate_voucher(
    State(state): State<AppState>,
    caller: CallerContext,
    Json(request): Json<ValidateVoucherRequest>,
) -> Result<Json<VoucherPreview>, AppError> {
    request.validate()?;
    let preview = state
        .vouchers
        .preview(&request.code, request.subtotal, caller.user_id.as_deref())
        .await?;
    Ok(Json(preview))
}
