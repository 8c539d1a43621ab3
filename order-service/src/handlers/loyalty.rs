//! Loyalty balance, history and staff adjustments.

use crate::middleware::CallerContext;
use crate::models::{AdjustPointsRequest, LoyaltyBalance, LoyaltyLedgerEntry};
use crate::startup::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use service_core::error::AppError;
use validator::Validate;

const DEFAULT_HISTORY_LIMIT: i64 = 50;
const MAX_HISTORY_LIMIT: i64 = 500;

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<i64>,
}

/// Customers may read their own account; staff may read any.
fn ensure_account_access(caller: &CallerContext, user_id: &str) -> Result<(), AppError> {
    if caller.is_admin() || caller.user_id.as_deref() == Some(user_id) {
        Ok(())
    } else {
        Err(AppError::Forbidden(anyhow::anyhow!(
            "You can only view your own loyalty account"
        )))
    }
}

pub async fn get_balance(
    State(state): State<AppState>,
    caller: CallerContext,
    Path(user_id): Path<String>,
) -> Result<Json<LoyaltyBalance>, AppError> {
    ensure_account_access(&caller, &user_id)?;
    let balance = state.orders.loyalty().get_balance(&user_id).await?;
    Ok(Json(balance))
}

pub async fn get_history(
    State(state): State<AppState>,
    caller: CallerContext,
    Path(user_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<LoyaltyLedgerEntry>>, AppError> {
    ensure_account_access(&caller, &user_id)?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);
    let entries = state.orders.loyalty().history(&user_id, limit).await?;
    Ok(Json(entries))
}

pub async fn adjust_points(
    State(state): State<AppState>,
    caller: CallerContext,
    Path(user_id): Path<String>,
    Json(request): Json<AdjustPointsRequest>,
) -> Result<(StatusCode, Json<LoyaltyLedgerEntry>), AppError> {
    caller.require_admin()?;
    request.validate()?;
    let entry = state
        .orders
        .loyalty()
        .adjust_points(&user_id, request.points, request.description.trim())
        .await?;
    Ok((StatusCode::CREATED, Json(entry)))
}
