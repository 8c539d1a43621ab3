//! Order endpoints: checkout, lookup, cancellation and admin transitions.

use crate::middleware::CallerContext;
use crate::models::{
    AddTimelineRequest, CancelOrderRequest, CreateOrderRequest, Order, OrderDetails,
    TimelineEntry, UpdateStatusRequest,
};
use crate::services::payments::PaymentConfirmation;
use crate::startup::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use service_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

pub async fn create_order(
    State(state): State<AppState>,
    caller: CallerContext,
    Json(request): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<OrderDetails>), AppError> {
    let details = state.orders.create_order(request, &caller).await?;
    Ok((StatusCode::CREATED, Json(details)))
}

pub async fn get_order(
    State(state): State<AppState>,
    caller: CallerContext,
    Path(order_id): Path<Uuid>,
) -> Result<Json<OrderDetails>, AppError> {
    let details = state.orders.get_order(order_id).await?;
    if !is_participant(&caller, &details.order) && details.order.user_id.is_some() {
        return Err(not_found(&details.order));
    }
    Ok(Json(details))
}

#[derive(Debug, Deserialize)]
pub struct TrackingQuery {
    pub phone: Option<String>,
}

/// Tracking lookup by the customer-facing number. Numbers are sequential, so
/// guests must also present the phone number the order was placed with.
pub async fn get_order_by_number(
    State(state): State<AppState>,
    caller: CallerContext,
    Path(order_number): Path<String>,
    Query(query): Query<TrackingQuery>,
) -> Result<Json<OrderDetails>, AppError> {
    let details = state.orders.get_order_by_number(&order_number).await?;
    let guest_proof = details.order.user_id.is_none()
        && query
            .phone
            .as_deref()
            .is_some_and(|phone| same_phone(phone, &details.order.customer_phone));
    if !is_participant(&caller, &details.order) && !guest_proof {
        return Err(not_found(&details.order));
    }
    Ok(Json(details))
}

/// Admins, and signed-in customers reading their own order.
fn is_participant(caller: &CallerContext, order: &Order) -> bool {
    caller.is_admin()
        || caller
            .user_id
            .as_deref()
            .is_some_and(|user_id| order.is_owned_by(user_id))
}

fn same_phone(presented: &str, stored: &str) -> bool {
    let digits = |s: &str| s.chars().filter(char::is_ascii_digit).collect::<String>();
    let presented = digits(presented);
    !presented.is_empty() && presented == digits(stored)
}

fn not_found(order: &Order) -> AppError {
    AppError::NotFound(anyhow::anyhow!("Order {} not found", order.id))
}

pub async fn cancel_order(
    State(state): State<AppState>,
    caller: CallerContext,
    Path(order_id): Path<Uuid>,
    body: Option<Json<CancelOrderRequest>>,
) -> Result<Json<OrderDetails>, AppError> {
    let reason = match body {
        Some(Json(request)) => {
            request.validate()?;
            request.reason
        }
        None => None,
    };
    let details = state.orders.cancel_order(order_id, reason, &caller).await?;
    Ok(Json(details))
}

pub async fn update_status(
    State(state): State<AppState>,
    caller: CallerContext,
    Path(order_id): Path<Uuid>,
    Json(request): Json<UpdateStatusRequest>,
) -> Result<Json<OrderDetails>, AppError> {
    let details = state.orders.update_status(order_id, request, &caller).await?;
    Ok(Json(details))
}

pub async fn add_timeline(
    State(state): State<AppState>,
    caller: CallerContext,
    Path(order_id): Path<Uuid>,
    Json(request): Json<AddTimelineRequest>,
) -> Result<(StatusCode, Json<TimelineEntry>), AppError> {
    request.validate()?;
    let entry = state.orders.add_timeline(order_id, &request.note, &caller).await?;
    Ok((StatusCode::CREATED, Json(entry)))
}

#[derive(Debug, Deserialize)]
pub struct ConfirmPaymentRequest {
    pub external_tx_id: String,
    pub paid_at: Option<DateTime<Utc>>,
}

/// Manual payment confirmation by staff, e.g. after checking a bank statement.
pub async fn confirm_payment(
    State(state): State<AppState>,
    caller: CallerContext,
    Path(order_id): Path<Uuid>,
    Json(request): Json<ConfirmPaymentRequest>,
) -> Result<Json<PaymentConfirmation>, AppError> {
    caller.require_admin()?;
    let external_tx_id = request.external_tx_id.trim();
    if external_tx_id.is_empty() {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "external_tx_id is required"
        )));
    }

    let confirmation = state
        .orders
        .confirm_payment(
            order_id,
            external_tx_id,
            request.paid_at.unwrap_or_else(Utc::now),
            &caller.actor(),
        )
        .await?;
    Ok(Json(confirmation))
}
