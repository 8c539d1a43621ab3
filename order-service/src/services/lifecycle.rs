//! Order status transitions and their side effects.

use crate::middleware::CallerContext;
use crate::models::{
    Order, OrderDetails, OrderItem, OrderStatus, PaymentMethod, PaymentStatus, TimelineEntry,
    UpdateStatusRequest,
};
use crate::services::catalog;
use crate::services::database;
use crate::services::loyalty;
use crate::services::metrics::{DB_QUERY_DURATION, STATUS_TRANSITIONS};
use crate::services::notifications::{Notification, OrderSnapshot};
use crate::services::orders::OrderService;
use crate::services::pricing;
use crate::services::vouchers;
use chrono::Utc;
use service_core::error::AppError;
use sqlx::PgConnection;
use tracing::{error, info, instrument};
use uuid::Uuid;

fn default_note(status: OrderStatus) -> &'static str {
    match status {
        OrderStatus::Pending => "Order created",
        OrderStatus::Confirmed => "Order confirmed",
        OrderStatus::Processing => "Order is being prepared",
        OrderStatus::Shipping => "Order handed to carrier",
        OrderStatus::Delivered => "Order delivered",
        OrderStatus::Cancelled => "Order cancelled",
        OrderStatus::Refunded => "Order refunded",
    }
}

impl OrderService {
    /// Administrative status change along the transition table.
    #[instrument(skip(self, request, caller), fields(order_id = %order_id, to = %request.status))]
    pub async fn update_status(
        &self,
        order_id: Uuid,
        request: UpdateStatusRequest,
        caller: &CallerContext,
    ) -> Result<OrderDetails, AppError> {
        caller.require_admin()?;

        let mut tx = self
            .db
            .pool()
            .begin()
            .await
            .map_err(|e| AppError::database("Failed to begin transaction", e))?;

        let order = database::lock_order(&mut tx, order_id).await?;
        if order.status == request.status {
            return Err(AppError::BusinessRule(anyhow::anyhow!(
                "Order {} is already {}",
                order.order_number,
                order.status
            )));
        }
        if !order.status.can_transition_to(request.status) {
            let allowed: Vec<&str> = order
                .status
                .next_statuses()
                .iter()
                .map(OrderStatus::as_str)
                .collect();
            return Err(AppError::BusinessRule(anyhow::anyhow!(
                "Cannot move order {} from {} to {} (allowed: {})",
                order.order_number,
                order.status,
                request.status,
                if allowed.is_empty() { "none".to_string() } else { allowed.join(", ") }
            )));
        }

        let details = self
            .apply_transition(
                &mut tx,
                order,
                request.status,
                request.note.as_deref(),
                request.cancel_reason.as_deref(),
                &caller.actor(),
            )
            .await?;

        tx.commit()
            .await
            .map_err(|e| AppError::database("Failed to commit status change", e))?;

        self.after_transition(&details);
        Ok(details)
    }

    /// Customer-facing cancellation. Only PENDING orders qualify, and an
    /// authenticated customer may only cancel their own order.
    #[instrument(skip(self, reason, caller), fields(order_id = %order_id))]
    pub async fn cancel_order(
        &self,
        order_id: Uuid,
        reason: Option<String>,
        caller: &CallerContext,
    ) -> Result<OrderDetails, AppError> {
        let mut tx = self
            .db
            .pool()
            .begin()
            .await
            .map_err(|e| AppError::database("Failed to begin transaction", e))?;

        let order = database::lock_order(&mut tx, order_id).await?;

        if let (false, Some(user_id)) = (caller.is_admin(), caller.user_id.as_deref()) {
            if !order.is_owned_by(user_id) {
                return Err(AppError::Forbidden(anyhow::anyhow!(
                    "You can only cancel your own orders"
                )));
            }
        }

        if order.status != OrderStatus::Pending {
            return Err(AppError::BusinessRule(anyhow::anyhow!(
                "Order {} can no longer be cancelled (status {})",
                order.order_number,
                order.status
            )));
        }

        let reason = reason
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| "Cancelled by customer".to_string());

        let details = self
            .apply_transition(
                &mut tx,
                order,
                OrderStatus::Cancelled,
                Some(&reason),
                Some(&reason),
                &caller.actor(),
            )
            .await?;

        tx.commit()
            .await
            .map_err(|e| AppError::database("Failed to commit cancellation", e))?;

        self.after_transition(&details);
        Ok(details)
    }

    /// Audit note on an order in any status. Not a transition.
    #[instrument(skip(self, note, caller), fields(order_id = %order_id))]
    pub async fn add_timeline(
        &self,
        order_id: Uuid,
        note: &str,
        caller: &CallerContext,
    ) -> Result<TimelineEntry, AppError> {
        caller.require_admin()?;

        let mut tx = self
            .db
            .pool()
            .begin()
            .await
            .map_err(|e| AppError::database("Failed to begin transaction", e))?;

        let order = database::lock_order(&mut tx, order_id).await?;
        let entry = database::append_timeline(
            &mut tx,
            order.id,
            order.status.as_str(),
            Some(note.trim()),
            &caller.actor(),
        )
        .await?;

        tx.commit()
            .await
            .map_err(|e| AppError::database("Failed to commit timeline note", e))?;

        Ok(entry)
    }

    /// Write the new status with its stamps, run the transactional side
    /// effects, and append the timeline entry. The caller has locked `order`
    /// and validated the transition.
    async fn apply_transition(
        &self,
        conn: &mut PgConnection,
        order: Order,
        next: OrderStatus,
        note: Option<&str>,
        cancel_reason: Option<&str>,
        actor: &str,
    ) -> Result<OrderDetails, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["transition_order"])
            .start_timer();
        let now = Utc::now();
        let items = database::load_items(conn, order.id).await?;

        let mut updated = order.clone();
        updated.status = next;
        match next {
            OrderStatus::Shipping => {
                updated.shipped_at = Some(now);
            }
            OrderStatus::Delivered => {
                updated.delivered_at = Some(now);
                if order.payment_method == PaymentMethod::Cod
                    && order.payment_status == PaymentStatus::Pending
                {
                    updated.payment_status = PaymentStatus::Paid;
                    updated.paid_at = Some(now);
                }
            }
            OrderStatus::Cancelled => {
                updated.cancelled_at = Some(now);
                updated.cancel_reason = cancel_reason
                    .or(note)
                    .map(str::to_string)
                    .or_else(|| Some(default_note(next).to_string()));
                restore_stock(conn, &items).await?;
                if let Some(voucher_id) = order.voucher_id {
                    vouchers::decrement_usage(conn, voucher_id).await?;
                }
            }
            OrderStatus::Refunded => {
                if let Some(voucher_id) = order.voucher_id {
                    vouchers::decrement_usage(conn, voucher_id).await?;
                }
            }
            OrderStatus::Pending | OrderStatus::Confirmed | OrderStatus::Processing => {}
        }

        let updated = sqlx::query_as::<_, Order>(
            r#"
            UPDATE orders
            SET status = $2,
                payment_status = $3,
                paid_at = $4,
                shipped_at = $5,
                delivered_at = $6,
                cancelled_at = $7,
                cancel_reason = $8,
                updated_utc = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(updated.id)
        .bind(updated.status.as_str())
        .bind(updated.payment_status.as_str())
        .bind(updated.paid_at)
        .bind(updated.shipped_at)
        .bind(updated.delivered_at)
        .bind(updated.cancelled_at)
        .bind(updated.cancel_reason.as_deref())
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| AppError::database("Failed to update order status", e))?;

        database::append_timeline(
            conn,
            updated.id,
            next.as_str(),
            Some(note.unwrap_or(default_note(next))),
            actor,
        )
        .await?;
        let timeline = database::load_timeline(conn, updated.id).await?;

        timer.observe_duration();
        STATUS_TRANSITIONS.with_label_values(&[next.as_str()]).inc();
        info!(
            order_id = %updated.id,
            order_number = %updated.order_number,
            from = %order.status,
            to = %next,
            payment_status = updated.payment_status.as_str(),
            "Order status changed"
        );

        Ok(OrderDetails {
            order: updated,
            items,
            timeline,
        })
    }

    /// Post-commit effects: notifications and loyalty earning. Never fails.
    fn after_transition(&self, details: &OrderDetails) {
        let order = &details.order;
        let snapshot = || OrderSnapshot::new(order, &details.items);

        match order.status {
            OrderStatus::Shipping => {
                self.notifications
                    .dispatch(Notification::ShippingUpdate(snapshot()));
            }
            OrderStatus::Delivered => {
                self.notifications
                    .dispatch(Notification::DeliveryConfirmation(snapshot()));
                self.spawn_loyalty_earn(order);
            }
            OrderStatus::Cancelled => {
                self.notifications
                    .dispatch(Notification::OrderCancellation(snapshot()));
            }
            _ => {}
        }
    }

    fn spawn_loyalty_earn(&self, order: &Order) {
        let Some(user_id) = order.user_id.clone() else {
            return;
        };

        let ledger = self.loyalty.clone();
        let base_points = pricing::base_points_for_total(order.total);
        let description = format!("Order {}", order.order_number);
        let order_id = order.id;

        tokio::spawn(async move {
            let result = loyalty::retry_transient(loyalty::earn_retry_policy(), || {
                ledger.earn_points(&user_id, base_points, &description, Some(order_id))
            })
            .await;

            if let Err(e) = result {
                error!(
                    error = %e,
                    order_id = %order_id,
                    user_id = %user_id,
                    "Failed to award loyalty points after retries"
                );
            }
        });
    }
}

/// Put every item's quantity back, inverse of checkout. Rows are locked in
/// the same order checkout uses.
async fn restore_stock(conn: &mut PgConnection, items: &[OrderItem]) -> Result<(), AppError> {
    let mut product_ids: Vec<Uuid> = items.iter().map(|i| i.product_id).collect();
    product_ids.sort();
    product_ids.dedup();
    let mut variant_ids: Vec<Uuid> = items.iter().filter_map(|i| i.variant_id).collect();
    variant_ids.sort();
    variant_ids.dedup();

    catalog::lock_products(conn, &product_ids).await?;
    catalog::lock_variants(conn, &variant_ids).await?;

    for item in items {
        match item.variant_id {
            Some(variant_id) => {
                catalog::restore_variant_stock(conn, variant_id, item.quantity).await?;
                catalog::restore_product_stock(conn, item.product_id, item.quantity, false).await?;
            }
            None => {
                catalog::restore_product_stock(conn, item.product_id, item.quantity, true).await?;
            }
        }
    }
    Ok(())
}
