//! Customer and admin notifications.
//!
//! Dispatch is fire-and-forget: messages go onto a bounded queue drained by a
//! single worker. A full queue drops the message with a warning rather than
//! blocking the request that produced it. Delivery failures are logged and
//! never reach the caller.

use crate::models::{Order, OrderItem};
use crate::services::metrics::NOTIFICATIONS;
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum NotifierError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Rejected with status {0}")]
    Rejected(u16),
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemSnapshot {
    pub product_name: String,
    pub variant_name: Option<String>,
    pub sku: Option<String>,
    pub quantity: i32,
    pub unit_price: i64,
    pub line_total: i64,
}

/// Order fields a notification template may use.
#[derive(Debug, Clone, Serialize)]
pub struct OrderSnapshot {
    pub order_id: Uuid,
    pub order_number: String,
    pub user_id: Option<String>,
    pub status: String,
    pub payment_status: String,
    pub payment_method: String,
    pub customer_name: String,
    pub customer_phone: String,
    pub customer_email: Option<String>,
    pub shipping_address: String,
    pub subtotal: i64,
    pub discount_amount: i64,
    pub shipping_fee: i64,
    pub total: i64,
    pub voucher_code: Option<String>,
    pub cancel_reason: Option<String>,
    pub external_tx_id: Option<String>,
    pub items: Vec<ItemSnapshot>,
}

impl OrderSnapshot {
    pub fn new(order: &Order, items: &[OrderItem]) -> Self {
        Self {
            order_id: order.id,
            order_number: order.order_number.clone(),
            user_id: order.user_id.clone(),
            status: order.status.as_str().to_string(),
            payment_status: order.payment_status.as_str().to_string(),
            payment_method: order.payment_method.as_str().to_string(),
            customer_name: order.customer_name.clone(),
            customer_phone: order.customer_phone.clone(),
            customer_email: order.customer_email.clone(),
            shipping_address: order.shipping_address.clone(),
            subtotal: order.subtotal,
            discount_amount: order.discount_amount,
            shipping_fee: order.shipping_fee,
            total: order.total,
            voucher_code: order.voucher_code.clone(),
            cancel_reason: order.cancel_reason.clone(),
            external_tx_id: order.external_tx_id.clone(),
            items: items
                .iter()
                .map(|item| ItemSnapshot {
                    product_name: item.product_name.clone(),
                    variant_name: item.variant_name.clone(),
                    sku: item.sku.clone(),
                    quantity: item.quantity,
                    unit_price: item.unit_price,
                    line_total: item.line_total,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AdminMetadata {
    pub order_id: Uuid,
    pub order_number: String,
    pub total: i64,
    pub customer_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdminMessage {
    pub subject: String,
    pub body: String,
    pub metadata: AdminMetadata,
}

impl AdminMessage {
    pub fn new_order(order: &Order) -> Self {
        Self {
            subject: format!("New order {}", order.order_number),
            body: format!(
                "{} placed order {} for {} ({})",
                order.customer_name,
                order.order_number,
                order.total,
                order.payment_method.as_str()
            ),
            metadata: AdminMetadata {
                order_id: order.id,
                order_number: order.order_number.clone(),
                total: order.total,
                customer_name: order.customer_name.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    OrderConfirmation(OrderSnapshot),
    ShippingUpdate(OrderSnapshot),
    DeliveryConfirmation(OrderSnapshot),
    OrderCancellation(OrderSnapshot),
    PaymentSuccess(OrderSnapshot),
    AdminInbox(AdminMessage),
}

impl Notification {
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::OrderConfirmation(_) => "order_confirmation",
            Notification::ShippingUpdate(_) => "shipping_update",
            Notification::DeliveryConfirmation(_) => "delivery_confirmation",
            Notification::OrderCancellation(_) => "order_cancellation",
            Notification::PaymentSuccess(_) => "payment_success",
            Notification::AdminInbox(_) => "admin_inbox",
        }
    }

    fn order_number(&self) -> &str {
        match self {
            Notification::OrderConfirmation(s)
            | Notification::ShippingUpdate(s)
            | Notification::DeliveryConfirmation(s)
            | Notification::OrderCancellation(s)
            | Notification::PaymentSuccess(s) => &s.order_number,
            Notification::AdminInbox(m) => &m.metadata.order_number,
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send(&self, notification: &Notification) -> Result<(), NotifierError>;
}

/// Writes notifications to the log. Used when no delivery endpoint is set.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn send(&self, notification: &Notification) -> Result<(), NotifierError> {
        info!(
            kind = notification.kind(),
            order_number = notification.order_number(),
            "Notification"
        );
        Ok(())
    }
}

/// Posts each notification as JSON to a delivery service.
pub struct HttpNotifier {
    client: Client,
    endpoint: String,
}

impl HttpNotifier {
    pub fn new(endpoint: String) -> Result<Self, NotifierError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| NotifierError::Transport(e.to_string()))?;
        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn send(&self, notification: &Notification) -> Result<(), NotifierError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(notification)
            .send()
            .await
            .map_err(|e| NotifierError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(NotifierError::Rejected(response.status().as_u16()));
        }
        Ok(())
    }
}

/// Handle to the notification queue. Cheap to clone.
#[derive(Clone)]
pub struct NotificationDispatcher {
    sender: mpsc::Sender<Notification>,
}

impl NotificationDispatcher {
    /// Start the worker task. Must be called inside a Tokio runtime.
    pub fn spawn(notifier: Arc<dyn Notifier>, capacity: usize) -> Self {
        let (sender, mut receiver) = mpsc::channel::<Notification>(capacity.max(1));

        tokio::spawn(async move {
            while let Some(notification) = receiver.recv().await {
                let kind = notification.kind();
                match notifier.send(&notification).await {
                    Ok(()) => {
                        NOTIFICATIONS.with_label_values(&[kind, "sent"]).inc();
                    }
                    Err(e) => {
                        NOTIFICATIONS.with_label_values(&[kind, "failed"]).inc();
                        warn!(
                            error = %e,
                            notifier = notifier.name(),
                            kind,
                            order_number = notification.order_number(),
                            "Notification delivery failed"
                        );
                    }
                }
            }
        });

        Self { sender }
    }

    /// Queue a notification. Returns false when it was dropped.
    pub fn dispatch(&self, notification: Notification) -> bool {
        let kind = notification.kind();
        match self.sender.try_send(notification) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(n)) => {
                NOTIFICATIONS.with_label_values(&[kind, "dropped"]).inc();
                warn!(kind, order_number = n.order_number(), "Notification queue full, dropping");
                false
            }
            Err(mpsc::error::TrySendError::Closed(n)) => {
                NOTIFICATIONS.with_label_values(&[kind, "dropped"]).inc();
                warn!(kind, order_number = n.order_number(), "Notification worker stopped, dropping");
                false
            }
        }
    }
}
