//! Application startup and lifecycle management.

use crate::config::OrderConfig;
use crate::handlers;
use crate::services::{
    init_metrics, Database, HttpNotifier, LogNotifier, NotificationDispatcher, Notifier,
    OrderNumberGenerator, OrderService, ShippingPolicy, VoucherService,
};
use axum::{
    middleware,
    routing::{get, patch, post},
    Router,
};
use service_core::error::AppError;
use service_core::middleware::metrics::metrics_middleware;
use service_core::middleware::tracing::{request_id_middleware, REQUEST_ID_HEADER};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::trace::{DefaultOnResponse, TraceLayer};
use tracing::Level;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: OrderConfig,
    pub db: Database,
    pub orders: OrderService,
    pub vouchers: VoucherService,
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: OrderConfig) -> Result<Self, AppError> {
        Self::build_internal(config, true).await
    }

    /// Build the application without running migrations.
    /// Use this in tests when migrations are already applied by the test harness.
    pub async fn build_without_migrations(config: OrderConfig) -> Result<Self, AppError> {
        Self::build_internal(config, false).await
    }

    async fn build_internal(config: OrderConfig, run_migrations: bool) -> Result<Self, AppError> {
        init_metrics();

        let db = Database::new(
            &config.database.url,
            config.database.max_connections,
            config.database.min_connections,
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to PostgreSQL");
            e
        })?;

        if run_migrations {
            db.run_migrations().await.map_err(|e| {
                tracing::error!(error = %e, "Failed to run migrations");
                e
            })?;
        }

        let numbers = OrderNumberGenerator::new(
            &config.checkout.order_number_prefix,
            config.checkout.timezone_offset_hours,
        )?;
        let shipping = ShippingPolicy {
            free_threshold: config.checkout.free_shipping_threshold,
            standard_fee: config.checkout.standard_shipping_fee,
        };

        let notifier: Arc<dyn Notifier> = match &config.notifications.url {
            Some(url) => Arc::new(HttpNotifier::new(url.clone()).map_err(|e| {
                AppError::ConfigError(anyhow::anyhow!("Invalid notification client: {}", e))
            })?),
            None => {
                tracing::info!("ORDER_NOTIFICATION_URL not set, notifications will only be logged");
                Arc::new(LogNotifier)
            }
        };
        let dispatcher = NotificationDispatcher::spawn(notifier, config.notifications.queue_size);

        let orders = OrderService::new(db.clone(), numbers, shipping, dispatcher);
        let vouchers = VoucherService::new(db.pool().clone());

        let state = AppState {
            config: config.clone(),
            db,
            orders,
            vouchers,
        };

        let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!(port = port, "Order service listener bound");

        Ok(Self {
            port,
            listener,
            state,
        })
    }

    /// Get the port the server is listening on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Get a reference to the database.
    pub fn db(&self) -> &Database {
        &self.state.db
    }

    /// Run the application until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let router = router(self.state);

        tracing::info!(
            service = "order-service",
            version = env!("CARGO_PKG_VERSION"),
            port = self.port,
            "Service ready to accept connections"
        );

        axum::serve(self.listener, router).await.map_err(|e| {
            tracing::error!(error = %e, "HTTP server error");
            std::io::Error::other(format!("HTTP server error: {}", e))
        })
    }
}

/// HTTP routes with the tracing, metrics and request-id layers.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics))
        .route("/orders", post(handlers::orders::create_order))
        .route("/orders/:id", get(handlers::orders::get_order))
        .route(
            "/orders/by-number/:number",
            get(handlers::orders::get_order_by_number),
        )
        .route("/orders/:id/cancel", post(handlers::orders::cancel_order))
        .route("/orders/:id/status", patch(handlers::orders::update_status))
        .route("/orders/:id/timeline", post(handlers::orders::add_timeline))
        .route(
            "/orders/:id/payment/confirm",
            post(handlers::orders::confirm_payment),
        )
        .route("/vouchers/validate", post(handlers::vouchers::validate_voucher))
        .route("/loyalty/:user_id", get(handlers::loyalty::get_balance))
        .route("/loyalty/:user_id/history", get(handlers::loyalty::get_history))
        .route("/loyalty/:user_id/adjust", post(handlers::loyalty::adjust_points))
        .route(
            "/webhooks/bank-transfer",
            post(handlers::webhooks::bank_transfer),
        )
        .layer(
            ServiceBuilder::new()
                .layer(middleware::from_fn(request_id_middleware))
                .layer(middleware::from_fn(metrics_middleware))
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(|request: &axum::http::Request<axum::body::Body>| {
                            let request_id = request
                                .headers()
                                .get(REQUEST_ID_HEADER)
                                .and_then(|value| value.to_str().ok())
                                .unwrap_or("-");

                            tracing::info_span!(
                                "http_request",
                                request_id = %request_id,
                                method = %request.method(),
                                uri = %request.uri(),
                                user_id = tracing::field::Empty,
                            )
                        })
                        .on_response(DefaultOnResponse::new().level(Level::INFO)),
                ),
        )
        .with_state(state)
}
