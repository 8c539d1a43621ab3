//! Business logic for order-service.

pub mod catalog;
pub mod database;
pub mod lifecycle;
pub mod loyalty;
pub mod metrics;
pub mod notifications;
pub mod order_number;
pub mod orders;
pub mod payments;
pub mod pricing;
pub mod vouchers;

pub use database::Database;
pub use loyalty::LoyaltyLedger;
pub use metrics::{get_metrics, init_metrics};
pub use notifications::{HttpNotifier, LogNotifier, NotificationDispatcher, Notifier};
pub use order_number::OrderNumberGenerator;
pub use orders::OrderService;
pub use pricing::ShippingPolicy;
pub use vouchers::VoucherService;
