//! Checkout: turns a cart into a priced, persisted order in one transaction.

use crate::middleware::CallerContext;
use crate::models::{
    CreateOrderRequest, Order, OrderDetails, OrderItem, OrderStatus, PaymentStatus, Product,
    ProductVariant, Voucher,
};
use crate::services::catalog;
use crate::services::database::{self, Database};
use crate::services::loyalty::{self, LedgerTotals, LoyaltyLedger};
use crate::services::metrics::{CHECKOUT_REJECTIONS, DB_QUERY_DURATION, ORDERS_CREATED};
use crate::services::notifications::{
    AdminMessage, Notification, NotificationDispatcher, OrderSnapshot,
};
use crate::services::order_number::OrderNumberGenerator;
use crate::services::pricing::{self, ShippingPolicy};
use crate::services::vouchers::{self, VoucherRejection};
use chrono::Utc;
use service_core::error::AppError;
use sqlx::PgConnection;
use std::collections::HashMap;
use tracing::{debug, info, instrument};
use uuid::Uuid;
use validator::Validate;

/// Order workflows: checkout here, lifecycle transitions in `lifecycle`,
/// payment confirmation in `payments`.
#[derive(Clone)]
pub struct OrderService {
    pub(crate) db: Database,
    pub(crate) numbers: OrderNumberGenerator,
    pub(crate) shipping: ShippingPolicy,
    pub(crate) loyalty: LoyaltyLedger,
    pub(crate) notifications: NotificationDispatcher,
}

/// Stock is tracked on the variant when one is chosen, else on the product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum StockKey {
    Product(Uuid),
    Variant(Uuid),
}

struct PricedLine<'a> {
    product: &'a Product,
    variant: Option<&'a ProductVariant>,
    unit_price: i64,
    quantity: i32,
}

impl PricedLine<'_> {
    fn stock_key(&self) -> StockKey {
        match self.variant {
            Some(v) => StockKey::Variant(v.id),
            None => StockKey::Product(self.product.id),
        }
    }

    fn available(&self) -> i32 {
        match self.variant {
            Some(v) => v.stock_quantity,
            None => self.product.stock_quantity,
        }
    }

    fn display_name(&self) -> String {
        match self.variant {
            Some(v) => format!("{} ({})", self.product.name, v.name),
            None => self.product.name.clone(),
        }
    }

    fn sku(&self) -> Option<String> {
        self.variant
            .and_then(|v| v.sku.clone())
            .or_else(|| self.product.sku.clone())
    }

    fn line_total(&self) -> i64 {
        pricing::line_total(self.unit_price, self.quantity)
    }
}

fn rejected(reason: &str, err: AppError) -> AppError {
    CHECKOUT_REJECTIONS.with_label_values(&[reason]).inc();
    err
}

impl OrderService {
    pub fn new(
        db: Database,
        numbers: OrderNumberGenerator,
        shipping: ShippingPolicy,
        notifications: NotificationDispatcher,
    ) -> Self {
        let loyalty = LoyaltyLedger::new(db.pool().clone());
        Self {
            db,
            numbers,
            shipping,
            loyalty,
            notifications,
        }
    }

    pub fn loyalty(&self) -> &LoyaltyLedger {
        &self.loyalty
    }

    pub fn numbers(&self) -> &OrderNumberGenerator {
        &self.numbers
    }

    pub async fn get_order(&self, order_id: Uuid) -> Result<OrderDetails, AppError> {
        self.db
            .get_order_details(order_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Order {} not found", order_id)))
    }

    pub async fn get_order_by_number(&self, order_number: &str) -> Result<OrderDetails, AppError> {
        self.db
            .get_order_details_by_number(order_number)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!("Order {} not found", order_number))
            })
    }

    /// Create an order from a cart.
    ///
    /// Prices, stock, voucher eligibility and loyalty balance are all re-read
    /// under row locks inside a single transaction; any failure rolls back
    /// every write, including the order number and the loyalty redemption.
    #[instrument(skip(self, request, caller), fields(user_id = ?caller.user_id, item_count = request.items.len()))]
    pub async fn create_order(
        &self,
        request: CreateOrderRequest,
        caller: &CallerContext,
    ) -> Result<OrderDetails, AppError> {
        if request.items.is_empty() {
            return Err(rejected(
                "validation",
                AppError::BadRequest(anyhow::anyhow!("Order must contain at least one item")),
            ));
        }
        request
            .validate()
            .map_err(|e| rejected("validation", e.into()))?;

        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_order"])
            .start_timer();
        let now = Utc::now();

        let mut tx = self
            .db
            .pool()
            .begin()
            .await
            .map_err(|e| AppError::database("Failed to begin transaction", e))?;

        let mut product_ids: Vec<Uuid> = request.items.iter().map(|i| i.product_id).collect();
        product_ids.sort();
        product_ids.dedup();
        let mut variant_ids: Vec<Uuid> = request.items.iter().filter_map(|i| i.variant_id).collect();
        variant_ids.sort();
        variant_ids.dedup();

        let products = catalog::lock_products(&mut tx, &product_ids).await?;
        let variants = catalog::lock_variants(&mut tx, &variant_ids).await?;

        let lines = price_lines(&request, &products, &variants)?;
        check_stock(&lines).map_err(|e| rejected("stock", e))?;

        let subtotal: i64 = lines.iter().map(PricedLine::line_total).sum();

        let voucher = match request
            .voucher_code
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
        {
            Some(code) => Some(
                apply_voucher(&mut tx, code, subtotal, caller.user_id.as_deref(), now)
                    .await
                    .map_err(|e| rejected("voucher", e))?,
            ),
            None => None,
        };
        let voucher_discount = voucher.as_ref().map(|(_, d)| *d).unwrap_or(0);

        let loyalty_totals: Option<LedgerTotals> = match caller.user_id.as_deref() {
            Some(user_id) => {
                loyalty::lock_account(&mut tx, user_id).await?;
                Some(loyalty::totals(&mut tx, user_id).await?)
            }
            None => None,
        };

        let shipping_waived = voucher.as_ref().is_some_and(|(v, _)| v.waives_shipping())
            || loyalty_totals.is_some_and(|t| t.tier().free_shipping());
        let shipping_fee = self.shipping.fee(subtotal, shipping_waived);

        let order_number = self.numbers.next(&mut tx, now).await?;
        let order_id = Uuid::new_v4();

        let (loyalty_discount, loyalty_points_used) = match (
            caller.user_id.as_deref(),
            loyalty_totals,
        ) {
            (Some(user_id), Some(totals)) if request.loyalty_points > 0 => {
                if request.loyalty_points > totals.balance() {
                    return Err(rejected(
                        "loyalty",
                        AppError::BusinessRule(anyhow::anyhow!(
                            "Insufficient loyalty points: requested {}, available {}",
                            request.loyalty_points,
                            totals.balance()
                        )),
                    ));
                }

                let discount =
                    pricing::loyalty_discount(request.loyalty_points, subtotal, voucher_discount);
                let points = pricing::points_for_discount(discount);
                if points > 0 {
                    loyalty::redeem_locked(
                        &mut tx,
                        user_id,
                        points,
                        &format!("Redeemed on order {}", order_number),
                        Some(order_id),
                    )
                    .await
                    .map_err(|e| rejected("loyalty", e))?;
                }
                (discount, points)
            }
            (None, _) if request.loyalty_points > 0 => {
                debug!("Ignoring loyalty redemption for guest checkout");
                (0, 0)
            }
            _ => (0, 0),
        };

        let discount_amount = voucher_discount + loyalty_discount;
        let total = pricing::order_total(subtotal, discount_amount, shipping_fee);

        let order = sqlx::query_as::<_, Order>(
            r#"
            INSERT INTO orders (
                id, order_number, user_id, status, payment_status, payment_method,
                subtotal, voucher_discount, loyalty_discount, discount_amount, shipping_fee, total,
                loyalty_points_used, voucher_id, voucher_code,
                customer_name, customer_phone, customer_email, shipping_address, note,
                created_utc, updated_utc
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                    $16, $17, $18, $19, $20, $21, $21)
            RETURNING *
            "#,
        )
        .bind(order_id)
        .bind(&order_number)
        .bind(caller.user_id.as_deref())
        .bind(OrderStatus::Pending.as_str())
        .bind(PaymentStatus::Pending.as_str())
        .bind(request.payment_method.as_str())
        .bind(subtotal)
        .bind(voucher_discount)
        .bind(loyalty_discount)
        .bind(discount_amount)
        .bind(shipping_fee)
        .bind(total)
        .bind(loyalty_points_used)
        .bind(voucher.as_ref().map(|(v, _)| v.id))
        .bind(voucher.as_ref().map(|(v, _)| v.code.clone()))
        .bind(request.customer_name.trim())
        .bind(request.customer_phone.trim())
        .bind(request.customer_email.as_deref())
        .bind(request.shipping_address.trim())
        .bind(request.note.as_deref())
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| AppError::database("Failed to insert order", e))?;

        let items = insert_items(&mut tx, order_id, &lines).await?;

        let created = database::append_timeline(
            &mut tx,
            order_id,
            OrderStatus::Pending.as_str(),
            Some("Order created"),
            &caller.actor(),
        )
        .await?;

        for line in &lines {
            match line.variant {
                Some(variant) => {
                    catalog::take_variant_stock(&mut tx, variant.id, line.quantity)
                        .await?;
                    catalog::take_product_stock(
                        &mut tx,
                        line.product.id,
                        line.quantity,
                        false,
                    )
                    .await?;
                }
                None => {
                    catalog::take_product_stock(
                        &mut tx,
                        line.product.id,
                        line.quantity,
                        true,
                    )
                    .await?;
                }
            }
        }

        if let Some((voucher, _)) = &voucher {
            vouchers::increment_usage(&mut tx, voucher.id).await?;
        }

        tx.commit()
            .await
            .map_err(|e| AppError::database("Failed to commit order", e))?;
        timer.observe_duration();

        ORDERS_CREATED
            .with_label_values(&[order.payment_method.as_str()])
            .inc();
        info!(
            order_id = %order.id,
            order_number = %order.order_number,
            subtotal = order.subtotal,
            discount_amount = order.discount_amount,
            shipping_fee = order.shipping_fee,
            total = order.total,
            "Order created"
        );

        self.notifications
            .dispatch(Notification::OrderConfirmation(OrderSnapshot::new(&order, &items)));
        self.notifications
            .dispatch(Notification::AdminInbox(AdminMessage::new_order(&order)));

        Ok(OrderDetails {
            order,
            items,
            timeline: vec![created],
        })
    }
}

/// Resolve every cart line against the locked catalog rows.
fn price_lines<'a>(
    request: &CreateOrderRequest,
    products: &'a HashMap<Uuid, Product>,
    variants: &'a HashMap<Uuid, ProductVariant>,
) -> Result<Vec<PricedLine<'a>>, AppError> {
    request
        .items
        .iter()
        .map(|item| {
            let product = products
                .get(&item.product_id)
                .filter(|p| p.is_active)
                .ok_or_else(|| {
                    AppError::NotFound(anyhow::anyhow!(
                        "Product {} not found or unavailable",
                        item.product_id
                    ))
                })?;

            let variant = match item.variant_id {
                Some(variant_id) => {
                    let variant = variants
                        .get(&variant_id)
                        .filter(|v| v.is_active)
                        .ok_or_else(|| {
                            AppError::NotFound(anyhow::anyhow!(
                                "Variant {} not found or unavailable",
                                variant_id
                            ))
                        })?;
                    if variant.product_id != product.id {
                        return Err(AppError::BadRequest(anyhow::anyhow!(
                            "Variant {} does not belong to product {}",
                            variant_id,
                            product.id
                        )));
                    }
                    Some(variant)
                }
                None => None,
            };

            let unit_price = variant
                .map(ProductVariant::unit_price)
                .unwrap_or_else(|| product.unit_price());

            Ok(PricedLine {
                product,
                variant,
                unit_price,
                quantity: item.quantity,
            })
        })
        .collect()
}

/// Compare total demand per stock row, summed across lines, with what is
/// available.
fn check_stock(lines: &[PricedLine<'_>]) -> Result<(), AppError> {
    let mut demand: HashMap<StockKey, i64> = HashMap::new();
    for line in lines {
        *demand.entry(line.stock_key()).or_default() += i64::from(line.quantity);
    }

    for line in lines {
        let requested = demand[&line.stock_key()];
        let available = i64::from(line.available());
        if requested > available {
            return Err(AppError::BusinessRule(anyhow::anyhow!(
                "Insufficient stock for {}: requested {}, available {}",
                line.display_name(),
                requested,
                available
            )));
        }
    }
    Ok(())
}

async fn apply_voucher(
    conn: &mut PgConnection,
    code: &str,
    subtotal: i64,
    user_id: Option<&str>,
    now: chrono::DateTime<Utc>,
) -> Result<(Voucher, i64), AppError> {
    let voucher = vouchers::find_by_code(conn, code, true)
        .await?
        .ok_or(VoucherRejection::NotFound)?;

    let user_usage = match user_id {
        Some(user_id) => Some(vouchers::user_usage_count(conn, voucher.id, user_id).await?),
        None => None,
    };

    let discount = vouchers::evaluate(&voucher, subtotal, now, user_usage)?;
    Ok((voucher, discount))
}

async fn insert_items(
    conn: &mut PgConnection,
    order_id: Uuid,
    lines: &[PricedLine<'_>],
) -> Result<Vec<OrderItem>, AppError> {
    let mut items = Vec::with_capacity(lines.len());
    for (position, line) in lines.iter().enumerate() {
        let item = sqlx::query_as::<_, OrderItem>(
            r#"
            INSERT INTO order_items (
                id, order_id, position, product_id, variant_id, product_name, variant_name,
                sku, unit_price, quantity, line_total
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(order_id)
        .bind(position as i32)
        .bind(line.product.id)
        .bind(line.variant.map(|v| v.id))
        .bind(&line.product.name)
        .bind(line.variant.map(|v| v.name.clone()))
        .bind(line.sku())
        .bind(line.unit_price)
        .bind(line.quantity)
        .bind(line.line_total())
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| AppError::database("Failed to insert order item", e))?;
        items.push(item);
    }
    Ok(items)
}
