//! Catalog access used by checkout and cancellation.
//!
//! Everything here runs on the caller's transaction. Rows are locked in id
//! order, products before variants, so concurrent checkouts and cancellations
//! cannot deadlock against each other.

use crate::models::{Product, ProductVariant};
use service_core::error::AppError;
use sqlx::PgConnection;
use std::collections::HashMap;
use uuid::Uuid;

pub async fn lock_products(
    conn: &mut PgConnection,
    ids: &[Uuid],
) -> Result<HashMap<Uuid, Product>, AppError> {
    if ids.is_empty() {
        return Ok(HashMap::new());
    }

    let rows = sqlx::query_as::<_, Product>(
        "SELECT * FROM products WHERE id = ANY($1) ORDER BY id FOR UPDATE",
    )
    .bind(ids)
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| AppError::database("Failed to lock products", e))?;

    Ok(rows.into_iter().map(|p| (p.id, p)).collect())
}

pub async fn lock_variants(
    conn: &mut PgConnection,
    ids: &[Uuid],
) -> Result<HashMap<Uuid, ProductVariant>, AppError> {
    if ids.is_empty() {
        return Ok(HashMap::new());
    }

    let rows = sqlx::query_as::<_, ProductVariant>(
        "SELECT * FROM product_variants WHERE id = ANY($1) ORDER BY id FOR UPDATE",
    )
    .bind(ids)
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| AppError::database("Failed to lock product variants", e))?;

    Ok(rows.into_iter().map(|v| (v.id, v)).collect())
}

/// Take `quantity` units from a product's stock and count them as sold.
/// `with_stock` is false when the stock is tracked on a variant instead.
pub async fn take_product_stock(
    conn: &mut PgConnection,
    product_id: Uuid,
    quantity: i32,
    with_stock: bool,
) -> Result<(), AppError> {
    let stock_delta = if with_stock { quantity } else { 0 };
    let result = sqlx::query(
        r#"
        UPDATE products
        SET stock_quantity = stock_quantity - $2,
            sold_count = sold_count + $3,
            updated_utc = NOW()
        WHERE id = $1 AND stock_quantity >= $2
        "#,
    )
    .bind(product_id)
    .bind(stock_delta)
    .bind(quantity)
    .execute(&mut *conn)
    .await
    .map_err(|e| AppError::database("Failed to decrement product stock", e))?;

    if result.rows_affected() == 0 {
        return Err(AppError::BusinessRule(anyhow::anyhow!(
            "Insufficient stock for product {}",
            product_id
        )));
    }
    Ok(())
}

pub async fn take_variant_stock(
    conn: &mut PgConnection,
    variant_id: Uuid,
    quantity: i32,
) -> Result<(), AppError> {
    let result = sqlx::query(
        r#"
        UPDATE product_variants
        SET stock_quantity = stock_quantity - $2, updated_utc = NOW()
        WHERE id = $1 AND stock_quantity >= $2
        "#,
    )
    .bind(variant_id)
    .bind(quantity)
    .execute(&mut *conn)
    .await
    .map_err(|e| AppError::database("Failed to decrement variant stock", e))?;

    if result.rows_affected() == 0 {
        return Err(AppError::BusinessRule(anyhow::anyhow!(
            "Insufficient stock for variant {}",
            variant_id
        )));
    }
    Ok(())
}

/// Inverse of [`take_product_stock`].
pub async fn restore_product_stock(
    conn: &mut PgConnection,
    product_id: Uuid,
    quantity: i32,
    with_stock: bool,
) -> Result<(), AppError> {
    let stock_delta = if with_stock { quantity } else { 0 };
    sqlx::query(
        r#"
        UPDATE products
        SET stock_quantity = stock_quantity + $2,
            sold_count = GREATEST(sold_count - $3, 0),
            updated_utc = NOW()
        WHERE id = $1
        "#,
    )
    .bind(product_id)
    .bind(stock_delta)
    .bind(quantity)
    .execute(&mut *conn)
    .await
    .map_err(|e| AppError::database("Failed to restore product stock", e))?;
    Ok(())
}

pub async fn restore_variant_stock(
    conn: &mut PgConnection,
    variant_id: Uuid,
    quantity: i32,
) -> Result<(), AppError> {
    sqlx::query(
        "UPDATE product_variants SET stock_quantity = stock_quantity + $2, updated_utc = NOW() WHERE id = $1",
    )
    .bind(variant_id)
    .bind(quantity)
    .execute(&mut *conn)
    .await
    .map_err(|e| AppError::database("Failed to restore variant stock", e))?;
    Ok(())
}
