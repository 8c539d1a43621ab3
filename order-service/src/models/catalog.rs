//! Catalog rows read and locked during checkout.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Product {
    pub id: Uuid,
    pub name: String,
    pub sku: Option<String>,
    pub base_price: i64,
    pub sale_price: Option<i64>,
    pub stock_quantity: i32,
    pub sold_count: i32,
    pub is_active: bool,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Product {
    /// Sale price when set, otherwise the base price.
    pub fn unit_price(&self) -> i64 {
        self.sale_price.unwrap_or(self.base_price)
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ProductVariant {
    pub id: Uuid,
    pub product_id: Uuid,
    pub name: String,
    pub sku: Option<String>,
    pub price: i64,
    pub sale_price: Option<i64>,
    pub stock_quantity: i32,
    pub is_active: bool,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl ProductVariant {
    pub fn unit_price(&self) -> i64 {
        self.sale_price.unwrap_or(self.price)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn product(base_price: i64, sale_price: Option<i64>) -> Product {
        Product {
            id: Uuid::new_v4(),
            name: "Silk scarf".to_string(),
            sku: None,
            base_price,
            sale_price,
            stock_quantity: 5,
            sold_count: 0,
            is_active: true,
            created_utc: Utc::now(),
            updated_utc: Utc::now(),
        }
    }

    #[test]
    fn sale_price_wins_over_base_price() {
        assert_eq!(product(200_000, Some(150_000)).unit_price(), 150_000);
        assert_eq!(product(200_000, None).unit_price(), 200_000);
    }
}
