//! Database service for order-service.

use crate::models::{Order, OrderDetails, OrderItem, TimelineEntry};
use crate::services::metrics::DB_QUERY_DURATION;
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::PgConnection;
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "order-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    /// Order with items and timeline.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn get_order_details(&self, order_id: Uuid) -> Result<Option<OrderDetails>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_order"])
            .start_timer();

        let mut conn = self.acquire().await?;
        let order = sqlx::query_as::<_, Order>("SELECT * FROM orders WHERE id = $1")
            .bind(order_id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| AppError::database("Failed to load order", e))?;

        let details = match order {
            Some(order) => Some(load_details(&mut conn, order).await?),
            None => None,
        };

        timer.observe_duration();
        Ok(details)
    }

    #[instrument(skip(self), fields(order_number = %order_number))]
    pub async fn get_order_details_by_number(
        &self,
        order_number: &str,
    ) -> Result<Option<OrderDetails>, AppError> {
        let mut conn = self.acquire().await?;
        let order = find_by_number(&mut conn, order_number).await?;

        match order {
            Some(order) => Ok(Some(load_details(&mut conn, order).await?)),
            None => Ok(None),
        }
    }

    async fn acquire(&self) -> Result<sqlx::pool::PoolConnection<sqlx::Postgres>, AppError> {
        self.pool
            .acquire()
            .await
            .map_err(|e| AppError::database("Failed to acquire connection", e))
    }
}

// -----------------------------------------------------------------------------
// Order queries shared by checkout, lifecycle and payment code. All of these
// run on a caller-supplied connection, usually an open transaction.
// -----------------------------------------------------------------------------

/// Load and lock an order row for the rest of the transaction.
pub async fn lock_order(conn: &mut PgConnection, order_id: Uuid) -> Result<Order, AppError> {
    sqlx::query_as::<_, Order>("SELECT * FROM orders WHERE id = $1 FOR UPDATE")
        .bind(order_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| AppError::database("Failed to lock order", e))?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Order {} not found", order_id)))
}

pub async fn find_by_number(
    conn: &mut PgConnection,
    order_number: &str,
) -> Result<Option<Order>, AppError> {
    sqlx::query_as::<_, Order>("SELECT * FROM orders WHERE order_number = $1")
        .bind(order_number.trim().to_uppercase())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| AppError::database("Failed to load order by number", e))
}

pub async fn load_items(conn: &mut PgConnection, order_id: Uuid) -> Result<Vec<OrderItem>, AppError> {
    sqlx::query_as::<_, OrderItem>("SELECT * FROM order_items WHERE order_id = $1 ORDER BY position")
        .bind(order_id)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| AppError::database("Failed to load order items", e))
}

pub async fn load_timeline(
    conn: &mut PgConnection,
    order_id: Uuid,
) -> Result<Vec<TimelineEntry>, AppError> {
    sqlx::query_as::<_, TimelineEntry>(
        "SELECT * FROM order_timeline WHERE order_id = $1 ORDER BY created_utc, id",
    )
    .bind(order_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| AppError::database("Failed to load order timeline", e))
}

pub async fn load_details(conn: &mut PgConnection, order: Order) -> Result<OrderDetails, AppError> {
    let items = load_items(conn, order.id).await?;
    let timeline = load_timeline(conn, order.id).await?;
    Ok(OrderDetails {
        order,
        items,
        timeline,
    })
}

pub async fn append_timeline(
    conn: &mut PgConnection,
    order_id: Uuid,
    status: &str,
    note: Option<&str>,
    actor: &str,
) -> Result<TimelineEntry, AppError> {
    sqlx::query_as::<_, TimelineEntry>(
        r#"
        INSERT INTO order_timeline (id, order_id, status, note, actor)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(order_id)
    .bind(status)
    .bind(note)
    .bind(actor)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| AppError::database("Failed to append timeline entry", e))
}
