//! Loyalty ledger.
//!
//! The ledger is append-only and is the only source of truth for balances.
//! Every mutation locks the user's `loyalty_accounts` row first, so the
//! balance fold and the append that depends on it are serialised per user.

use crate::models::{LedgerEntryType, LoyaltyBalance, LoyaltyLedgerEntry, Tier};
use crate::services::metrics::{DB_QUERY_DURATION, LOYALTY_POINTS};
use backoff::ExponentialBackoff;
use chrono::{DateTime, Months, Utc};
use service_core::error::AppError;
use sqlx::{PgConnection, PgPool};
use std::future::Future;
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Earned points expire this many months after they are granted.
pub const POINTS_VALIDITY_MONTHS: u32 = 12;

/// Lifetime totals for a user: (earned, redeemed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LedgerTotals {
    pub earned: i64,
    pub redeemed: i64,
}

impl LedgerTotals {
    pub fn balance(&self) -> i64 {
        self.earned - self.redeemed
    }

    pub fn tier(&self) -> Tier {
        Tier::for_points(self.earned)
    }
}

/// Backoff for post-delivery earning. Retries are safe because an order can
/// only earn once.
pub fn earn_retry_policy() -> ExponentialBackoff {
    ExponentialBackoff {
        initial_interval: Duration::from_millis(200),
        max_elapsed_time: Some(Duration::from_secs(120)),
        ..Default::default()
    }
}

/// Run `op` until it succeeds or `policy` gives up. Only server-side failures
/// are retried; client errors are returned at once.
pub async fn retry_transient<T, F, Fut>(policy: ExponentialBackoff, mut op: F) -> Result<T, AppError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AppError>>,
{
    backoff::future::retry(policy, || {
        let attempt = op();
        async move {
            attempt.await.map_err(|e| {
                if e.is_client_error() {
                    backoff::Error::permanent(e)
                } else {
                    warn!(error = %e, "Loyalty operation failed, retrying");
                    backoff::Error::transient(e)
                }
            })
        }
    })
    .await
}

struct NewEntry<'a> {
    user_id: &'a str,
    points: i64,
    entry_type: LedgerEntryType,
    description: &'a str,
    order_id: Option<Uuid>,
    expires_at: Option<DateTime<Utc>>,
}

/// Take the per-user ledger lock for the rest of the transaction.
pub async fn lock_account(conn: &mut PgConnection, user_id: &str) -> Result<(), AppError> {
    sqlx::query("INSERT INTO loyalty_accounts (user_id) VALUES ($1) ON CONFLICT (user_id) DO NOTHING")
        .bind(user_id)
        .execute(&mut *conn)
        .await
        .map_err(|e| AppError::database("Failed to create loyalty account", e))?;

    sqlx::query("SELECT user_id FROM loyalty_accounts WHERE user_id = $1 FOR UPDATE")
        .bind(user_id)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| AppError::database("Failed to lock loyalty account", e))?;

    Ok(())
}

/// Fold the ledger. Positive entries count as earned, negative as redeemed,
/// whatever their type.
pub async fn totals(conn: &mut PgConnection, user_id: &str) -> Result<LedgerTotals, AppError> {
    let (earned, redeemed): (i64, i64) = sqlx::query_as(
        r#"
        SELECT
            COALESCE(SUM(points) FILTER (WHERE points > 0), 0)::BIGINT,
            COALESCE(-SUM(points) FILTER (WHERE points < 0), 0)::BIGINT
        FROM loyalty_ledger
        WHERE user_id = $1
        "#,
    )
    .bind(user_id)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| AppError::database("Failed to fold loyalty ledger", e))?;

    Ok(LedgerTotals { earned, redeemed })
}

async fn append(conn: &mut PgConnection, entry: NewEntry<'_>) -> Result<LoyaltyLedgerEntry, AppError> {
    let row = sqlx::query_as::<_, LoyaltyLedgerEntry>(
        r#"
        INSERT INTO loyalty_ledger (id, user_id, points, entry_type, description, order_id, expires_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(entry.user_id)
    .bind(entry.points)
    .bind(entry.entry_type.as_str())
    .bind(entry.description)
    .bind(entry.order_id)
    .bind(entry.expires_at)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| AppError::database("Failed to append loyalty entry", e))?;

    record_points(&row);
    Ok(row)
}

fn record_points(entry: &LoyaltyLedgerEntry) {
    LOYALTY_POINTS
        .with_label_values(&[entry.entry_type.as_str()])
        .inc_by(entry.points.unsigned_abs());
}

/// Redeem inside an existing transaction. The caller must already hold the
/// account lock from [`lock_account`].
pub async fn redeem_locked(
    conn: &mut PgConnection,
    user_id: &str,
    points: i64,
    description: &str,
    order_id: Option<Uuid>,
) -> Result<LoyaltyLedgerEntry, AppError> {
    if points <= 0 {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "Points to redeem must be positive"
        )));
    }

    let current = totals(conn, user_id).await?;
    if points > current.balance() {
        return Err(AppError::BusinessRule(anyhow::anyhow!(
            "Insufficient loyalty points: requested {}, available {}",
            points,
            current.balance()
        )));
    }

    append(
        conn,
        NewEntry {
            user_id,
            points: -points,
            entry_type: LedgerEntryType::Redeem,
            description,
            order_id,
            expires_at: None,
        },
    )
    .await
}

#[derive(Clone)]
pub struct LoyaltyLedger {
    pool: PgPool,
}

impl LoyaltyLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn get_balance(&self, user_id: &str) -> Result<LoyaltyBalance, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["loyalty_balance"])
            .start_timer();

        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| AppError::database("Failed to acquire connection", e))?;
        let current = totals(&mut conn, user_id).await?;

        timer.observe_duration();
        Ok(LoyaltyBalance::from_totals(user_id, current.earned, current.redeemed))
    }

    /// Ledger entries, newest first.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn history(&self, user_id: &str, limit: i64) -> Result<Vec<LoyaltyLedgerEntry>, AppError> {
        sqlx::query_as::<_, LoyaltyLedgerEntry>(
            r#"
            SELECT * FROM loyalty_ledger
            WHERE user_id = $1
            ORDER BY created_utc DESC, id
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::database("Failed to load loyalty history", e))
    }

    /// Grant `base_points` scaled by the tier held before this entry.
    ///
    /// Returns `None` when nothing was written: zero points after scaling, or
    /// the order already earned its points.
    #[instrument(skip(self, description), fields(user_id = %user_id))]
    pub async fn earn_points(
        &self,
        user_id: &str,
        base_points: i64,
        description: &str,
        order_id: Option<Uuid>,
    ) -> Result<Option<LoyaltyLedgerEntry>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["loyalty_earn"])
            .start_timer();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::database("Failed to begin transaction", e))?;

        lock_account(&mut tx, user_id).await?;
        let tier = totals(&mut tx, user_id).await?.tier();
        let points = tier.apply_multiplier(base_points);
        if points <= 0 {
            return Ok(None);
        }

        let expires_at = Utc::now().checked_add_months(Months::new(POINTS_VALIDITY_MONTHS));

        let entry = sqlx::query_as::<_, LoyaltyLedgerEntry>(
            r#"
            INSERT INTO loyalty_ledger (id, user_id, points, entry_type, description, order_id, expires_at)
            VALUES ($1, $2, $3, 'EARN', $4, $5, $6)
            ON CONFLICT (order_id) WHERE entry_type = 'EARN' AND order_id IS NOT NULL DO NOTHING
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(points)
        .bind(description)
        .bind(order_id)
        .bind(expires_at)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| AppError::database("Failed to append loyalty entry", e))?;

        tx.commit()
            .await
            .map_err(|e| AppError::database("Failed to commit loyalty earn", e))?;
        timer.observe_duration();

        match &entry {
            Some(entry) => {
                record_points(entry);
                info!(points = entry.points, tier = ?tier, "Loyalty points earned");
            }
            None => warn!(order_id = ?order_id, "Loyalty points already earned for order"),
        }

        Ok(entry)
    }

    #[instrument(skip(self, description), fields(user_id = %user_id))]
    pub async fn redeem_points(
        &self,
        user_id: &str,
        points: i64,
        description: &str,
    ) -> Result<LoyaltyLedgerEntry, AppError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::database("Failed to begin transaction", e))?;

        lock_account(&mut tx, user_id).await?;
        let entry = redeem_locked(&mut tx, user_id, points, description, None).await?;

        tx.commit()
            .await
            .map_err(|e| AppError::database("Failed to commit loyalty redemption", e))?;

        info!(points, "Loyalty points redeemed");
        Ok(entry)
    }

    /// Manual correction by staff. Negative adjustments cannot take the
    /// balance below zero.
    #[instrument(skip(self, description), fields(user_id = %user_id))]
    pub async fn adjust_points(
        &self,
        user_id: &str,
        points: i64,
        description: &str,
    ) -> Result<LoyaltyLedgerEntry, AppError> {
        if points == 0 {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Adjustment must be non-zero"
            )));
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::database("Failed to begin transaction", e))?;

        lock_account(&mut tx, user_id).await?;
        let current = totals(&mut tx, user_id).await?;
        if current.balance() + points < 0 {
            return Err(AppError::BusinessRule(anyhow::anyhow!(
                "Adjustment of {} would make the balance negative (balance {})",
                points,
                current.balance()
            )));
        }

        let entry = append(
            &mut tx,
            NewEntry {
                user_id,
                points,
                entry_type: LedgerEntryType::AdminAdjust,
                description,
                order_id: None,
                expires_at: None,
            },
        )
        .await?;

        tx.commit()
            .await
            .map_err(|e| AppError::database("Failed to commit loyalty adjustment", e))?;

        info!(points, "Loyalty points adjusted");
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick_policy() -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(5),
            max_elapsed_time: Some(Duration::from_secs(2)),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn database_failures_are_retried() {
        let calls = AtomicU32::new(0);

        let result = retry_transient(quick_policy(), || {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if call < 2 {
                    Err(AppError::DatabaseError(anyhow::anyhow!("connection reset")))
                } else {
                    Ok(call)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn business_rule_failures_are_not_retried() {
        let calls = AtomicU32::new(0);

        let result: Result<(), AppError> = retry_transient(quick_policy(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(AppError::BusinessRule(anyhow::anyhow!("insufficient points"))) }
        })
        .await;

        assert!(matches!(result, Err(AppError::BusinessRule(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn balance_is_earned_minus_redeemed() {
        let totals = LedgerTotals {
            earned: 1_200,
            redeemed: 50,
        };
        assert_eq!(totals.balance(), 1_150);
        assert_eq!(totals.tier(), Tier::Vang);
    }

    #[test]
    fn multiplier_uses_tier_before_the_entry() {
        // 900 earned is still Bac, even if this entry crosses 1000.
        let before = LedgerTotals {
            earned: 900,
            redeemed: 0,
        };
        assert_eq!(before.tier().apply_multiplier(300), 300);
    }
}
