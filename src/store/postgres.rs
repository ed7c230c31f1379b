//! PostgreSQL order store.
//!
//! # Atomicity Guarantees
//!
//! `approve_order` and `rekey_order` update the order and insert its keys
//! inside one PostgreSQL transaction. Dropping the transaction without commit rolls it
//! back, so every early return leaves the order untouched.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::db::DbPool;
use crate::error::StoreError;
use crate::models::access_key::{
    AccessKey, ExpiringKey, OwnedKey, PendingRevocation, ProvisionedKey,
};
use crate::models::order::{
    IllegalTransition, NewOrder, Order, OrderId, OrderStatus, OwnerId, Transition,
};
use crate::store::OrderStore;

/// Order store backed by the `orders`, `access_keys` and `pending_revocations` tables.
#[derive(Debug, Clone)]
pub struct PgOrderStore {
    pool: DbPool,
}

impl PgOrderStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Moves the order into `Approved` and inserts `keys`, in one transaction.
    ///
    /// The update is conditional on the status `transition` starts from, so of
    /// two overlapping approvals only the first commits.
    async fn attach_keys(
        &self,
        order_id: OrderId,
        keys: &[ProvisionedKey],
        expires_at: DateTime<Utc>,
        transition: Transition,
    ) -> Result<(), StoreError> {
        let from = match transition {
            Transition::Approve => OrderStatus::AwaitingPayment,
            _ => OrderStatus::Approved,
        };

        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE orders
            SET status = 'approved',
                expires_at = $2
            WHERE id = $1
              AND status = $3
            "#,
        )
        .bind(order_id)
        .bind(expires_at)
        .bind(from)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            tx.rollback().await?;
            return Err(self.refused(order_id, transition).await);
        }

        for key in keys {
            sqlx::query(
                r#"
                INSERT INTO access_keys (id, name, url, order_id)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(&key.id)
            .bind(&key.name)
            .bind(&key.url)
            .bind(order_id)
            .execute(&mut *tx)
            .await
            .map_err(constraint_error)?;
        }

        tx.commit().await?;

        Ok(())
    }

    /// Explains why a conditional update touched no rows.
    async fn refused(&self, order_id: OrderId, transition: Transition) -> StoreError {
        let status = sqlx::query_scalar::<_, OrderStatus>("SELECT status FROM orders WHERE id = $1")
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await;

        match status {
            Ok(Some(from)) => StoreError::IllegalTransition {
                order_id,
                source: IllegalTransition { from, transition },
            },
            Ok(None) => StoreError::NotFound(order_id),
            Err(e) => StoreError::Database(e),
        }
    }
}

/// Surface CHECK/FK violations as `Constraint` instead of a generic database fault.
fn constraint_error(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db_err) = &err {
        if let Some(constraint) = db_err.constraint() {
            return StoreError::Constraint(format!("{constraint}: {}", db_err.message()));
        }
    }
    StoreError::Database(err)
}

#[async_trait]
impl OrderStore for PgOrderStore {
    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn create_order(&self, order: NewOrder) -> Result<OrderId, StoreError> {
        if order.key_count <= 0 {
            return Err(StoreError::Constraint(format!(
                "key_count must be positive, got {}",
                order.key_count
            )));
        }

        let order_id = sqlx::query_scalar::<_, OrderId>(
            r#"
            INSERT INTO orders (
                owner_id,
                username,
                first_name,
                last_name,
                key_count,
                price,
                status,
                created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, 'awaiting_payment', $7)
            RETURNING id
            "#,
        )
        .bind(order.owner_id)
        .bind(order.profile.username)
        .bind(order.profile.first_name)
        .bind(order.profile.last_name)
        .bind(order.key_count)
        .bind(order.price)
        .bind(order.created_at)
        .fetch_one(&self.pool)
        .await
        .map_err(constraint_error)?;

        Ok(order_id)
    }

    async fn get_order(&self, order_id: OrderId) -> Result<Order, StoreError> {
        sqlx::query_as::<_, Order>("SELECT * FROM orders WHERE id = $1")
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound(order_id))
    }

    async fn close_order(
        &self,
        order_id: OrderId,
        status: OrderStatus,
        closed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if !status.is_closed() {
            return Err(StoreError::Constraint(format!(
                "{status:?} is not a terminal status"
            )));
        }

        let updated = sqlx::query(
            r#"
            UPDATE orders
            SET status = $2,
                closed_at = $3,
                expires_at = NULL
            WHERE id = $1
            "#,
        )
        .bind(order_id)
        .bind(status)
        .bind(closed_at)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(StoreError::NotFound(order_id));
        }

        Ok(())
    }

    async fn approve_order(
        &self,
        order_id: OrderId,
        keys: &[ProvisionedKey],
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.attach_keys(order_id, keys, expires_at, Transition::Approve)
            .await
    }

    async fn rekey_order(
        &self,
        order_id: OrderId,
        keys: &[ProvisionedKey],
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.attach_keys(order_id, keys, expires_at, Transition::Rekey)
            .await
    }

    async fn renew_order(&self, order_id: OrderId, extension: Duration) -> Result<(), StoreError> {
        // Relative update so concurrent renewals add up instead of overwriting each other
        let updated = sqlx::query(
            r#"
            UPDATE orders
            SET expires_at = expires_at + make_interval(secs => $2)
            WHERE id = $1
              AND status = 'approved'
            "#,
        )
        .bind(order_id)
        .bind(extension.num_seconds() as f64)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(self.refused(order_id, Transition::Renew).await);
        }

        Ok(())
    }

    async fn count_active_keys(
        &self,
        owner_id: OwnerId,
        now: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*)
            FROM access_keys ak
            INNER JOIN orders o ON o.id = ak.order_id
            WHERE o.owner_id = $1
              AND o.status = 'approved'
              AND o.expires_at > $2
            "#,
        )
        .bind(owner_id)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn list_active_keys_for_owner(
        &self,
        owner_id: OwnerId,
        now: DateTime<Utc>,
    ) -> Result<Vec<OwnedKey>, StoreError> {
        let keys = sqlx::query_as::<_, OwnedKey>(
            r#"
            SELECT ak.id, ak.name, ak.url, o.id AS order_id, o.price, o.expires_at
            FROM access_keys ak
            INNER JOIN orders o ON o.id = ak.order_id
            WHERE o.owner_id = $1
              AND o.status = 'approved'
              AND o.expires_at > $2
            ORDER BY o.id, ak.id
            "#,
        )
        .bind(owner_id)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(keys)
    }

    async fn list_expiring_keys(
        &self,
        within: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<ExpiringKey>, StoreError> {
        let keys = sqlx::query_as::<_, ExpiringKey>(
            r#"
            SELECT ak.id AS key_id,
                   ak.name AS key_name,
                   o.id AS order_id,
                   o.owner_id,
                   o.username,
                   o.first_name,
                   o.last_name,
                   o.key_count,
                   o.price,
                   o.expires_at,
                   o.reminded_for
            FROM orders o
            LEFT JOIN access_keys ak ON ak.order_id = o.id
            WHERE o.status = 'approved'
              AND o.expires_at <= $1
            ORDER BY o.id, ak.id
            "#,
        )
        .bind(now + within)
        .fetch_all(&self.pool)
        .await?;

        Ok(keys)
    }

    async fn list_order_keys(&self, order_id: OrderId) -> Result<Vec<AccessKey>, StoreError> {
        let keys = sqlx::query_as::<_, AccessKey>(
            "SELECT id, name, url, order_id FROM access_keys WHERE order_id = $1 ORDER BY id",
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(keys)
    }

    async fn list_active_orders(&self) -> Result<Vec<Order>, StoreError> {
        let orders =
            sqlx::query_as::<_, Order>("SELECT * FROM orders WHERE status = 'approved' ORDER BY id")
                .fetch_all(&self.pool)
                .await?;

        Ok(orders)
    }

    async fn delete_all_keys(&self) -> Result<u64, StoreError> {
        let deleted = sqlx::query("DELETE FROM access_keys")
            .execute(&self.pool)
            .await?
            .rows_affected();

        Ok(deleted)
    }

    async fn release_keys(&self, order_id: OrderId) -> Result<u64, StoreError> {
        let deleted = sqlx::query("DELETE FROM access_keys WHERE order_id = $1")
            .bind(order_id)
            .execute(&self.pool)
            .await?
            .rows_affected();

        Ok(deleted)
    }

    async fn mark_renewal_reminded(
        &self,
        order_id: OrderId,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let updated = sqlx::query("UPDATE orders SET reminded_for = $2 WHERE id = $1")
            .bind(order_id)
            .bind(expires_at)
            .execute(&self.pool)
            .await?
            .rows_affected();

        if updated == 0 {
            return Err(StoreError::NotFound(order_id));
        }

        Ok(())
    }

    async fn record_pending_revocation(
        &self,
        revocation: PendingRevocation,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO pending_revocations (key_id, key_name, order_id, reason, attempts, recorded_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (key_id) DO UPDATE
            SET attempts = pending_revocations.attempts + 1,
                reason = EXCLUDED.reason
            "#,
        )
        .bind(&revocation.key_id)
        .bind(&revocation.key_name)
        .bind(revocation.order_id)
        .bind(&revocation.reason)
        .bind(revocation.attempts)
        .bind(revocation.recorded_at)
        .execute(&self.pool)
        .await
        .map_err(constraint_error)?;

        Ok(())
    }

    async fn list_pending_revocations(&self) -> Result<Vec<PendingRevocation>, StoreError> {
        let revocations = sqlx::query_as::<_, PendingRevocation>(
            "SELECT * FROM pending_revocations ORDER BY recorded_at, key_id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(revocations)
    }

    async fn resolve_pending_revocation(&self, key_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM pending_revocations WHERE key_id = $1")
            .bind(key_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
