//! Order store: durable persistence for orders and issued keys.
//!
//! The store is the single source of truth. The lifecycle engine keeps no
//! copies between calls; it re-reads before acting and writes back through
//! these operations.
//!
//! - `postgres`: production implementation on sqlx
//! - `memory`: in-process implementation for tests

#[cfg(test)]
pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::error::StoreError;
use crate::models::access_key::{
    AccessKey, ExpiringKey, OwnedKey, PendingRevocation, ProvisionedKey,
};
use crate::models::order::{NewOrder, Order, OrderId, OrderStatus, OwnerId};

/// Persistence contract for orders and keys.
///
/// Every operation may fail with [`StoreError`]. Multi-row writes
/// (`approve_order`, `rekey_order`) are transactional.
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Checks connectivity.
    async fn health_check(&self) -> Result<(), StoreError>;

    /// Inserts a new order in `AwaitingPayment`.
    ///
    /// Fails with `Constraint` for a non-positive key count.
    async fn create_order(&self, order: NewOrder) -> Result<OrderId, StoreError>;

    /// Fails with `NotFound` if absent.
    async fn get_order(&self, order_id: OrderId) -> Result<Order, StoreError>;

    /// Sets a terminal status and clears the expiry.
    ///
    /// Single-row update. Calling twice overwrites `closed_at`; callers guard
    /// against double-close with a status check.
    async fn close_order(
        &self,
        order_id: OrderId,
        status: OrderStatus,
        closed_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Marks the order `Approved` with `expires_at` and inserts its keys, in one transaction.
    ///
    /// Only an order still `AwaitingPayment` is approved; anything else,
    /// including an order a concurrent call already approved, fails with
    /// `IllegalTransition`. On any failure nothing is written.
    async fn approve_order(
        &self,
        order_id: OrderId,
        keys: &[ProvisionedKey],
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Attaches replacement keys to an `Approved` order and resets its expiry, in one transaction.
    ///
    /// Used by backend migration after the old key rows were wiped. Any other
    /// status fails with `IllegalTransition`.
    async fn rekey_order(
        &self,
        order_id: OrderId,
        keys: &[ProvisionedKey],
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Advances `expires_at` by `extension` without touching the status.
    ///
    /// Only `Approved` orders can be renewed.
    async fn renew_order(&self, order_id: OrderId, extension: Duration) -> Result<(), StoreError>;

    /// Unexpired keys of open orders owned by `owner_id`.
    async fn count_active_keys(&self, owner_id: OwnerId, now: DateTime<Utc>)
    -> Result<i64, StoreError>;

    async fn list_active_keys_for_owner(
        &self,
        owner_id: OwnerId,
        now: DateTime<Utc>,
    ) -> Result<Vec<OwnedKey>, StoreError>;

    /// Keys of open orders whose expiry is at or before `now + within`.
    ///
    /// `within = 0` selects orders already past expiry and still open. An
    /// open order without keys yields one keyless row.
    async fn list_expiring_keys(
        &self,
        within: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<ExpiringKey>, StoreError>;

    /// Keys persisted for one order.
    async fn list_order_keys(&self, order_id: OrderId) -> Result<Vec<AccessKey>, StoreError>;

    /// `Approved` orders.
    async fn list_active_orders(&self) -> Result<Vec<Order>, StoreError>;

    /// Wipes every access key row. Only for replacing the provisioning backend wholesale.
    async fn delete_all_keys(&self) -> Result<u64, StoreError>;

    /// Removes the key rows of one order. Used once its remote keys are revoked.
    async fn release_keys(&self, order_id: OrderId) -> Result<u64, StoreError>;

    /// Remembers that a renewal reminder went out for this expiry.
    async fn mark_renewal_reminded(
        &self,
        order_id: OrderId,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Queues a remote key whose deletion failed. Re-recording bumps `attempts`.
    async fn record_pending_revocation(
        &self,
        revocation: PendingRevocation,
    ) -> Result<(), StoreError>;

    async fn list_pending_revocations(&self) -> Result<Vec<PendingRevocation>, StoreError>;

    async fn resolve_pending_revocation(&self, key_id: &str) -> Result<(), StoreError>;
}
