//! In-memory order store for testing.
//!
//! Mirrors the Postgres semantics closely enough for engine and scheduler
//! tests: conditional approve/renew, transactional approve, expiry filters.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: no durability
//! - **Single-process only**

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::error::StoreError;
use crate::models::access_key::{
    AccessKey, ExpiringKey, OwnedKey, PendingRevocation, ProvisionedKey,
};
use crate::models::order::{
    IllegalTransition, NewOrder, Order, OrderId, OrderStatus, OwnerId, Transition,
};
use crate::store::OrderStore;

#[derive(Debug, Default)]
struct Tables {
    next_id: i64,
    orders: BTreeMap<OrderId, Order>,
    keys: Vec<AccessKey>,
    revocations: BTreeMap<String, PendingRevocation>,
}

/// In-memory store for tests.
#[derive(Debug, Default)]
pub struct InMemoryOrderStore {
    tables: RwLock<Tables>,
    fail_next_approve: AtomicBool,
}

impl InMemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `approve_order` or `rekey_order` fail as if the transaction aborted.
    pub fn fail_next_approve(&self) {
        self.fail_next_approve.store(true, Ordering::SeqCst);
    }

    pub fn keys_for(&self, order_id: OrderId) -> Vec<AccessKey> {
        self.read()
            .keys
            .iter()
            .filter(|k| k.order_id == order_id)
            .cloned()
            .collect()
    }

    pub fn key_count(&self) -> usize {
        self.read().keys.len()
    }

    /// Status check, key inserts and the status write happen under one lock.
    fn attach_keys(
        &self,
        order_id: OrderId,
        keys: &[ProvisionedKey],
        expires_at: DateTime<Utc>,
        transition: Transition,
    ) -> Result<(), StoreError> {
        if self.fail_next_approve.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Database(sqlx::Error::Protocol(
                "injected approve failure".into(),
            )));
        }

        let mut tables = self.write();
        let order = tables
            .orders
            .get(&order_id)
            .ok_or(StoreError::NotFound(order_id))?;
        if order.check(transition).is_err() {
            return Err(refused(order, transition));
        }
        for key in keys {
            if tables.keys.iter().any(|k| k.id == key.id) {
                return Err(StoreError::Constraint(format!(
                    "access_keys_pkey: duplicate key {}",
                    key.id
                )));
            }
        }

        if let Some(order) = tables.orders.get_mut(&order_id) {
            order.status = OrderStatus::Approved;
            order.expires_at = Some(expires_at);
        }
        tables.keys.extend(keys.iter().map(|k| AccessKey {
            id: k.id.clone(),
            name: k.name.clone(),
            url: k.url.clone(),
            order_id,
        }));
        Ok(())
    }

    fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().expect("store lock poisoned")
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        self.tables.write().expect("store lock poisoned")
    }
}

fn refused(order: &Order, transition: Transition) -> StoreError {
    StoreError::IllegalTransition {
        order_id: order.id,
        source: IllegalTransition {
            from: order.status,
            transition,
        },
    }
}

fn is_open_until(order: &Order, deadline: DateTime<Utc>) -> bool {
    order.status == OrderStatus::Approved && order.expires_at.is_some_and(|at| at <= deadline)
}

fn is_active(order: &Order, now: DateTime<Utc>) -> bool {
    order.status == OrderStatus::Approved && order.expires_at.is_some_and(|at| at > now)
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn create_order(&self, order: NewOrder) -> Result<OrderId, StoreError> {
        if order.key_count <= 0 {
            return Err(StoreError::Constraint(format!(
                "key_count must be positive, got {}",
                order.key_count
            )));
        }

        let mut tables = self.write();
        tables.next_id += 1;
        let id = OrderId(tables.next_id);
        tables.orders.insert(
            id,
            Order {
                id,
                owner_id: order.owner_id,
                profile: order.profile,
                key_count: order.key_count,
                price: order.price,
                status: OrderStatus::AwaitingPayment,
                created_at: order.created_at,
                expires_at: None,
                closed_at: None,
                reminded_for: None,
            },
        );
        Ok(id)
    }

    async fn get_order(&self, order_id: OrderId) -> Result<Order, StoreError> {
        self.read()
            .orders
            .get(&order_id)
            .cloned()
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

        let mut tables = self.write();
        let order = tables
            .orders
            .get_mut(&order_id)
            .ok_or(StoreError::NotFound(order_id))?;
        order.status = status;
        order.closed_at = Some(closed_at);
        order.expires_at = None;
        Ok(())
    }

    async fn approve_order(
        &self,
        order_id: OrderId,
        keys: &[ProvisionedKey],
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.attach_keys(order_id, keys, expires_at, Transition::Approve)
    }

    async fn rekey_order(
        &self,
        order_id: OrderId,
        keys: &[ProvisionedKey],
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.attach_keys(order_id, keys, expires_at, Transition::Rekey)
    }

    async fn renew_order(&self, order_id: OrderId, extension: Duration) -> Result<(), StoreError> {
        let mut tables = self.write();
        let order = tables
            .orders
            .get_mut(&order_id)
            .ok_or(StoreError::NotFound(order_id))?;
        match (order.status, order.expires_at) {
            (OrderStatus::Approved, Some(at)) => {
                order.expires_at = Some(at + extension);
                Ok(())
            }
            _ => Err(refused(order, Transition::Renew)),
        }
    }

    async fn count_active_keys(
        &self,
        owner_id: OwnerId,
        now: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let tables = self.read();
        let count = tables
            .keys
            .iter()
            .filter(|k| {
                tables
                    .orders
                    .get(&k.order_id)
                    .is_some_and(|o| o.owner_id == owner_id && is_active(o, now))
            })
            .count();
        Ok(count as i64)
    }

    async fn list_active_keys_for_owner(
        &self,
        owner_id: OwnerId,
        now: DateTime<Utc>,
    ) -> Result<Vec<OwnedKey>, StoreError> {
        let tables = self.read();
        let mut keys: Vec<OwnedKey> = tables
            .keys
            .iter()
            .filter_map(|k| {
                let order = tables.orders.get(&k.order_id)?;
                if order.owner_id != owner_id || !is_active(order, now) {
                    return None;
                }
                Some(OwnedKey {
                    id: k.id.clone(),
                    name: k.name.clone(),
                    url: k.url.clone(),
                    order_id: order.id,
                    price: order.price,
                    expires_at: order.expires_at?,
                })
            })
            .collect();
        keys.sort_by(|a, b| (a.order_id, &a.id).cmp(&(b.order_id, &b.id)));
        Ok(keys)
    }

    async fn list_expiring_keys(
        &self,
        within: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<ExpiringKey>, StoreError> {
        let deadline = now + within;
        let tables = self.read();
        let mut rows = Vec::new();

        for order in tables.orders.values() {
            let Some(expires_at) = order.expires_at.filter(|_| is_open_until(order, deadline))
            else {
                continue;
            };
            let row = |key: Option<&AccessKey>| ExpiringKey {
                key_id: key.map(|k| k.id.clone()),
                key_name: key.map(|k| k.name.clone()),
                order_id: order.id,
                owner_id: order.owner_id,
                profile: order.profile.clone(),
                key_count: order.key_count,
                price: order.price,
                expires_at,
                reminded_for: order.reminded_for,
            };

            let keys: Vec<&AccessKey> =
                tables.keys.iter().filter(|k| k.order_id == order.id).collect();
            if keys.is_empty() {
                rows.push(row(None));
            } else {
                rows.extend(keys.into_iter().map(|k| row(Some(k))));
            }
        }

        rows.sort_by(|a, b| (a.order_id, &a.key_id).cmp(&(b.order_id, &b.key_id)));
        Ok(rows)
    }

    async fn list_order_keys(&self, order_id: OrderId) -> Result<Vec<AccessKey>, StoreError> {
        let mut keys = self.keys_for(order_id);
        keys.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(keys)
    }

    async fn list_active_orders(&self) -> Result<Vec<Order>, StoreError> {
        Ok(self
            .read()
            .orders
            .values()
            .filter(|o| o.status == OrderStatus::Approved)
            .cloned()
            .collect())
    }

    async fn delete_all_keys(&self) -> Result<u64, StoreError> {
        let mut tables = self.write();
        let deleted = tables.keys.len() as u64;
        tables.keys.clear();
        Ok(deleted)
    }

    async fn release_keys(&self, order_id: OrderId) -> Result<u64, StoreError> {
        let mut tables = self.write();
        let before = tables.keys.len();
        tables.keys.retain(|k| k.order_id != order_id);
        Ok((before - tables.keys.len()) as u64)
    }

    async fn mark_renewal_reminded(
        &self,
        order_id: OrderId,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tables = self.write();
        let order = tables
            .orders
            .get_mut(&order_id)
            .ok_or(StoreError::NotFound(order_id))?;
        order.reminded_for = Some(expires_at);
        Ok(())
    }

    async fn record_pending_revocation(
        &self,
        revocation: PendingRevocation,
    ) -> Result<(), StoreError> {
        let mut tables = self.write();
        match tables.revocations.get_mut(&revocation.key_id) {
            Some(existing) => {
                existing.attempts += 1;
                existing.reason = revocation.reason;
            }
            None => {
                tables
                    .revocations
                    .insert(revocation.key_id.clone(), revocation);
            }
        }
        Ok(())
    }

    async fn list_pending_revocations(&self) -> Result<Vec<PendingRevocation>, StoreError> {
        Ok(self.read().revocations.values().cloned().collect())
    }

    async fn resolve_pending_revocation(&self, key_id: &str) -> Result<(), StoreError> {
        self.write().revocations.remove(key_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::order::OwnerProfile;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn new_order(owner: i64, key_count: i32) -> NewOrder {
        NewOrder {
            owner_id: OwnerId(owner),
            profile: OwnerProfile::default(),
            key_count,
            price: 150 * i64::from(key_count),
            created_at: t0(),
        }
    }

    fn key(id: &str) -> ProvisionedKey {
        ProvisionedKey {
            id: id.into(),
            name: format!("key-{id}"),
            url: format!("ss://{id}"),
        }
    }

    #[tokio::test]
    async fn rejects_non_positive_key_count() {
        let store = InMemoryOrderStore::new();
        let err = store.create_order(new_order(1, 0)).await.unwrap_err();
        assert!(matches!(err, StoreError::Constraint(_)));
    }

    #[tokio::test]
    async fn approve_refuses_closed_orders_and_writes_nothing() {
        let store = InMemoryOrderStore::new();
        let id = store.create_order(new_order(1, 1)).await.unwrap();
        store
            .close_order(id, OrderStatus::Rejected, t0())
            .await
            .unwrap();

        let err = store
            .approve_order(id, &[key("a")], t0() + Duration::days(30))
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::IllegalTransition { .. }));
        assert!(store.keys_for(id).is_empty());
        assert_eq!(
            store.get_order(id).await.unwrap().status,
            OrderStatus::Rejected
        );
    }

    #[tokio::test]
    async fn expiring_query_skips_closed_orders() {
        let store = InMemoryOrderStore::new();
        let open = store.create_order(new_order(1, 1)).await.unwrap();
        let closed = store.create_order(new_order(1, 1)).await.unwrap();
        store.approve_order(open, &[key("a")], t0()).await.unwrap();
        store.approve_order(closed, &[key("b")], t0()).await.unwrap();
        store
            .close_order(closed, OrderStatus::Expired, t0())
            .await
            .unwrap();

        let expired = store
            .list_expiring_keys(Duration::zero(), t0() + Duration::seconds(1))
            .await
            .unwrap();

        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].order_id, open);
    }

    #[tokio::test]
    async fn second_approve_is_refused_and_adds_no_keys() {
        let store = InMemoryOrderStore::new();
        let id = store.create_order(new_order(1, 1)).await.unwrap();
        store
            .approve_order(id, &[key("a")], t0() + Duration::days(30))
            .await
            .unwrap();

        let err = store
            .approve_order(id, &[key("b")], t0() + Duration::days(30))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            StoreError::IllegalTransition {
                source: IllegalTransition {
                    from: OrderStatus::Approved,
                    transition: Transition::Approve,
                },
                ..
            }
        ));
        assert_eq!(store.keys_for(id).len(), 1);
    }

    #[tokio::test]
    async fn rekey_needs_an_approved_order() {
        let store = InMemoryOrderStore::new();
        let id = store.create_order(new_order(1, 1)).await.unwrap();

        let err = store.rekey_order(id, &[key("a")], t0()).await.unwrap_err();
        assert!(matches!(err, StoreError::IllegalTransition { .. }));

        store.approve_order(id, &[key("a")], t0()).await.unwrap();
        store.delete_all_keys().await.unwrap();
        store
            .rekey_order(id, &[key("b")], t0() + Duration::days(1))
            .await
            .unwrap();

        let keys = store.keys_for(id);
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].id, "b");
        assert_eq!(
            store.get_order(id).await.unwrap().expires_at,
            Some(t0() + Duration::days(1))
        );
    }

    #[tokio::test]
    async fn expiring_query_includes_open_orders_without_keys() {
        let store = InMemoryOrderStore::new();
        let id = store.create_order(new_order(1, 2)).await.unwrap();
        store.approve_order(id, &[key("a")], t0()).await.unwrap();
        store.delete_all_keys().await.unwrap();

        let rows = store
            .list_expiring_keys(Duration::zero(), t0() + Duration::seconds(1))
            .await
            .unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].order_id, id);
        assert_eq!(rows[0].key_id, None);
        assert_eq!(rows[0].key_ref(), None);
    }

    #[tokio::test]
    async fn re_recording_a_revocation_bumps_attempts() {
        let store = InMemoryOrderStore::new();
        let id = store.create_order(new_order(1, 1)).await.unwrap();
        let revocation = PendingRevocation {
            key_id: "k".into(),
            key_name: "n".into(),
            order_id: id,
            reason: "first".into(),
            attempts: 1,
            recorded_at: t0(),
        };
        store
            .record_pending_revocation(revocation.clone())
            .await
            .unwrap();
        store
            .record_pending_revocation(PendingRevocation {
                reason: "second".into(),
                ..revocation
            })
            .await
            .unwrap();

        let pending = store.list_pending_revocations().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempts, 2);
        assert_eq!(pending[0].reason, "second");
    }
}
