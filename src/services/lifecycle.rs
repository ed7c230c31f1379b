//! Order lifecycle engine - the order state machine and its side effects.
//!
//! This service handles:
//! - Quota checks and pricing for new orders
//! - Key provisioning on approval, persisted atomically with the status change
//! - Rejection, renewal and declined renewals
//! - Re-keying every active order onto a new provisioning backend
//!
//! # Consistency
//!
//! The engine keeps no state between calls. Every operation re-reads the
//! order, checks the transition, then writes through the store. The remote
//! key server has no transactions: keys created remotely but never persisted
//! are queued in `pending_revocations` and revoked by the deactivation job.
//!
//! Notification failures are logged and never undo a committed change.

use std::sync::Arc;

use chrono::Duration;
use serde::Serialize;

use crate::clock::Clock;
use crate::error::{AppError, ProvisioningError, ValidationError};
use crate::models::access_key::{
    KeyRef, OrderKeys, PendingRevocation, ProvisionedKey, group_by_order,
};
use crate::models::notification::{Action, Command, Event, Notification, OrderSummary};
use crate::models::order::{
    NewOrder, Order, OrderId, OwnerId, OwnerProfile, Recipient, Transition, order_price,
};
use crate::naming::generate_key_name;
use crate::services::notification_service::Notifier;
use crate::services::provisioning::{Connector, KeyProvisioner, ProvisionerHandle};
use crate::store::OrderStore;

/// Largest key count offered in the ordering menu.
pub const MENU_MAX_KEYS: i32 = 4;

/// Business rules applied by the engine.
#[derive(Debug, Clone)]
pub struct OrderPolicy {
    pub order_ttl: Duration,
    pub price_per_key: i64,
    pub max_keys_per_owner: i64,
    /// Bypasses the quota and receives every approval prompt.
    pub operator_id: OwnerId,
    pub notify_before_expiry: Duration,
    pub payment_url: Option<String>,
}

/// What the ordering menu should offer an owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMenu {
    pub active_keys: i64,
    pub options: Vec<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacedOrder {
    pub order_id: OrderId,
    pub key_count: i32,
    pub price: i64,
}

#[derive(Debug, Clone)]
pub struct ApprovedOrder {
    pub order: Order,
    pub keys: Vec<ProvisionedKey>,
}

/// Result of revoking one order's keys at the key server.
#[derive(Debug, Clone, Default)]
pub struct RevocationOutcome {
    pub revoked: Vec<KeyRef>,
    /// Deletions that failed and were queued for retry.
    pub deferred: Vec<KeyRef>,
}

impl RevocationOutcome {
    pub fn all_keys(&self) -> Vec<KeyRef> {
        self.revoked.iter().chain(&self.deferred).cloned().collect()
    }
}

#[derive(Debug, Clone)]
pub struct DeclinedRenewal {
    pub order: Order,
    pub revocation: RevocationOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationFailure {
    pub order_id: OrderId,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    pub endpoint: String,
    pub keys_wiped: u64,
    pub migrated: Vec<OrderId>,
    pub failed: Vec<MigrationFailure>,
}

/// Keys created before a batch failed.
struct PartialBatch {
    error: ProvisioningError,
    created: Vec<ProvisionedKey>,
}

/// Drives orders through their lifecycle.
///
/// Cheap to clone; the HTTP handlers and both scheduler jobs share one.
#[derive(Clone)]
pub struct LifecycleEngine {
    pub(super) store: Arc<dyn OrderStore>,
    pub(super) provisioner: Arc<ProvisionerHandle>,
    connector: Connector,
    notifier: Arc<dyn Notifier>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) policy: Arc<OrderPolicy>,
}

impl LifecycleEngine {
    pub fn new(
        store: Arc<dyn OrderStore>,
        provisioner: Arc<ProvisionerHandle>,
        connector: Connector,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        policy: OrderPolicy,
    ) -> Self {
        Self {
            store,
            provisioner,
            connector,
            notifier,
            clock,
            policy: Arc::new(policy),
        }
    }

    pub fn policy(&self) -> &OrderPolicy {
        &self.policy
    }

    pub fn is_operator(&self, owner_id: OwnerId) -> bool {
        owner_id == self.policy.operator_id
    }

    pub fn provisioning_endpoint(&self) -> String {
        self.provisioner.current().endpoint().to_string()
    }

    pub async fn health_check(&self) -> Result<(), AppError> {
        self.store.health_check().await?;
        Ok(())
    }

    /// Checks the quota and computes the key counts an owner may order.
    ///
    /// # Errors
    ///
    /// - `QuotaExceeded`: the owner has no room for even one more key
    pub async fn key_menu(&self, owner_id: OwnerId) -> Result<KeyMenu, AppError> {
        let active_keys = self
            .store
            .count_active_keys(owner_id, self.clock.now())
            .await?;

        if self.is_operator(owner_id) {
            return Ok(KeyMenu {
                active_keys,
                options: (1..=MENU_MAX_KEYS).collect(),
            });
        }

        let remaining = self.policy.max_keys_per_owner - active_keys;
        if remaining <= 0 {
            return Err(ValidationError::QuotaExceeded {
                active: active_keys,
                requested: 1,
                max: self.policy.max_keys_per_owner,
            }
            .into());
        }

        let top = remaining.min(i64::from(MENU_MAX_KEYS)) as i32;
        Ok(KeyMenu {
            active_keys,
            options: (1..=top).collect(),
        })
    }

    /// Place a new order awaiting payment.
    ///
    /// # Process
    ///
    /// 1. Validate the key count and the owner's quota
    /// 2. Price the order
    /// 3. Persist it as `AwaitingPayment`
    /// 4. Prompt the operator to approve or reject
    ///
    /// # Errors
    ///
    /// - `InvalidKeyCount`: key count is zero or negative
    /// - `QuotaExceeded`: active keys plus `key_count` would pass the limit
    pub async fn place(
        &self,
        owner_id: OwnerId,
        profile: OwnerProfile,
        key_count: i32,
    ) -> Result<PlacedOrder, AppError> {
        if key_count <= 0 {
            return Err(ValidationError::InvalidKeyCount(key_count).into());
        }

        let now = self.clock.now();

        if !self.is_operator(owner_id) {
            let active = self.store.count_active_keys(owner_id, now).await?;
            let max = self.policy.max_keys_per_owner;
            if active + i64::from(key_count) > max {
                return Err(ValidationError::QuotaExceeded {
                    active,
                    requested: key_count,
                    max,
                }
                .into());
            }
        }

        let price = order_price(key_count, self.policy.price_per_key);
        let order_id = self
            .store
            .create_order(NewOrder {
                owner_id,
                profile,
                key_count,
                price,
                created_at: now,
            })
            .await?;

        tracing::info!(
            order_id = %order_id,
            owner_id = %owner_id,
            operation = "place",
            key_count,
            price,
            "Order placed"
        );

        let order = self.store.get_order(order_id).await?;
        self.notify(
            &self.operator(),
            Event::OrderPlaced {
                order: OrderSummary::from(&order),
                actions: vec![
                    Action::new(Command::Approve, order_id),
                    Action::new(Command::Reject, order_id),
                ],
            },
        )
        .await;

        Ok(PlacedOrder {
            order_id,
            key_count,
            price,
        })
    }

    /// Approve a paid order: provision its keys and activate it.
    ///
    /// # Process
    ///
    /// 1. Re-read the order and check it may be approved
    /// 2. Create `key_count` keys one after another
    /// 3. Persist status, expiry and keys in one store transaction
    /// 4. Send the keys to the owner and echo them to the operator
    ///
    /// A failure in step 2 or 3 leaves the order `AwaitingPayment` with no
    /// persisted keys. Keys already created remotely are queued for revocation.
    /// Of two overlapping approvals only one commits in step 3; the other
    /// fails with `IllegalTransition` and its keys are queued the same way.
    ///
    /// # Errors
    ///
    /// - `IllegalTransition`: the order is not awaiting payment
    /// - `Provisioning`: the key server failed
    /// - `Store`: the order is missing or persisting failed
    pub async fn approve(&self, order_id: OrderId) -> Result<ApprovedOrder, AppError> {
        let order = self.store.get_order(order_id).await?;
        let status = order.check(Transition::Approve).map_err(ValidationError::from)?;

        let provisioner = self.provisioner.current();
        let keys = match provision_batch(provisioner.as_ref(), &order).await {
            Ok(keys) => keys,
            Err(partial) => {
                tracing::error!(
                    order_id = %order_id,
                    owner_id = %order.owner_id,
                    operation = "approve",
                    endpoint = provisioner.endpoint(),
                    created = partial.created.len(),
                    error = %partial.error,
                    "Key provisioning failed"
                );
                self.queue_orphans(order_id, &partial.created, "approve: provisioning failed")
                    .await;
                return Err(partial.error.into());
            }
        };

        let expires_at = self.clock.now() + self.policy.order_ttl;
        if let Err(e) = self.store.approve_order(order_id, &keys, expires_at).await {
            tracing::error!(
                order_id = %order_id,
                owner_id = %order.owner_id,
                operation = "approve",
                error = %e,
                "Persisting approval failed"
            );
            self.queue_orphans(order_id, &keys, "approve: persisting failed")
                .await;
            return Err(e.into());
        }

        let order = Order {
            status,
            expires_at: Some(expires_at),
            ..order
        };

        tracing::info!(
            order_id = %order_id,
            owner_id = %order.owner_id,
            operation = "approve",
            key_count = keys.len(),
            expires_at = %expires_at,
            "Order approved"
        );

        self.notify_owner_and_operator(
            &order.recipient(),
            Event::OrderApproved {
                order: OrderSummary::from(&order),
                keys: keys.clone(),
            },
        )
        .await;

        Ok(ApprovedOrder { order, keys })
    }

    /// Reject an order awaiting payment. Nothing was provisioned, so nothing is revoked.
    pub async fn reject(&self, order_id: OrderId) -> Result<Order, AppError> {
        let order = self.store.get_order(order_id).await?;
        let status = order.check(Transition::Reject).map_err(ValidationError::from)?;

        let now = self.clock.now();
        self.store.close_order(order_id, status, now).await?;

        let order = Order {
            status,
            closed_at: Some(now),
            expires_at: None,
            ..order
        };

        tracing::info!(
            order_id = %order_id,
            owner_id = %order.owner_id,
            operation = "reject",
            "Order rejected"
        );

        self.notify_owner_and_operator(
            &order.recipient(),
            Event::OrderRejected {
                order: OrderSummary::from(&order),
            },
        )
        .await;

        Ok(order)
    }

    /// Extend an active order by one TTL.
    ///
    /// The extension is relative to the current expiry, so two renewals add
    /// two TTLs. Keys are untouched.
    pub async fn renew(&self, order_id: OrderId) -> Result<Order, AppError> {
        let order = self.store.get_order(order_id).await?;
        order.check(Transition::Renew).map_err(ValidationError::from)?;

        self.store
            .renew_order(order_id, self.policy.order_ttl)
            .await?;
        let order = self.store.get_order(order_id).await?;

        tracing::info!(
            order_id = %order_id,
            owner_id = %order.owner_id,
            operation = "renew",
            expires_at = ?order.expires_at,
            "Order renewed"
        );

        self.notify_owner_and_operator(
            &order.recipient(),
            Event::OrderRenewed {
                order: OrderSummary::from(&order),
            },
        )
        .await;

        Ok(order)
    }

    /// Decline a renewal: close the order as `Rejected` and revoke its keys now.
    ///
    /// Closed orders are never visited by the expiration job again, so the
    /// keys are revoked here. Each deletion is independent; failures are
    /// queued for retry.
    pub async fn reject_renewal(&self, order_id: OrderId) -> Result<DeclinedRenewal, AppError> {
        let order = self.store.get_order(order_id).await?;
        let status = order
            .check(Transition::DeclineRenewal)
            .map_err(ValidationError::from)?;

        let keys: Vec<KeyRef> = self
            .store
            .list_order_keys(order_id)
            .await?
            .into_iter()
            .map(|k| KeyRef { id: k.id, name: k.name })
            .collect();

        let now = self.clock.now();
        self.store.close_order(order_id, status, now).await?;

        let revocation = self.revoke_keys(order_id, keys, "decline_renewal").await;
        self.release(order_id, "decline_renewal").await;

        let order = Order {
            status,
            closed_at: Some(now),
            expires_at: None,
            ..order
        };

        tracing::info!(
            order_id = %order_id,
            owner_id = %order.owner_id,
            operation = "decline_renewal",
            revoked = revocation.revoked.len(),
            deferred = revocation.deferred.len(),
            "Renewal declined"
        );

        self.notify_owner_and_operator(
            &order.recipient(),
            Event::RenewalDeclined {
                order: OrderSummary::from(&order),
                revoked: revocation.all_keys(),
            },
        )
        .await;

        Ok(DeclinedRenewal { order, revocation })
    }

    /// Active keys of one owner, grouped by order.
    pub async fn owner_keys(&self, owner_id: OwnerId) -> Result<Vec<OrderKeys>, AppError> {
        let keys = self
            .store
            .list_active_keys_for_owner(owner_id, self.clock.now())
            .await?;
        Ok(group_by_order(keys))
    }

    /// Move every active order onto a new key server.
    ///
    /// # Process
    ///
    /// 1. Connect to `endpoint` (validates the URL)
    /// 2. Snapshot the active orders, then wipe all key rows
    /// 3. Make the new server the live one
    /// 4. Per order: create fresh keys and persist them with the original expiry
    /// 5. Send each owner their new keys
    ///
    /// Orders are migrated independently. One that fails is reported and
    /// left without keys; the rest carry on. Keys on the old server are not
    /// revoked.
    pub async fn migrate_provisioning_backend(
        &self,
        endpoint: &str,
    ) -> Result<MigrationReport, AppError> {
        let target = (self.connector)(endpoint)?;

        let orders = self.store.list_active_orders().await?;
        let keys_wiped = self.store.delete_all_keys().await?;
        let previous = self.provisioner.current();
        self.provisioner.replace(target.clone());

        tracing::warn!(
            from = previous.endpoint(),
            to = target.endpoint(),
            orders = orders.len(),
            keys_wiped,
            operation = "migrate",
            "Provisioning backend replaced"
        );

        let mut report = MigrationReport {
            endpoint: target.endpoint().to_string(),
            keys_wiped,
            migrated: Vec::new(),
            failed: Vec::new(),
        };

        for order in orders {
            match self.rekey(target.as_ref(), &order).await {
                Ok(keys) => {
                    self.notify(
                        &order.recipient(),
                        Event::OrderRekeyed {
                            order: OrderSummary::from(&order),
                            keys,
                        },
                    )
                    .await;
                    report.migrated.push(order.id);
                }
                Err(error) => {
                    tracing::error!(
                        order_id = %order.id,
                        owner_id = %order.owner_id,
                        operation = "migrate",
                        error = %error,
                        "Order migration failed"
                    );
                    report.failed.push(MigrationFailure {
                        order_id: order.id,
                        error: error.to_string(),
                    });
                }
            }
        }

        tracing::info!(
            migrated = report.migrated.len(),
            failed = report.failed.len(),
            operation = "migrate",
            "Migration finished"
        );

        Ok(report)
    }

    async fn rekey(
        &self,
        provisioner: &dyn KeyProvisioner,
        order: &Order,
    ) -> Result<Vec<ProvisionedKey>, AppError> {
        order.check(Transition::Rekey).map_err(ValidationError::from)?;
        let expires_at = order
            .expires_at
            .ok_or_else(|| AppError::InvalidRequest(format!("order {} has no expiry", order.id)))?;

        let keys = match provision_batch(provisioner, order).await {
            Ok(keys) => keys,
            Err(partial) => {
                self.queue_orphans(order.id, &partial.created, "migrate: provisioning failed")
                    .await;
                return Err(partial.error.into());
            }
        };

        if let Err(e) = self.store.rekey_order(order.id, &keys, expires_at).await {
            self.queue_orphans(order.id, &keys, "migrate: persisting failed")
                .await;
            return Err(e.into());
        }

        Ok(keys)
    }

    /// Revoke keys one by one. A remote 404 counts as revoked.
    pub(super) async fn revoke_keys(
        &self,
        order_id: OrderId,
        keys: Vec<KeyRef>,
        operation: &'static str,
    ) -> RevocationOutcome {
        let provisioner = self.provisioner.current();
        let mut outcome = RevocationOutcome::default();

        for key in keys {
            match provisioner.delete_key(&key.id).await {
                Ok(()) => outcome.revoked.push(key),
                Err(e) if e.is_not_found() => {
                    tracing::debug!(
                        order_id = %order_id,
                        key_id = %key.id,
                        operation,
                        "Key already gone at the key server"
                    );
                    outcome.revoked.push(key);
                }
                Err(e) => {
                    tracing::warn!(
                        order_id = %order_id,
                        key_id = %key.id,
                        operation,
                        error = %e,
                        "Key revocation failed, queued for retry"
                    );
                    self.defer_revocation(order_id, &key, format!("{operation}: {e}"))
                        .await;
                    outcome.deferred.push(key);
                }
            }
        }

        outcome
    }

    pub(super) async fn release(&self, order_id: OrderId, operation: &'static str) {
        if let Err(e) = self.store.release_keys(order_id).await {
            tracing::error!(
                order_id = %order_id,
                operation,
                error = %e,
                "Failed to release key rows"
            );
        }
    }

    async fn queue_orphans(&self, order_id: OrderId, keys: &[ProvisionedKey], reason: &str) {
        for key in keys {
            let key_ref = KeyRef {
                id: key.id.clone(),
                name: key.name.clone(),
            };
            self.defer_revocation(order_id, &key_ref, reason.to_string())
                .await;
        }
    }

    async fn defer_revocation(&self, order_id: OrderId, key: &KeyRef, reason: String) {
        let revocation = PendingRevocation {
            key_id: key.id.clone(),
            key_name: key.name.clone(),
            order_id,
            reason,
            attempts: 1,
            recorded_at: self.clock.now(),
        };

        if let Err(e) = self.store.record_pending_revocation(revocation).await {
            // Nothing else remembers this key now
            tracing::error!(
                order_id = %order_id,
                key_id = %key.id,
                error = %e,
                "Failed to queue key revocation, manual cleanup required"
            );
        }
    }

    pub(super) fn operator(&self) -> Recipient {
        Recipient::id(self.policy.operator_id)
    }

    /// Sends one notification. Returns whether it was delivered.
    pub(super) async fn notify(&self, recipient: &Recipient, event: Event) -> bool {
        let notification = Notification::new(recipient, event);
        match self.notifier.send(&notification).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    order_id = %notification.event.order_id(),
                    to = %notification.to,
                    event_type = notification.event_type(),
                    error = %e,
                    "Notification delivery failed"
                );
                false
            }
        }
    }

    /// Sends the same event to the owner and the operator, once if they are the same person.
    pub(super) async fn notify_owner_and_operator(&self, owner: &Recipient, event: Event) -> bool {
        if self.is_operator(owner.id) {
            return self.notify(owner, event).await;
        }
        let to_owner = self.notify(owner, event.clone()).await;
        let to_operator = self.notify(&self.operator(), event).await;
        to_owner && to_operator
    }
}

/// Creates `order.key_count` keys in order, stopping at the first failure.
async fn provision_batch(
    provisioner: &dyn KeyProvisioner,
    order: &Order,
) -> Result<Vec<ProvisionedKey>, PartialBatch> {
    let mut created = Vec::with_capacity(usize::try_from(order.key_count).unwrap_or_default());

    for _ in 0..order.key_count {
        let name = generate_key_name();
        match provisioner.create_key(&name).await {
            Ok(key) => created.push(key),
            Err(error) => return Err(PartialBatch { error, created }),
        }
    }

    Ok(created)
}
