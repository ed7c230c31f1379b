//! Expiration workflow run by the scheduler.
//!
//! - `notify_expiring`: renewal reminders for orders expiring inside the window
//! - `deactivate_expired`: closes orders past expiry and revokes their keys
//!
//! Both process each order on its own. A failure is logged with the order id
//! and the batch carries on.

use chrono::{DateTime, Duration, Utc};

use crate::error::StoreError;
use crate::models::access_key::{ExpiringKey, KeyRef, PendingRevocation};
use crate::models::notification::{Action, Command, Event, OrderSummary};
use crate::models::order::{OrderId, OrderStatus, OwnerId, OwnerProfile, Recipient, Transition};
use crate::services::lifecycle::LifecycleEngine;

/// One open order and its keys, as returned by the expiry query.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpiringOrder {
    pub order_id: OrderId,
    pub owner_id: OwnerId,
    pub profile: OwnerProfile,
    pub key_count: i32,
    pub price: i64,
    pub expires_at: DateTime<Utc>,
    pub reminded_for: Option<DateTime<Utc>>,
    pub keys: Vec<KeyRef>,
}

impl ExpiringOrder {
    fn recipient(&self) -> Recipient {
        Recipient::with_profile(self.owner_id, &self.profile)
    }

    fn summary(&self, status: OrderStatus) -> OrderSummary {
        OrderSummary {
            id: self.order_id,
            owner_id: self.owner_id,
            profile: self.profile.clone(),
            key_count: self.key_count,
            price: self.price,
            status,
            expires_at: Some(self.expires_at),
        }
    }

    /// A reminder already went out for the current expiry.
    fn already_reminded(&self) -> bool {
        self.reminded_for == Some(self.expires_at)
    }
}

/// Groups expiring keys by order, keeping the query's order.
///
/// A keyless row still opens a group, so an order without keys expires too.
pub fn group_expiring(keys: Vec<ExpiringKey>) -> Vec<ExpiringOrder> {
    let mut groups: Vec<ExpiringOrder> = Vec::new();

    for key in keys {
        let key_ref = key.key_ref();
        let index = match groups.iter().position(|g| g.order_id == key.order_id) {
            Some(index) => index,
            None => {
                groups.push(ExpiringOrder {
                    order_id: key.order_id,
                    owner_id: key.owner_id,
                    profile: key.profile,
                    key_count: key.key_count,
                    price: key.price,
                    expires_at: key.expires_at,
                    reminded_for: key.reminded_for,
                    keys: Vec::new(),
                });
                groups.len() - 1
            }
        };
        groups[index].keys.extend(key_ref);
    }

    groups
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReminderReport {
    pub notified: usize,
    pub skipped: usize,
    /// Left unmarked so the next tick tries again.
    pub failed: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RetryReport {
    pub resolved: usize,
    pub still_pending: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeactivationReport {
    pub retried: RetryReport,
    pub expired: Vec<OrderId>,
    pub skipped: usize,
    pub failed: usize,
    pub keys_revoked: usize,
    pub keys_deferred: usize,
}

impl LifecycleEngine {
    /// Send renewal reminders for orders expiring within the policy window.
    ///
    /// # Process
    ///
    /// 1. Query keys of open orders expiring by `now + window`
    /// 2. Group them by order
    /// 3. Skip orders already reminded for their current expiry
    /// 4. Remind the owner (with payment instructions) and prompt the operator
    /// 5. Mark the order reminded once both were delivered
    ///
    /// An order owned by the operator gets the prompt alone. Orders a failed
    /// migration left without keys are reminded and expired like any other.
    pub async fn notify_expiring(&self) -> Result<ReminderReport, StoreError> {
        let now = self.clock.now();
        let keys = self
            .store
            .list_expiring_keys(self.policy.notify_before_expiry, now)
            .await?;

        let mut report = ReminderReport::default();

        for order in group_expiring(keys) {
            if order.already_reminded() {
                report.skipped += 1;
                continue;
            }

            let summary = order.summary(OrderStatus::Approved);
            let operator_prompt = Event::RenewalDue {
                order: summary.clone(),
                keys: order.keys.clone(),
                payment_url: None,
                actions: vec![
                    Action::new(Command::Renew, order.order_id),
                    Action::new(Command::DeclineRenewal, order.order_id),
                ],
            };

            // The operator's own order gets only the prompt; payment instructions are not sent
            let delivered = if self.is_operator(order.owner_id) {
                self.notify(&self.operator(), operator_prompt).await
            } else {
                let owner_reminder = Event::RenewalDue {
                    order: summary,
                    keys: order.keys.clone(),
                    payment_url: self.policy.payment_url.clone(),
                    actions: Vec::new(),
                };
                let to_owner = self.notify(&order.recipient(), owner_reminder).await;
                let to_operator = self.notify(&self.operator(), operator_prompt).await;
                to_owner && to_operator
            };

            if !delivered {
                report.failed += 1;
                continue;
            }

            match self
                .store
                .mark_renewal_reminded(order.order_id, order.expires_at)
                .await
            {
                Ok(()) => {
                    tracing::info!(
                        order_id = %order.order_id,
                        owner_id = %order.owner_id,
                        operation = "notify_expiring",
                        expires_at = %order.expires_at,
                        "Renewal reminder sent"
                    );
                    report.notified += 1;
                }
                Err(e) => {
                    tracing::error!(
                        order_id = %order.order_id,
                        owner_id = %order.owner_id,
                        operation = "notify_expiring",
                        error = %e,
                        "Failed to mark reminder as sent"
                    );
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    /// Close orders past expiry and revoke their keys.
    ///
    /// # Process
    ///
    /// 1. Retry every queued revocation
    /// 2. Query keys of open orders whose expiry has passed
    /// 3. Per order: re-read, close as `Expired`, delete each key remotely,
    ///    release the key rows, notify owner and operator
    ///
    /// A failed key deletion never blocks the order or its sibling keys; it
    /// is queued and retried on the next run.
    pub async fn deactivate_expired(&self) -> Result<DeactivationReport, StoreError> {
        let mut report = DeactivationReport::default();

        match self.retry_pending_revocations().await {
            Ok(retried) => report.retried = retried,
            Err(e) => tracing::error!(
                operation = "deactivate_expired",
                error = %e,
                "Failed to list queued revocations"
            ),
        }

        let now = self.clock.now();
        let keys = self.store.list_expiring_keys(Duration::zero(), now).await?;

        for group in group_expiring(keys) {
            // A renewal may have landed since the query
            match self.store.get_order(group.order_id).await {
                Ok(order)
                    if order.check(Transition::Expire).is_ok()
                        && order.expires_at.is_some_and(|at| at <= now) => {}
                Ok(_) => {
                    report.skipped += 1;
                    continue;
                }
                Err(e) => {
                    tracing::error!(
                        order_id = %group.order_id,
                        owner_id = %group.owner_id,
                        operation = "deactivate_expired",
                        error = %e,
                        "Failed to re-read expiring order"
                    );
                    report.failed += 1;
                    continue;
                }
            }

            if let Err(e) = self
                .store
                .close_order(group.order_id, OrderStatus::Expired, now)
                .await
            {
                tracing::error!(
                    order_id = %group.order_id,
                    owner_id = %group.owner_id,
                    operation = "deactivate_expired",
                    error = %e,
                    "Failed to close expired order"
                );
                report.failed += 1;
                continue;
            }

            let outcome = self
                .revoke_keys(group.order_id, group.keys.clone(), "deactivate_expired")
                .await;
            self.release(group.order_id, "deactivate_expired").await;

            tracing::info!(
                order_id = %group.order_id,
                owner_id = %group.owner_id,
                operation = "deactivate_expired",
                revoked = outcome.revoked.len(),
                deferred = outcome.deferred.len(),
                "Order expired"
            );

            self.notify_owner_and_operator(
                &group.recipient(),
                Event::OrderExpired {
                    order: group.summary(OrderStatus::Expired),
                    revoked: outcome.all_keys(),
                },
            )
            .await;

            report.expired.push(group.order_id);
            report.keys_revoked += outcome.revoked.len();
            report.keys_deferred += outcome.deferred.len();
        }

        Ok(report)
    }

    /// Retry remote deletions that failed earlier. A 404 resolves the entry.
    pub async fn retry_pending_revocations(&self) -> Result<RetryReport, StoreError> {
        let pending = self.store.list_pending_revocations().await?;
        let provisioner = self.provisioner.current();
        let mut report = RetryReport::default();

        for revocation in pending {
            match provisioner.delete_key(&revocation.key_id).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    tracing::warn!(
                        order_id = %revocation.order_id,
                        key_id = %revocation.key_id,
                        attempts = revocation.attempts + 1,
                        error = %e,
                        "Queued revocation failed again"
                    );
                    self.requeue(revocation, e.to_string()).await;
                    report.still_pending += 1;
                    continue;
                }
            }

            match self
                .store
                .resolve_pending_revocation(&revocation.key_id)
                .await
            {
                Ok(()) => report.resolved += 1,
                Err(e) => {
                    tracing::error!(
                        key_id = %revocation.key_id,
                        error = %e,
                        "Failed to clear revoked key from queue"
                    );
                    report.still_pending += 1;
                }
            }
        }

        Ok(report)
    }

    async fn requeue(&self, revocation: PendingRevocation, reason: String) {
        let key_id = revocation.key_id.clone();
        let retry = PendingRevocation {
            reason,
            ..revocation
        };
        if let Err(e) = self.store.record_pending_revocation(retry).await {
            tracing::error!(key_id = %key_id, error = %e, "Failed to requeue revocation");
        }
    }
}
