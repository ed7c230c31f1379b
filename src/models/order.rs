//! Order data models, the order status state machine and API request/response types.
//!
//! This module defines:
//! - `Order`: Database entity representing one purchase request
//! - `OrderStatus` / `Transition`: The closed status enum and its legal moves
//! - `Recipient`: Addressing value for outbound notifications
//! - Request/response bodies for the ordering endpoints

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::access_key::{KeyRef, ProvisionedKey};

/// Store-assigned order identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct OrderId(pub i64);

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque external user identifier (the chat id of the owner).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct OwnerId(pub i64);

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Display name snapshot taken when the order is placed. Never re-synced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct OwnerProfile {
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

/// Who a notification goes to.
///
/// The chat gateway accepts either `@username` or a numeric id; `resolve`
/// picks the address so call sites never have to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub id: OwnerId,
    pub username: Option<String>,
}

impl Recipient {
    pub fn id(id: OwnerId) -> Self {
        Self { id, username: None }
    }

    pub fn with_profile(id: OwnerId, profile: &OwnerProfile) -> Self {
        Self {
            id,
            username: profile.username.clone().filter(|u| !u.is_empty()),
        }
    }

    /// Address understood by the chat gateway.
    pub fn resolve(&self) -> String {
        match &self.username {
            Some(username) => format!("@{username}"),
            None => self.id.to_string(),
        }
    }
}

/// Order status.
///
/// Stored as the Postgres enum `order_status`. `Rejected` and `Expired` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "order_status", rename_all = "snake_case")]
pub enum OrderStatus {
    AwaitingPayment,
    Approved,
    Rejected,
    Expired,
}

/// Events that move an order between statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    /// Operator confirmed payment; keys get provisioned.
    Approve,
    /// Operator refused payment.
    Reject,
    /// Operator declined a renewal prompt.
    DeclineRenewal,
    /// Operator confirmed a renewal payment; only the expiry moves.
    Renew,
    /// Expiry passed without renewal.
    Expire,
    /// Keys re-created on a new provisioning backend.
    Rekey,
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Transition::Approve => "approve",
            Transition::Reject => "reject",
            Transition::DeclineRenewal => "decline_renewal",
            Transition::Renew => "renew",
            Transition::Expire => "expire",
            Transition::Rekey => "rekey",
        };
        f.write_str(name)
    }
}

/// A transition that the state machine does not allow from the current status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("cannot {transition} an order that is {from:?}")]
pub struct IllegalTransition {
    pub from: OrderStatus,
    pub transition: Transition,
}

impl OrderStatus {
    /// Status after applying `transition`, or the reason it is not allowed.
    pub fn apply(self, transition: Transition) -> Result<OrderStatus, IllegalTransition> {
        use OrderStatus::*;
        use Transition::*;

        match (self, transition) {
            (AwaitingPayment, Approve) => Ok(Approved),
            (AwaitingPayment, Reject | DeclineRenewal) => Ok(Rejected),
            (Approved, Renew | Rekey) => Ok(Approved),
            (Approved, DeclineRenewal) => Ok(Rejected),
            (Approved, Expire) => Ok(Expired),
            (from, transition) => Err(IllegalTransition { from, transition }),
        }
    }

    pub fn is_closed(self) -> bool {
        matches!(self, OrderStatus::Rejected | OrderStatus::Expired)
    }
}

/// Represents an order record from the database.
///
/// # Database Table
///
/// Maps to the `orders` table. `expires_at` is set only while the order is
/// `Approved`; closing an order clears it.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct Order {
    pub id: OrderId,
    pub owner_id: OwnerId,
    #[sqlx(flatten)]
    pub profile: OwnerProfile,
    /// Requested number of keys; exactly this many exist once approved.
    pub key_count: i32,
    /// Whole currency units, `key_count * price_per_key`.
    pub price: i64,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    /// The `expires_at` value a renewal reminder was last delivered for.
    pub reminded_for: Option<DateTime<Utc>>,
}

impl Order {
    pub fn recipient(&self) -> Recipient {
        Recipient::with_profile(self.owner_id, &self.profile)
    }

    /// Checks `transition` against the current status without changing anything.
    pub fn check(&self, transition: Transition) -> Result<OrderStatus, IllegalTransition> {
        self.status.apply(transition)
    }
}

/// Price of an order for `key_count` keys.
pub fn order_price(key_count: i32, price_per_key: i64) -> i64 {
    i64::from(key_count) * price_per_key
}

/// Insert parameters for a new order (always created `AwaitingPayment`).
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub owner_id: OwnerId,
    pub profile: OwnerProfile,
    pub key_count: i32,
    pub price: i64,
    pub created_at: DateTime<Utc>,
}

/// Request body identifying the owner of a conversation.
///
/// # JSON Example
///
/// ```json
/// { "owner_id": 123456789 }
/// ```
#[derive(Debug, Deserialize)]
pub struct OwnerRequest {
    pub owner_id: OwnerId,
}

/// Key-count menu returned when an owner starts ordering.
#[derive(Debug, Serialize)]
pub struct BeginOrderResponse {
    pub active_keys: i64,
    pub options: Vec<i32>,
}

/// Request body for placing an order.
///
/// # JSON Example
///
/// ```json
/// {
///   "owner_id": 123456789,
///   "profile": { "username": "alice", "first_name": "Alice", "last_name": null },
///   "key_count": 2
/// }
/// ```
#[derive(Debug, Deserialize)]
pub struct PlaceOrderRequest {
    pub owner_id: OwnerId,
    #[serde(default)]
    pub profile: OwnerProfile,
    pub key_count: i32,
}

/// Response body for a placed order. Payment happens out of band.
#[derive(Debug, Serialize)]
pub struct PlacedOrderResponse {
    pub order_id: OrderId,
    pub key_count: i32,
    pub price: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_url: Option<String>,
}

/// Response body for order endpoints. Omits the reminder bookkeeping.
#[derive(Debug, Serialize)]
pub struct OrderResponse {
    pub id: OrderId,
    pub owner_id: OwnerId,
    pub profile: OwnerProfile,
    pub key_count: i32,
    pub price: i64,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl From<Order> for OrderResponse {
    fn from(order: Order) -> Self {
        Self {
            id: order.id,
            owner_id: order.owner_id,
            profile: order.profile,
            key_count: order.key_count,
            price: order.price,
            status: order.status,
            created_at: order.created_at,
            expires_at: order.expires_at,
            closed_at: order.closed_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub cancelled: bool,
}

#[derive(Debug, Serialize)]
pub struct ApprovedOrderResponse {
    pub order: OrderResponse,
    pub keys: Vec<ProvisionedKey>,
}

#[derive(Debug, Serialize)]
pub struct DeclinedRenewalResponse {
    pub order: OrderResponse,
    pub revoked: Vec<KeyRef>,
    /// Keys whose remote deletion failed and is queued for retry
    pub deferred: Vec<KeyRef>,
}

#[derive(Debug, Deserialize)]
pub struct MigrationRequest {
    pub endpoint: String,
}
