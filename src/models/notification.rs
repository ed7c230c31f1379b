//! Outbound notification models.
//!
//! Every state change the lifecycle engine makes is reported to the chat
//! gateway as a signed JSON event. The gateway owns wording and buttons; the
//! payload carries data only.
//!
//! # Delivery Flow
//!
//! 1. The engine commits a state change
//! 2. It builds one `Notification` per recipient (owner, operator)
//! 3. `WebhookNotifier` signs and POSTs each one to the gateway
//! 4. Delivery failures are logged; the state change stays committed

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::models::access_key::{KeyRef, ProvisionedKey};
use crate::models::order::{Order, OrderId, OrderStatus, OwnerId, OwnerProfile, Recipient};

/// Notification sent to the chat gateway.
///
/// # Example
///
/// ```json
/// {
///   "event_id": "550e8400-e29b-41d4-a716-446655440000",
///   "created_at": "2025-01-15T10:30:00Z",
///   "to": "@alice",
///   "recipient_id": 123456789,
///   "event_type": "order.approved",
///   "data": {
///     "order": { "id": 17, "owner_id": 123456789, "key_count": 2, "price": 300, ... },
///     "keys": [ { "id": "41", "name": "brave-otter", "url": "ss://..." } ]
///   }
/// }
/// ```
///
/// # Signature Verification
///
/// The request carries an `X-Signature` header with format `sha256=<hex>`,
/// the HMAC-SHA256 of the body keyed with the shared notify secret.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub event_id: Uuid,
    pub created_at: DateTime<Utc>,
    /// Resolved gateway address (`@username` or numeric id)
    pub to: String,
    pub recipient_id: OwnerId,
    #[serde(flatten)]
    pub event: Event,
}

impl Notification {
    pub fn new(recipient: &Recipient, event: Event) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            created_at: Utc::now(),
            to: recipient.resolve(),
            recipient_id: recipient.id,
            event,
        }
    }

    pub fn event_type(&self) -> &'static str {
        self.event.event_type()
    }
}

/// Order fields shared by every event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderSummary {
    pub id: OrderId,
    pub owner_id: OwnerId,
    pub profile: OwnerProfile,
    pub key_count: i32,
    pub price: i64,
    pub status: OrderStatus,
    pub expires_at: Option<DateTime<Utc>>,
}

impl From<&Order> for OrderSummary {
    fn from(order: &Order) -> Self {
        Self {
            id: order.id,
            owner_id: order.owner_id,
            profile: order.profile.clone(),
            key_count: order.key_count,
            price: order.price,
            status: order.status,
            expires_at: order.expires_at,
        }
    }
}

/// Operator command a gateway button maps back to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    Approve,
    Reject,
    Renew,
    DeclineRenewal,
}

/// Button offered to the operator, keyed by order id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Action {
    pub command: Command,
    pub order_id: OrderId,
}

impl Action {
    pub fn new(command: Command, order_id: OrderId) -> Self {
        Self { command, order_id }
    }
}

/// Event payload. Serialized as `event_type` + `data`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event_type", content = "data")]
pub enum Event {
    /// New order awaiting payment confirmation (operator).
    #[serde(rename = "order.placed")]
    OrderPlaced {
        order: OrderSummary,
        actions: Vec<Action>,
    },
    /// Payment confirmed and keys provisioned (owner and operator).
    #[serde(rename = "order.approved")]
    OrderApproved {
        order: OrderSummary,
        keys: Vec<ProvisionedKey>,
    },
    #[serde(rename = "order.rejected")]
    OrderRejected { order: OrderSummary },
    #[serde(rename = "order.renewed")]
    OrderRenewed { order: OrderSummary },
    /// Expiry is near. Owner receives payment details, operator receives the
    /// renew/decline prompt.
    #[serde(rename = "order.renewal_due")]
    RenewalDue {
        order: OrderSummary,
        keys: Vec<KeyRef>,
        #[serde(skip_serializing_if = "Option::is_none")]
        payment_url: Option<String>,
        actions: Vec<Action>,
    },
    #[serde(rename = "order.renewal_declined")]
    RenewalDeclined {
        order: OrderSummary,
        revoked: Vec<KeyRef>,
    },
    #[serde(rename = "order.expired")]
    OrderExpired {
        order: OrderSummary,
        revoked: Vec<KeyRef>,
    },
    /// Keys re-created on a new provisioning backend; expiry unchanged.
    #[serde(rename = "order.rekeyed")]
    OrderRekeyed {
        order: OrderSummary,
        keys: Vec<ProvisionedKey>,
    },
}

impl Event {
    pub fn event_type(&self) -> &'static str {
        match self {
            Event::OrderPlaced { .. } => "order.placed",
            Event::OrderApproved { .. } => "order.approved",
            Event::OrderRejected { .. } => "order.rejected",
            Event::OrderRenewed { .. } => "order.renewed",
            Event::RenewalDue { .. } => "order.renewal_due",
            Event::RenewalDeclined { .. } => "order.renewal_declined",
            Event::OrderExpired { .. } => "order.expired",
            Event::OrderRekeyed { .. } => "order.rekeyed",
        }
    }

    pub fn order_id(&self) -> OrderId {
        match self {
            Event::OrderPlaced { order, .. }
            | Event::OrderApproved { order, .. }
            | Event::OrderRejected { order }
            | Event::OrderRenewed { order }
            | Event::RenewalDue { order, .. }
            | Event::RenewalDeclined { order, .. }
            | Event::OrderExpired { order, .. }
            | Event::OrderRekeyed { order, .. } => order.id,
        }
    }
}
