//! Access key models.
//!
//! Keys are provisioned by the remote key server; the `id` it assigns is the
//! only identifier used for revocation. Generated names are labels, not
//! identifiers, and may collide.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::order::{OrderId, OwnerId, OwnerProfile};

/// Represents an access key record from the database.
///
/// # Database Table
///
/// Maps to the `access_keys` table. Every key belongs to exactly one order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct AccessKey {
    pub id: String,
    pub name: String,
    pub url: String,
    pub order_id: OrderId,
}

/// A key as returned by the provisioning service, before it is persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionedKey {
    pub id: String,
    pub name: String,
    pub url: String,
}

/// Identifier and label of a key, enough to tell the owner which key changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyRef {
    pub id: String,
    pub name: String,
}

/// Active key joined with its order, for the owner's profile view.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct OwnedKey {
    pub id: String,
    pub name: String,
    pub url: String,
    pub order_id: OrderId,
    pub price: i64,
    pub expires_at: DateTime<Utc>,
}

/// Open order nearing (or past) its expiry, one row per key, with owner context.
///
/// An order left without keys (a failed migration) still yields one row,
/// with `key_id` and `key_name` empty.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ExpiringKey {
    pub key_id: Option<String>,
    pub key_name: Option<String>,
    pub order_id: OrderId,
    pub owner_id: OwnerId,
    #[sqlx(flatten)]
    pub profile: OwnerProfile,
    pub key_count: i32,
    pub price: i64,
    pub expires_at: DateTime<Utc>,
    pub reminded_for: Option<DateTime<Utc>>,
}

impl ExpiringKey {
    pub fn key_ref(&self) -> Option<KeyRef> {
        Some(KeyRef {
            id: self.key_id.clone()?,
            name: self.key_name.clone().unwrap_or_default(),
        })
    }
}

/// Remote key whose deletion has not been confirmed yet.
///
/// # Database Table
///
/// Maps to the `pending_revocations` table.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct PendingRevocation {
    pub key_id: String,
    pub key_name: String,
    pub order_id: OrderId,
    pub reason: String,
    pub attempts: i32,
    pub recorded_at: DateTime<Utc>,
}

/// Keys of one order in the profile view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderKeys {
    pub order_id: OrderId,
    pub price: i64,
    pub expires_at: DateTime<Utc>,
    pub keys: Vec<ProvisionedKey>,
}

/// Response body for `GET /api/v1/owners/{owner_id}/keys`.
#[derive(Debug, Serialize)]
pub struct OwnerKeysResponse {
    pub owner_id: OwnerId,
    pub orders: Vec<OrderKeys>,
}

/// Group keys by order, keeping the order in which orders first appear.
pub fn group_by_order(keys: Vec<OwnedKey>) -> Vec<OrderKeys> {
    let mut groups: Vec<OrderKeys> = Vec::new();

    for key in keys {
        let position = groups.iter().position(|g| g.order_id == key.order_id);
        let group = match position {
            Some(index) => &mut groups[index],
            None => {
                groups.push(OrderKeys {
                    order_id: key.order_id,
                    price: key.price,
                    expires_at: key.expires_at,
                    keys: Vec::new(),
                });
                let last = groups.len() - 1;
                &mut groups[last]
            }
        };

        group.keys.push(ProvisionedKey {
            id: key.id,
            name: key.name,
            url: key.url,
        });
    }

    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owned(id: &str, order: i64) -> OwnedKey {
        OwnedKey {
            id: id.to_string(),
            name: format!("name-{id}"),
            url: format!("ss://{id}"),
            order_id: OrderId(order),
            price: 150 * order,
            expires_at: DateTime::<Utc>::UNIX_EPOCH,
        }
    }

    #[test]
    fn groups_keys_by_order_in_first_seen_order() {
        let groups = group_by_order(vec![owned("a", 2), owned("b", 1), owned("c", 2)]);

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].order_id, OrderId(2));
        assert_eq!(groups[0].price, 300);
        let ids: Vec<_> = groups[0].keys.iter().map(|k| k.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
        assert_eq!(groups[1].order_id, OrderId(1));
        assert_eq!(groups[1].keys.len(), 1);
    }

    #[test]
    fn empty_input_yields_no_groups() {
        assert!(group_by_order(Vec::new()).is_empty());
    }
}
