//! Pending interactions of the ordering flow, keyed by owner.
//!
//! Begin offers a key-count menu and remembers it here until the owner picks
//! a count, cancels, or the entry expires. The lifecycle engine never reads
//! this store.

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use crate::models::order::OwnerId;

struct PendingInteraction {
    options: Vec<i32>,
    started_at: Instant,
}

pub struct ConversationStore {
    entries: DashMap<OwnerId, PendingInteraction>,
    ttl: Duration,
}

impl ConversationStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Records the menu offered to `owner_id`, replacing any earlier one.
    pub fn begin(&self, owner_id: OwnerId, options: Vec<i32>) {
        self.entries.insert(
            owner_id,
            PendingInteraction {
                options,
                started_at: Instant::now(),
            },
        );
    }

    /// Removes and returns the pending menu, if one is still live.
    pub fn take(&self, owner_id: OwnerId) -> Option<Vec<i32>> {
        let (_, pending) = self.entries.remove(&owner_id)?;
        (pending.started_at.elapsed() < self.ttl).then_some(pending.options)
    }

    /// Drops the pending interaction. Returns whether one was live.
    pub fn cancel(&self, owner_id: OwnerId) -> bool {
        self.take(owner_id).is_some()
    }

    /// Evicts expired entries. Returns how many were removed.
    pub fn cleanup(&self) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, pending| pending.started_at.elapsed() < self.ttl);
        before.saturating_sub(self.entries.len())
    }
}
