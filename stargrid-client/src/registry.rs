//! # Subscription Registry
//!
//! Identity allocation and per-subscription routing state. The registry is
//! owned exclusively by the dispatcher task and mutated only through its
//! command channel, so no lock guards the table; the id allocator is atomic
//! because subscriptions are requested from arbitrary caller tasks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;

use crate::protocol::Tx;

/// A positive integer identifying one transaction subscription, unique for
/// the lifetime of a connection.
pub type SubscriptionId = u64;

/// Monotonic allocator for [`SubscriptionId`]s.
///
/// Ids start at 1 and strictly increase; two concurrent allocations can
/// never observe the same id. The counter restarts when a new session is
/// established.
#[derive(Debug)]
pub(crate) struct SubscriptionIds {
    next: AtomicU64,
}

impl SubscriptionIds {
    pub(crate) fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub(crate) fn next_id(&self) -> SubscriptionId {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn reset(&self) {
        self.next.store(1, Ordering::SeqCst);
    }
}

struct SubscriptionEntry {
    channel: mpsc::Sender<Tx>,
    acknowledged: bool,
}

/// The routing table from subscription id to its event channel, plus the
/// acknowledgement state used to correlate server responses with the
/// request that produced them.
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    entries: HashMap<SubscriptionId, SubscriptionEntry>,
}

impl SubscriptionRegistry {
    pub(crate) fn register(&mut self, id: SubscriptionId, channel: mpsc::Sender<Tx>) {
        tracing::debug!(id, "registering tx subscription");
        self.entries.insert(
            id,
            SubscriptionEntry {
                channel,
                acknowledged: false,
            },
        );
    }

    pub(crate) fn unregister(&mut self, id: SubscriptionId) {
        tracing::debug!(id, "unregistering tx subscription");
        self.entries.remove(&id);
    }

    /// Routes a transaction event to the one subscription carrying its id.
    ///
    /// Events for unknown ids are dropped silently: the registration may
    /// have raced with a local unsubscribe. A send failure means the
    /// consumer dropped its stream, and the entry is removed.
    pub(crate) async fn route(&mut self, tx: Tx) {
        let id = tx.subscription_id;
        let Some(entry) = self.entries.get(&id) else {
            tracing::trace!(id, "tx event for unknown subscription, dropping");
            return;
        };
        if entry.channel.send(tx).await.is_err() {
            tracing::warn!(id, "subscription receiver dropped, removing");
            self.entries.remove(&id);
        }
    }

    /// Resolves the pending acknowledgement for `id`.
    ///
    /// Returns `true` only for the first acknowledgement of a registered,
    /// not-yet-acknowledged subscription; duplicates and unmatched ids
    /// return `false` and are dropped by the caller.
    pub(crate) fn acknowledge(&mut self, id: SubscriptionId) -> bool {
        match self.entries.get_mut(&id) {
            Some(entry) if !entry.acknowledged => {
                entry.acknowledged = true;
                true
            }
            _ => false,
        }
    }

    /// Drops every entry, ending all subscription streams. Called on
    /// session teardown.
    pub(crate) fn clear(&mut self) {
        if !self.entries.is_empty() {
            tracing::debug!(count = self.entries.len(), "clearing subscription registry");
        }
        self.entries.clear();
    }
}
