//! Change notification for local stores and sync activity.
//!
//! Store subscribers receive the full matching set after every committed
//! mutation, never a diff. Engine activity goes out on a broadcast channel of
//! [`SyncEvent`]s that any number of observers can follow.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tasksync_core::conflicts::ReconcileOutcome;
use tasksync_core::models::{EntityKind, Record};
use uuid::Uuid;

/// Predicate selecting which records a subscriber sees.
pub type Filter<D> = Arc<dyn Fn(&Record<D>) -> bool + Send + Sync>;

pub type Callback<D> = Arc<dyn Fn(Vec<Record<D>>) + Send + Sync>;

/// Matches every record.
pub fn all<D: 'static>() -> Filter<D> {
    Arc::new(|_| true)
}

struct Subscriber<D> {
    filter: Filter<D>,
    callback: Callback<D>,
}

pub(crate) struct SubscriberRegistry<D> {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<u64, Subscriber<D>>>,
}

impl<D: Clone + Send + Sync + 'static> SubscriberRegistry<D> {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(1),
            subscribers: Mutex::new(HashMap::new()),
        })
    }

    pub(crate) fn register(
        self: &Arc<Self>,
        filter: Filter<D>,
        callback: Callback<D>,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.insert(id, Subscriber { filter, callback });
        }

        let registry: Weak<Self> = Arc::downgrade(self);
        Subscription {
            id,
            cancel: Some(Box::new(move || {
                if let Some(registry) = registry.upgrade() {
                    registry.unregister(id);
                }
            })),
        }
    }

    fn unregister(&self, id: u64) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.remove(&id);
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.subscribers.lock().map(|s| s.is_empty()).unwrap_or(true)
    }

    /// Delivers the matching subset of `records` to one subscriber.
    pub(crate) fn deliver_to(&self, id: u64, records: &[Record<D>]) {
        let target = self.subscribers.lock().ok().and_then(|subscribers| {
            subscribers
                .get(&id)
                .map(|s| (s.filter.clone(), s.callback.clone()))
        });
        if let Some((filter, callback)) = target {
            callback(records.iter().filter(|r| filter(r)).cloned().collect());
        }
    }

    /// Delivers the matching subset of `records` to every subscriber.
    pub(crate) fn publish(&self, records: &[Record<D>]) {
        // Snapshot so callbacks run without holding the lock
        let targets: Vec<(Filter<D>, Callback<D>)> = match self.subscribers.lock() {
            Ok(subscribers) => subscribers
                .values()
                .map(|s| (s.filter.clone(), s.callback.clone()))
                .collect(),
            Err(_) => return,
        };
        for (filter, callback) in targets {
            callback(records.iter().filter(|r| filter(r)).cloned().collect());
        }
    }
}

/// Live store subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn unsubscribe(mut self) {
        self.cancel_now();
    }

    fn cancel_now(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel_now();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

/// What the sync engine did, published for observers and tests.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// A record reached the remote store.
    Pushed { kind: EntityKind, entity_id: Uuid },
    /// A push could not reach the remote store and waits in the pending queue.
    Queued {
        kind: EntityKind,
        entity_id: Uuid,
        reason: String,
    },
    /// A tombstone was written for a locally deleted entity.
    Tombstoned { kind: EntityKind, entity_id: Uuid },
    /// Reconciling a remote record with the local copy.
    Reconciled {
        kind: EntityKind,
        entity_id: Uuid,
        outcome: ReconcileOutcome,
    },
    /// A remote record could not be decoded and was skipped.
    DecodeFailed { record_id: String, message: String },
    /// Every remote record of a scope was removed.
    ScopeCollapsed { scope_key: String, removed: usize },
    PullCompleted { applied: usize, failed: usize },
    ReplayCompleted { succeeded: usize, remaining: usize },
}
