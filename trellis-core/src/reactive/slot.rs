//! Subscription slots.
//!
//! Every cell owns three slots: `changed`, `undefined` and
//! `dependencies`. A slot is a list of callbacks plus an optional demand
//! hook. The hook hears about the slot going from no subscribers to some
//! (`true`) and back (`false`); that is how a lazy formula cell learns
//! whether anyone still wants its value.
//!
//! # Re-entrancy
//!
//! No lock is held while a callback or the demand hook runs. Callbacks
//! may subscribe, unsubscribe and set values on any cell, this one
//! included. A notification works on a snapshot of the subscriber list
//! taken when it starts.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;
use smallvec::SmallVec;
use tracing::{trace, warn};

use crate::error::Result;

/// Callback run when a slot fires.
pub type Callback = Arc<dyn Fn() -> Result<()> + Send + Sync>;

/// Hook run when a slot's demand flips.
pub type DemandHook = Arc<dyn Fn(bool) -> Result<()> + Send + Sync>;

/// Which of a cell's slots this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotKind {
    /// Fires when the value changes.
    Changed,
    /// Fires when the value becomes unset.
    Undefined,
    /// Fires for dependent cells when the value changes.
    Dependencies,
}

/// Unique identifier for a subscription.
///
/// Unique across all slots, so a handle from one slot never removes a
/// subscriber from another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Handle returned by [`Slot::subscribe`], used to unsubscribe.
#[derive(Debug, PartialEq, Eq)]
pub struct Subscription {
    id: SubscriptionId,
    kind: SlotKind,
}

impl Subscription {
    /// The subscription's unique ID.
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// The kind of slot this subscription belongs to.
    pub fn kind(&self) -> SlotKind {
        self.kind
    }
}

/// A list of subscribers with demand tracking.
pub struct Slot {
    kind: SlotKind,
    subscribers: Mutex<IndexMap<SubscriptionId, Callback>>,
    demand_hook: Mutex<Option<DemandHook>>,
}

impl Slot {
    /// Create an empty slot.
    pub fn new(kind: SlotKind) -> Self {
        Self {
            kind,
            subscribers: Mutex::new(IndexMap::new()),
            demand_hook: Mutex::new(None),
        }
    }

    /// The kind of this slot.
    pub fn kind(&self) -> SlotKind {
        self.kind
    }

    /// Register a callback.
    ///
    /// If this is the first subscriber, the demand hook runs with `true`
    /// before returning. Should the hook fail, the subscription is taken
    /// back out and the hook's error is returned.
    pub fn subscribe<F>(&self, callback: F) -> Result<Subscription>
    where
        F: Fn() -> Result<()> + Send + Sync + 'static,
    {
        let id = SubscriptionId::new();
        let first = {
            let mut subscribers = self.subscribers.lock();
            subscribers.insert(id, Arc::new(callback));
            subscribers.len() == 1
        };

        if first {
            if let Err(err) = self.fire_demand(true) {
                let last = {
                    let mut subscribers = self.subscribers.lock();
                    subscribers.shift_remove(&id).is_some() && subscribers.is_empty()
                };
                if last {
                    if let Err(rollback) = self.fire_demand(false) {
                        warn!(slot = ?self.kind, error = %rollback, "demand rollback failed");
                    }
                }
                return Err(err);
            }
        }

        Ok(Subscription {
            id,
            kind: self.kind,
        })
    }

    /// Remove a subscriber.
    ///
    /// Returns `false` if the handle was not subscribed here. Removing
    /// the last subscriber runs the demand hook with `false`.
    pub fn unsubscribe(&self, subscription: &Subscription) -> Result<bool> {
        let (removed, now_empty) = {
            let mut subscribers = self.subscribers.lock();
            let removed = subscribers.shift_remove(&subscription.id).is_some();
            (removed, removed && subscribers.is_empty())
        };

        if now_empty {
            self.fire_demand(false)?;
        }
        Ok(removed)
    }

    /// Install the demand hook, replacing any previous one.
    pub fn on_demand_changed<F>(&self, hook: F)
    where
        F: Fn(bool) -> Result<()> + Send + Sync + 'static,
    {
        *self.demand_hook.lock() = Some(Arc::new(hook));
    }

    /// Run every subscriber.
    ///
    /// All subscribers run even if some fail; the first failure is
    /// returned.
    pub fn notify(&self) -> Result<()> {
        let callbacks: SmallVec<[Callback; 4]> =
            self.subscribers.lock().values().cloned().collect();

        let mut first_error = None;
        for callback in callbacks {
            if let Err(err) = callback() {
                if first_error.is_none() {
                    first_error = Some(err);
                } else {
                    warn!(slot = ?self.kind, error = %err, "additional subscriber failure");
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Whether anyone is subscribed.
    pub fn has_demand(&self) -> bool {
        !self.subscribers.lock().is_empty()
    }

    fn fire_demand(&self, demand: bool) -> Result<()> {
        let hook = self.demand_hook.lock().clone();
        trace!(slot = ?self.kind, demand, "demand changed");
        match hook {
            Some(hook) => hook(demand),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot")
            .field("kind", &self.kind)
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}
