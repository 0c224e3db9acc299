//! Cell values.
//!
//! A cell either holds nothing yet, a concrete value, or a [`Pending`]
//! placeholder standing for an asynchronous computation that has not
//! finished.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Placeholder for an in-flight asynchronous computation.
///
/// Clones share the same token. Two pendings are the same value only if
/// they are clones of each other. Whoever drives the computation checks
/// [`is_cancelled`](Pending::is_cancelled) before publishing its result.
#[derive(Clone, Default)]
pub struct Pending {
    cancelled: Arc<AtomicBool>,
}

impl Pending {
    /// Create a fresh, live token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel the computation behind this token.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether the token was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Whether both tokens stand for the same computation.
    pub fn same_as(&self, other: &Pending) -> bool {
        Arc::ptr_eq(&self.cancelled, &other.cancelled)
    }
}

impl fmt::Debug for Pending {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pending")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// The content of a cell.
#[derive(Debug, Clone)]
pub enum Value<T> {
    /// No value yet.
    Unset,
    /// A concrete value.
    Ready(T),
    /// An asynchronous computation is still producing the value.
    Pending(Pending),
}

impl<T> Value<T> {
    /// Whether the cell holds nothing.
    pub fn is_unset(&self) -> bool {
        matches!(self, Value::Unset)
    }

    /// Whether the value is a pending placeholder.
    pub fn is_pending(&self) -> bool {
        matches!(self, Value::Pending(_))
    }

    /// Whether the value is concrete.
    pub fn is_ready(&self) -> bool {
        matches!(self, Value::Ready(_))
    }

    /// Borrow the concrete value, if any.
    pub fn as_ready(&self) -> Option<&T> {
        match self {
            Value::Ready(value) => Some(value),
            _ => None,
        }
    }

    /// Take the concrete value, if any.
    pub fn ready(self) -> Option<T> {
        match self {
            Value::Ready(value) => Some(value),
            _ => None,
        }
    }

    /// Short name of the state, used by logs and snapshots.
    pub fn state_name(&self) -> &'static str {
        match self {
            Value::Unset => "unset",
            Value::Ready(_) => "ready",
            Value::Pending(_) => "pending",
        }
    }
}

impl<T: PartialEq> Value<T> {
    /// Whether replacing `self` with `other` is an observable change.
    ///
    /// Concrete values compare with `PartialEq`, pendings by token.
    pub fn differs_from(&self, other: &Value<T>) -> bool {
        match (self, other) {
            (Value::Unset, Value::Unset) => false,
            (Value::Ready(a), Value::Ready(b)) => a != b,
            (Value::Pending(a), Value::Pending(b)) => !a.same_as(b),
            _ => true,
        }
    }
}

impl<T> Default for Value<T> {
    fn default() -> Self {
        Value::Unset
    }
}

impl<T> From<T> for Value<T> {
    fn from(value: T) -> Self {
        Value::Ready(value)
    }
}
