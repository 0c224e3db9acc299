//! Cell Implementation
//!
//! A Cell is the base observable container: it holds one [`Value`] and
//! three subscription slots. Formula cells are built on top of it.
//!
//! # Publishing
//!
//! [`Cell::set_value`] swaps the value in and, if the new value differs
//! from the old one, fires the slots in this order:
//!
//! 1. `changed`
//! 2. `undefined`, only when the new value is unset
//! 3. `dependencies`, which is what dependent formula cells listen on
//!
//! Replacing a pending value cancels its token.
//!
//! Whether two concrete values differ is decided by `PartialEq` unless the
//! cell was built with its own predicate (see [`Cell::with_differ`]).
//!
//! # Sharing
//!
//! `Cell` is a handle. Clones share the value and the slots, like the
//! other reactive handles in this crate.

use std::fmt::{self, Debug};
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use tracing::trace;

use super::identity::{CellId, IdentityRegistry, Identified};
use super::slot::{Slot, SlotKind};
use super::value::Value;
use crate::error::Result;

/// Predicate telling whether two concrete values differ.
pub type ValuesDiffer<T> = Arc<dyn Fn(&T, &T) -> bool + Send + Sync>;

/// Shared state behind a [`Cell`] handle.
pub(crate) struct CellCore<T> {
    id: OnceLock<CellId>,
    label: Option<String>,
    differ: Option<ValuesDiffer<T>>,
    value: RwLock<Value<T>>,
    changed: Slot,
    undefined: Slot,
    dependencies: Slot,
}

/// An observable value with change notification.
pub struct Cell<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    core: Arc<CellCore<T>>,
}

impl<T> Cell<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Create a cell holding `value`.
    pub fn new(value: T) -> Self {
        Self::from_parts(None, Value::Ready(value), None)
    }

    /// Create a cell with no value.
    pub fn unset() -> Self {
        Self::from_parts(None, Value::Unset, None)
    }

    /// Create a labelled cell. The label shows up in logs and snapshots.
    pub fn named(label: impl Into<String>, value: impl Into<Value<T>>) -> Self {
        Self::from_parts(Some(label.into()), value.into(), None)
    }

    /// Create a cell that compares concrete values with `differ` instead
    /// of `PartialEq`.
    ///
    /// `differ` runs while the cell is being written and must not touch
    /// this cell.
    pub fn with_differ<F>(value: impl Into<Value<T>>, differ: F) -> Self
    where
        F: Fn(&T, &T) -> bool + Send + Sync + 'static,
    {
        Self::from_parts(None, value.into(), Some(Arc::new(differ)))
    }

    pub(crate) fn from_parts(
        label: Option<String>,
        value: Value<T>,
        differ: Option<ValuesDiffer<T>>,
    ) -> Self {
        Self {
            core: Arc::new(CellCore {
                id: OnceLock::new(),
                label,
                differ,
                value: RwLock::new(value),
                changed: Slot::new(SlotKind::Changed),
                undefined: Slot::new(SlotKind::Undefined),
                dependencies: Slot::new(SlotKind::Dependencies),
            }),
        }
    }

    /// Get a clone of the current value.
    pub fn value(&self) -> Value<T> {
        self.core.value.read().clone()
    }

    /// Get the current value if it is concrete.
    pub fn get(&self) -> Option<T> {
        self.core.value.read().as_ready().cloned()
    }

    /// Publish a new value.
    ///
    /// Fires the slots when the value differs from the current one. Errors
    /// from subscribers (for instance a failing downstream formula) are
    /// returned after every slot has fired.
    pub fn set_value(&self, value: impl Into<Value<T>>) -> Result<()> {
        let value = value.into();
        let now_unset = value.is_unset();

        let old = {
            let mut guard = self.core.value.write();
            if !self.values_differ(&guard, &value) {
                return Ok(());
            }
            std::mem::replace(&mut *guard, value)
        };

        if let Value::Pending(pending) = &old {
            pending.cancel();
        }

        trace!(
            cell = ?self.core.id.get(),
            label = self.core.label.as_deref(),
            from = old.state_name(),
            unset = now_unset,
            "value changed"
        );

        let mut outcome = self.core.changed.notify();
        if now_unset {
            outcome = outcome.and(self.core.undefined.notify());
        }
        outcome.and(self.core.dependencies.notify())
    }

    /// Publish the current value again.
    ///
    /// Concrete and unset values stay as they are and nothing fires. A
    /// pending value is cancelled and the cell becomes unset.
    pub fn republish(&self) -> Result<()> {
        match self.value() {
            Value::Pending(pending) => {
                pending.cancel();
                self.set_value(Value::Unset)
            }
            current => self.set_value(current),
        }
    }

    /// Whether replacing `old` with `new` counts as a change for this cell.
    pub fn values_differ(&self, old: &Value<T>, new: &Value<T>) -> bool {
        match (old, new, &self.core.differ) {
            (Value::Ready(old), Value::Ready(new), Some(differ)) => differ(old, new),
            _ => old.differs_from(new),
        }
    }

    /// Slot fired when the value changes.
    pub fn changed_slot(&self) -> &Slot {
        &self.core.changed
    }

    /// Slot fired when the value becomes unset.
    pub fn undefined_slot(&self) -> &Slot {
        &self.core.undefined
    }

    /// Slot dependent cells subscribe to.
    pub fn dependencies_slot(&self) -> &Slot {
        &self.core.dependencies
    }

    /// Look up a slot by kind.
    pub fn slot(&self, kind: SlotKind) -> &Slot {
        match kind {
            SlotKind::Changed => &self.core.changed,
            SlotKind::Undefined => &self.core.undefined,
            SlotKind::Dependencies => &self.core.dependencies,
        }
    }

    /// The cell's label, if it has one.
    pub fn label(&self) -> Option<&str> {
        self.core.label.as_deref()
    }

    /// The cell's identity, assigned by the global registry unless another
    /// registry identified it first.
    pub fn identity(&self) -> CellId {
        IdentityRegistry::global().identity_of(self)
    }

    /// Whether both handles point at the same cell.
    pub fn ptr_eq(&self, other: &Cell<T>) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }

    /// Type-erased view used in dependency sets.
    pub(crate) fn as_source(&self) -> SourceCell {
        SourceCell(Arc::clone(&self.core) as Arc<dyn Source>)
    }

    /// Label if set, identity otherwise. Used in errors.
    pub(crate) fn describe(&self) -> String {
        match (&self.core.label, self.core.id.get()) {
            (Some(label), _) => label.clone(),
            (None, Some(id)) => id.to_string(),
            (None, None) => "<anonymous>".to_string(),
        }
    }
}

impl<T> Identified for Cell<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn identity_slot(&self) -> &OnceLock<CellId> {
        &self.core.id
    }
}

impl<T> Clone for Cell<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<T> Debug for Cell<T>
where
    T: Clone + PartialEq + Send + Sync + Debug + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cell")
            .field("id", &self.core.id.get())
            .field("label", &self.core.label)
            .field("value", &self.value())
            .finish()
    }
}

/// Anything that can be read as a [`Cell`] by a formula.
pub trait AsCell {
    /// The value type of the underlying cell.
    type Value: Clone + PartialEq + Send + Sync + 'static;

    /// Borrow the underlying cell.
    fn as_cell(&self) -> &Cell<Self::Value>;
}

impl<T> AsCell for Cell<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    type Value = T;

    fn as_cell(&self) -> &Cell<T> {
        self
    }
}

/// What a formula cell needs from an upstream cell, independent of its
/// value type.
pub(crate) trait Source: Identified + Send + Sync {
    fn dependencies_slot(&self) -> &Slot;
    fn label(&self) -> Option<&str>;
    fn state_name(&self) -> &'static str;
}

impl<T> Identified for CellCore<T>
where
    T: Send + Sync,
{
    fn identity_slot(&self) -> &OnceLock<CellId> {
        &self.id
    }
}

impl<T> Source for CellCore<T>
where
    T: Send + Sync,
{
    fn dependencies_slot(&self) -> &Slot {
        &self.dependencies
    }

    fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    fn state_name(&self) -> &'static str {
        self.value.read().state_name()
    }
}

/// An upstream cell a formula cell depends on, with its type erased.
#[derive(Clone)]
pub struct SourceCell(Arc<dyn Source>);

impl SourceCell {
    /// The upstream cell's identity, if assigned.
    pub fn id(&self) -> Option<CellId> {
        self.0.assigned_identity()
    }

    /// The upstream cell's label.
    pub fn label(&self) -> Option<&str> {
        self.0.label()
    }

    /// `"unset"`, `"ready"` or `"pending"`.
    pub fn state_name(&self) -> &'static str {
        self.0.state_name()
    }

    /// Whether this is the given cell.
    pub fn is<C: AsCell>(&self, cell: &C) -> bool {
        let this = Arc::as_ptr(&self.0) as *const ();
        let that = Arc::as_ptr(&cell.as_cell().core) as *const ();
        std::ptr::eq(this, that)
    }

    pub(crate) fn dependencies_slot(&self) -> &Slot {
        self.0.dependencies_slot()
    }
}

impl Identified for SourceCell {
    fn identity_slot(&self) -> &OnceLock<CellId> {
        self.0.identity_slot()
    }
}

impl Debug for SourceCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceCell")
            .field("id", &self.id())
            .field("label", &self.label())
            .field("state", &self.state_name())
            .finish()
    }
}
