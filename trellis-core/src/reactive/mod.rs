//! Reactive Primitives
//!
//! This module implements lazy formula cells: memoized values derived by
//! formulas that read other cells, with dependencies discovered anew on
//! every evaluation.
//!
//! # Concepts
//!
//! ## Cells
//!
//! A [`Cell`] holds a [`Value`] and three subscription slots (`changed`,
//! `undefined`, `dependencies`). Setting a different value fires them.
//!
//! ## Formula Cells
//!
//! A [`FormulaCell`] computes its value with a formula. The formula reads
//! other cells through an [`Accessor`], which records each read. After
//! every evaluation the cell subscribes to exactly the cells it read, so
//! the dependency graph follows whatever branch the formula took.
//!
//! ## Demand
//!
//! Formula cells are lazy. A cell only runs its formula while someone is
//! subscribed to one of its slots, either an outside observer or another
//! formula cell that reads it. Without demand it detaches from its inputs
//! and keeps its last value.
//!
//! ## Missing values
//!
//! [`Accessor::need`] turns a missing input into an early return through
//! `?`; the formula's result is then [`Value::Unset`] and no error is
//! reported.
//!
//! # Implementation Notes
//!
//! All recomputation happens synchronously inside the call that caused
//! it: a `set_value` upstream, or a subscribe/unsubscribe that changed
//! demand. There is no scheduler and no batching.

mod cell;
mod demand;
mod formula;
mod formula_cell;
mod identity;
mod slot;
mod value;

pub use cell::{AsCell, Cell, SourceCell, ValuesDiffer};
pub use demand::{Attachment, DemandFlags};
pub use formula::{
    Accessor, ComputeFormula, DependencySet, Evaluation, FormulaContext, FormulaError, NoValue,
};
pub use formula_cell::{compute, compute_eager, CellSnapshot, ComputeOptions, FormulaCell};
pub use identity::{CellId, IdentityRegistry, Identified};
pub use slot::{Callback, DemandHook, Slot, SlotKind, Subscription, SubscriptionId};
pub use value::{Pending, Value};
