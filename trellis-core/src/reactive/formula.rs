//! Dependency-capturing formulas.
//!
//! A user formula reads other cells through an [`Accessor`]. Every read
//! is recorded in a [`DependencySet`] that belongs to that single
//! invocation and is handed back with the result as an [`Evaluation`].
//! Nothing is shared between invocations, so there is no tracking stack
//! to keep balanced.
//!
//! # Missing inputs
//!
//! [`Accessor::need`] fails with [`NoValue`] when the cell has no
//! concrete value. Propagated with `?`, it ends the formula early. The
//! evaluation result is [`Value::Unset`] if the input was unset, or the
//! input's own [`Value::Pending`] if it was still pending, so an
//! in-flight computation upstream stays in flight downstream too.
//! `NoValue` can only be created by this crate, so a formula cannot fake
//! it and it never shows up as an error to callers.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;

use super::cell::{AsCell, Cell, SourceCell};
use super::identity::{CellId, IdentityRegistry};
use super::value::{Pending, Value};
use crate::error::{BoxError, CellError, Result};

/// Marker raised by [`Accessor::need`] when a required input has no
/// concrete value.
#[derive(Debug, Clone)]
pub struct NoValue {
    pending: Option<Pending>,
}

impl NoValue {
    pub(crate) fn unset() -> Self {
        Self { pending: None }
    }

    pub(crate) fn pending(token: Pending) -> Self {
        Self {
            pending: Some(token),
        }
    }

    /// Whether the input was pending rather than unset.
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// The value a formula stopped by this marker evaluates to.
    fn into_value<T>(self) -> Value<T> {
        match self.pending {
            Some(token) => Value::Pending(token),
            None => Value::Unset,
        }
    }
}

/// Failure of a user formula.
#[derive(Debug)]
pub enum FormulaError {
    /// A required input was missing. Turned into an unset result.
    NoValue(NoValue),
    /// Any other failure. Surfaces as [`CellError::Formula`].
    Failed(BoxError),
}

impl FormulaError {
    /// Wrap an arbitrary error.
    pub fn failed(err: impl Into<BoxError>) -> Self {
        FormulaError::Failed(err.into())
    }

    /// Fail with a plain message.
    pub fn msg(message: impl Into<String>) -> Self {
        let message: String = message.into();
        FormulaError::Failed(message.into())
    }
}

impl fmt::Display for FormulaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FormulaError::NoValue(marker) if marker.is_pending() => {
                f.write_str("required input is pending")
            }
            FormulaError::NoValue(_) => f.write_str("required input has no value"),
            FormulaError::Failed(err) => write!(f, "{err}"),
        }
    }
}

impl From<NoValue> for FormulaError {
    fn from(marker: NoValue) -> Self {
        FormulaError::NoValue(marker)
    }
}

impl<E> From<E> for FormulaError
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(err: E) -> Self {
        FormulaError::Failed(Box::new(err))
    }
}

/// Cells read during one formula evaluation, keyed by identity.
///
/// Keeps the order of first reads. Reading a cell again does not replace
/// the recorded entry.
#[derive(Clone, Default)]
pub struct DependencySet {
    cells: IndexMap<CellId, SourceCell>,
}

impl DependencySet {
    /// Record `cell` under `id` unless it is already there.
    pub(crate) fn record(&mut self, id: CellId, cell: impl FnOnce() -> SourceCell) {
        self.cells.entry(id).or_insert_with(cell);
    }

    /// Number of distinct cells read.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Whether no cell was read.
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Whether the cell with `id` was read.
    pub fn contains(&self, id: CellId) -> bool {
        self.cells.contains_key(&id)
    }

    /// Identities of the cells read, in first-read order.
    pub fn ids(&self) -> impl Iterator<Item = CellId> + '_ {
        self.cells.keys().copied()
    }

    /// The cells read, in first-read order.
    pub fn iter(&self) -> impl Iterator<Item = (CellId, &SourceCell)> + '_ {
        self.cells.iter().map(|(id, cell)| (*id, cell))
    }
}

impl IntoIterator for DependencySet {
    type Item = (CellId, SourceCell);
    type IntoIter = indexmap::map::IntoIter<CellId, SourceCell>;

    fn into_iter(self) -> Self::IntoIter {
        self.cells.into_iter()
    }
}

impl fmt::Debug for DependencySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.cells.keys()).finish()
    }
}

/// What a formula sees of the cell it computes.
pub struct FormulaContext<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    this: Cell<T>,
}

impl<T> FormulaContext<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    pub(crate) fn new(this: Cell<T>) -> Self {
        Self { this }
    }

    /// The cell owning the formula.
    pub fn this(&self) -> &Cell<T> {
        &self.this
    }
}

/// Reads cells on behalf of a formula and records them as dependencies.
pub struct Accessor<'a, T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    context: &'a FormulaContext<T>,
    registry: &'a IdentityRegistry,
    dependencies: &'a mut DependencySet,
}

impl<'a, T> Accessor<'a, T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Read a cell's value, which may be unset or pending.
    pub fn get<C>(&mut self, cell: &C) -> Value<C::Value>
    where
        C: AsCell + ?Sized,
    {
        let cell = cell.as_cell();
        let id = self.registry.identity_of(cell);
        self.dependencies.record(id, || cell.as_source());
        cell.value()
    }

    /// Read a cell's concrete value, or stop the formula with [`NoValue`].
    ///
    /// Stopped on an unset input, the formula evaluates to unset. Stopped
    /// on a pending input, it evaluates to that same pending value.
    pub fn need<C>(&mut self, cell: &C) -> std::result::Result<C::Value, NoValue>
    where
        C: AsCell + ?Sized,
    {
        match self.get(cell) {
            Value::Ready(value) => Ok(value),
            Value::Unset => Err(NoValue::unset()),
            Value::Pending(token) => Err(NoValue::pending(token)),
        }
    }

    /// The cell this formula computes.
    pub fn this(&self) -> &Cell<T> {
        self.context.this()
    }

    /// Number of distinct cells read so far.
    pub fn dependency_count(&self) -> usize {
        self.dependencies.len()
    }
}

/// Result of one formula invocation.
#[derive(Debug)]
pub struct Evaluation<T> {
    /// The computed value, unset if an input was missing.
    pub value: Value<T>,
    /// Every cell read while computing it.
    pub dependencies: DependencySet,
}

type FormulaFn<T> =
    dyn Fn(&mut Accessor<'_, T>) -> std::result::Result<Value<T>, FormulaError> + Send + Sync;

/// A user formula wrapped so that each call reports what it read.
pub struct ComputeFormula<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    formula: Box<FormulaFn<T>>,
    registry: Arc<IdentityRegistry>,
    in_flight: AtomicBool,
}

impl<T> ComputeFormula<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Wrap `formula`, allocating dependency identities from `registry`.
    pub fn new<F, R>(formula: F, registry: Arc<IdentityRegistry>) -> Self
    where
        F: Fn(&mut Accessor<'_, T>) -> std::result::Result<R, FormulaError>
            + Send
            + Sync
            + 'static,
        R: Into<Value<T>>,
    {
        let formula: Box<FormulaFn<T>> =
            Box::new(move |accessor: &mut Accessor<'_, T>| formula(accessor).map(Into::into));

        Self {
            formula,
            registry,
            in_flight: AtomicBool::new(false),
        }
    }

    /// The registry identities are taken from.
    pub fn registry(&self) -> &Arc<IdentityRegistry> {
        &self.registry
    }

    /// Run the formula once.
    ///
    /// Fails with [`CellError::ReentrantEvaluation`] if called while a
    /// previous call has not returned.
    pub fn evaluate(&self, context: &FormulaContext<T>) -> Result<Evaluation<T>> {
        let _in_flight = InFlight::enter(&self.in_flight).ok_or_else(|| {
            CellError::ReentrantEvaluation {
                cell: context.this().describe(),
            }
        })?;

        let mut dependencies = DependencySet::default();
        let outcome = {
            let mut accessor = Accessor {
                context,
                registry: &self.registry,
                dependencies: &mut dependencies,
            };
            (self.formula)(&mut accessor)
        };

        let value = match outcome {
            Ok(value) => value,
            Err(FormulaError::NoValue(marker)) => marker.into_value(),
            Err(FormulaError::Failed(source)) => {
                return Err(CellError::Formula {
                    cell: context.this().describe(),
                    source,
                })
            }
        };

        Ok(Evaluation {
            value,
            dependencies,
        })
    }
}

/// Clears the in-flight flag when the evaluation ends, panics included.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn enter(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlight(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
