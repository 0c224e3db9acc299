//! Formula Cell Implementation
//!
//! A FormulaCell is a [`Cell`] whose value comes from a formula. The
//! formula reads other cells through an [`Accessor`], and whatever it read
//! on its latest run is what the cell is subscribed to.
//!
//! # How Formula Cells Work
//!
//! 1. A lazy cell starts detached: its effective formula is empty, it
//!    holds no subscriptions and computes nothing.
//!
//! 2. When any of its own slots gains a subscriber, the cell attaches:
//!    it runs the formula, subscribes to every cell the formula read and
//!    publishes the result if the refresh policy asks for it.
//!
//! 3. While attached, a change in any dependency recalculates the cell.
//!    Each recalculation diffs the new dependency set against the current
//!    subscriptions: stale ones are dropped first, new ones added after.
//!
//! 4. When the last subscriber leaves, the cell detaches: it drops every
//!    subscription and keeps its last value for the next attach.
//!
//! Eager cells attach at construction and never watch demand.
//!
//! # Re-entrancy
//!
//! Subscribing to a detached upstream formula cell makes it attach and
//! publish right away, which asks this cell to recalculate while it is
//! still busy. Such requests are remembered and served by one more pass
//! once the current one has published; the formula itself is never
//! entered twice.

use std::fmt::{self, Debug};
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;
use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use super::cell::{AsCell, Cell, SourceCell, ValuesDiffer};
use super::demand::{Attachment, DemandFlags};
use super::formula::{Accessor, ComputeFormula, DependencySet, FormulaContext, FormulaError};
use super::identity::{CellId, IdentityRegistry};
use super::slot::{SlotKind, Subscription};
use super::value::Value;
use crate::error::{CellError, Result};

/// Construction options for formula cells.
pub struct ComputeOptions<T> {
    eager: bool,
    label: Option<String>,
    registry: Arc<IdentityRegistry>,
    differ: Option<ValuesDiffer<T>>,
}

impl<T> ComputeOptions<T> {
    /// Lazy, unlabelled, using the global identity registry and
    /// `PartialEq` to compare values.
    pub fn new() -> Self {
        Self {
            eager: false,
            label: None,
            registry: IdentityRegistry::global(),
            differ: None,
        }
    }

    /// Attach and evaluate at construction, regardless of demand.
    pub fn eager(mut self, eager: bool) -> Self {
        self.eager = eager;
        self
    }

    /// Label used in logs, errors and snapshots.
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Registry to allocate identities from.
    pub fn registry(mut self, registry: Arc<IdentityRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Compare concrete results with `differ` instead of `PartialEq`.
    ///
    /// Applies both when publishing and when deciding whether a
    /// reattached cell needs a refresh.
    pub fn differ<F>(mut self, differ: F) -> Self
    where
        F: Fn(&T, &T) -> bool + Send + Sync + 'static,
    {
        self.differ = Some(Arc::new(differ));
        self
    }
}

impl<T> Default for ComputeOptions<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for ComputeOptions<T> {
    fn clone(&self) -> Self {
        Self {
            eager: self.eager,
            label: self.label.clone(),
            registry: Arc::clone(&self.registry),
            differ: self.differ.clone(),
        }
    }
}

impl<T> Debug for ComputeOptions<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputeOptions")
            .field("eager", &self.eager)
            .field("label", &self.label)
            .field("registry", &self.registry.id())
            .field("custom_differ", &self.differ.is_some())
            .finish()
    }
}

/// Create a lazy formula cell.
///
/// # Example
///
/// ```rust
/// use trellis_core::reactive::{compute, Cell, FormulaCell};
///
/// let base = Cell::new(5);
/// let reader = base.clone();
/// let doubled: FormulaCell<i32> = compute(move |v| Ok(v.need(&reader)? * 2));
///
/// // Nobody asked yet
/// assert!(!doubled.is_attached());
///
/// let watch = doubled.changed_slot().subscribe(|| Ok(())).unwrap();
/// assert_eq!(doubled.get(), Some(10));
///
/// base.set_value(7).unwrap();
/// assert_eq!(doubled.get(), Some(14));
///
/// doubled.changed_slot().unsubscribe(&watch).unwrap();
/// assert!(!doubled.is_attached());
/// ```
pub fn compute<T, F, R>(formula: F) -> FormulaCell<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
    F: Fn(&mut Accessor<'_, T>) -> std::result::Result<R, FormulaError> + Send + Sync + 'static,
    R: Into<Value<T>>,
{
    FormulaCell::build(formula, ComputeOptions::new())
}

/// Create a formula cell that attaches and evaluates immediately.
pub fn compute_eager<T, F, R>(formula: F) -> Result<FormulaCell<T>>
where
    T: Clone + PartialEq + Send + Sync + 'static,
    F: Fn(&mut Accessor<'_, T>) -> std::result::Result<R, FormulaError> + Send + Sync + 'static,
    R: Into<Value<T>>,
{
    FormulaCell::with_options(formula, ComputeOptions::new().eager(true))
}

/// Which formula recalculation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EffectiveFormula {
    /// The real, dependency-diffing formula.
    Formula,
    /// Computes nothing.
    Empty,
}

/// A live subscription to an upstream cell.
struct SourceEntry {
    cell: SourceCell,
    subscription: Subscription,
}

struct FormulaState {
    sources: IndexMap<CellId, SourceEntry>,
    effective: EffectiveFormula,
    demand: DemandFlags,
}

impl FormulaState {
    fn attachment(&self) -> Attachment {
        match self.effective {
            EffectiveFormula::Formula => Attachment::Attached,
            EffectiveFormula::Empty => Attachment::Detached,
        }
    }
}

/// Which kind of pass a recalculation loop starts with.
#[derive(Debug, Clone, Copy)]
enum Pass {
    /// Always publish the result.
    Recalculate,
    /// Publish only if the refresh policy says so.
    Reattach,
}

struct FormulaInner<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    cell: Cell<T>,
    formula: ComputeFormula<T>,
    context: FormulaContext<T>,
    eager: bool,
    state: Mutex<FormulaState>,
    busy: AtomicBool,
    rerun: AtomicBool,
}

/// A cell computed by a formula with dynamically discovered dependencies.
///
/// Dereferences to the underlying [`Cell`] for reading the value and
/// subscribing.
pub struct FormulaCell<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    inner: Arc<FormulaInner<T>>,
}

impl<T> FormulaCell<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Create a formula cell with explicit options.
    ///
    /// Only eager construction evaluates the formula and can fail.
    pub fn with_options<F, R>(formula: F, options: ComputeOptions<T>) -> Result<Self>
    where
        F: Fn(&mut Accessor<'_, T>) -> std::result::Result<R, FormulaError>
            + Send
            + Sync
            + 'static,
        R: Into<Value<T>>,
    {
        let eager = options.eager;
        let cell = Self::build(formula, options);
        if eager {
            cell.inner.recalculate()?;
        }
        Ok(cell)
    }

    fn build<F, R>(formula: F, options: ComputeOptions<T>) -> Self
    where
        F: Fn(&mut Accessor<'_, T>) -> std::result::Result<R, FormulaError>
            + Send
            + Sync
            + 'static,
        R: Into<Value<T>>,
    {
        let ComputeOptions {
            eager,
            label,
            registry,
            differ,
        } = options;

        let cell = Cell::from_parts(label, Value::Unset, differ);
        let id = registry.identity_of(&cell);
        let effective = if eager {
            EffectiveFormula::Formula
        } else {
            EffectiveFormula::Empty
        };

        let inner = Arc::new(FormulaInner {
            cell: cell.clone(),
            formula: ComputeFormula::new(formula, registry),
            context: FormulaContext::new(cell),
            eager,
            state: Mutex::new(FormulaState {
                sources: IndexMap::new(),
                effective,
                demand: DemandFlags::default(),
            }),
            busy: AtomicBool::new(false),
            rerun: AtomicBool::new(false),
        });

        if !eager {
            inner.observe_demand();
        }
        debug!(cell = %id, label = inner.cell.label(), eager, "formula cell created");

        Self { inner }
    }

    /// Re-run the formula, re-diff dependencies and publish the result.
    ///
    /// Does nothing while detached.
    pub fn recalculate(&self) -> Result<()> {
        self.inner.recalculate()
    }

    /// Install the real formula again and resubscribe to dependencies.
    ///
    /// No-op if already attached. The result is published only when
    /// [`needs_refresh`](Self::needs_refresh) says so.
    pub fn attach_back(&self) -> Result<()> {
        self.inner.attach_back()
    }

    /// Drop every dependency subscription and stop recomputing.
    ///
    /// The last value is kept; a pending one is cancelled.
    pub fn detach(&self) -> Result<()> {
        self.inner.detach()
    }

    /// Whether the real formula is installed.
    pub fn is_attached(&self) -> bool {
        self.attachment() == Attachment::Attached
    }

    /// Current attachment state.
    pub fn attachment(&self) -> Attachment {
        self.inner.state.lock().attachment()
    }

    /// Whether the cell was created eager.
    pub fn is_eager(&self) -> bool {
        self.inner.eager
    }

    /// Whether publishing `new` on reattachment is warranted.
    pub fn needs_refresh(&self, new: &Value<T>) -> bool {
        self.inner.needs_refresh(new)
    }

    /// Static dependency lists are not accepted by formula cells.
    pub fn set_sources(&self, _sources: &[SourceCell]) -> Result<()> {
        Err(CellError::Unsupported {
            operation: "set_sources",
        })
    }

    /// Upstream cells this cell is currently subscribed to.
    pub fn source_cells(&self) -> Vec<SourceCell> {
        self.inner
            .state
            .lock()
            .sources
            .values()
            .map(|entry| entry.cell.clone())
            .collect()
    }

    /// Identities of [`source_cells`](Self::source_cells).
    pub fn source_ids(&self) -> Vec<CellId> {
        self.inner.state.lock().sources.keys().copied().collect()
    }

    /// The underlying cell.
    pub fn cell(&self) -> &Cell<T> {
        &self.inner.cell
    }

    /// The cell's identity in its formula's registry.
    pub fn id(&self) -> CellId {
        self.inner.formula.registry().identity_of(&self.inner.cell)
    }

    /// Serializable view of the cell for debugging.
    pub fn snapshot(&self) -> CellSnapshot {
        let (attachment, sources) = {
            let state = self.inner.state.lock();
            (state.attachment(), state.sources.keys().copied().collect())
        };

        CellSnapshot {
            id: self.id(),
            label: self.inner.cell.label().map(str::to_owned),
            attachment,
            eager: self.inner.eager,
            state: self.inner.cell.value().state_name(),
            sources,
        }
    }
}

impl<T> FormulaInner<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn observe_demand(self: &Arc<Self>) {
        for kind in [SlotKind::Changed, SlotKind::Undefined, SlotKind::Dependencies] {
            let weak = Arc::downgrade(self);
            self.cell.slot(kind).on_demand_changed(move |demand| match weak.upgrade() {
                Some(inner) => inner.demand_changed(kind, demand),
                None => Ok(()),
            });
        }
    }

    fn demand_changed(self: &Arc<Self>, kind: SlotKind, demand: bool) -> Result<()> {
        let (wanted, current) = {
            let mut state = self.state.lock();
            state.demand.set(kind, demand);
            (state.demand.attachment(), state.attachment())
        };
        trace!(cell = %self.cell.describe(), ?kind, demand, ?wanted, "demand observed");

        match (wanted, current) {
            (Attachment::Attached, _) => self.attach_back(),
            (Attachment::Detached, Attachment::Attached) => self.detach(),
            (Attachment::Detached, Attachment::Detached) => Ok(()),
        }
    }

    fn recalculate(self: &Arc<Self>) -> Result<()> {
        self.run(Pass::Recalculate)
    }

    fn attach_back(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.effective == EffectiveFormula::Formula {
                return Ok(());
            }
            state.effective = EffectiveFormula::Formula;
        }
        debug!(cell = %self.cell.describe(), "attaching");
        self.run(Pass::Reattach)
    }

    fn detach(self: &Arc<Self>) -> Result<()> {
        let entries = {
            let mut state = self.state.lock();
            state.effective = EffectiveFormula::Empty;
            std::mem::take(&mut state.sources)
        };
        debug!(cell = %self.cell.describe(), sources = entries.len(), "detaching");

        let mut outcome = Ok(());
        for (_, entry) in entries {
            outcome = outcome.and(
                entry
                    .cell
                    .dependencies_slot()
                    .unsubscribe(&entry.subscription)
                    .map(drop),
            );
        }
        outcome.and(self.cell.republish())
    }

    fn needs_refresh(&self, new: &Value<T>) -> bool {
        let current = self.cell.value();
        if current.is_unset() {
            return true;
        }
        if new.is_pending() {
            return false;
        }
        self.cell.values_differ(&current, new)
    }

    /// Evaluate and publish until no further recalculation was requested.
    fn run(self: &Arc<Self>, first: Pass) -> Result<()> {
        let Some(_busy) = Busy::enter(&self.busy) else {
            trace!(cell = %self.cell.describe(), "recalculation deferred");
            self.rerun.store(true, Ordering::SeqCst);
            return Ok(());
        };
        self.rerun.store(false, Ordering::SeqCst);

        let mut pass = first;
        loop {
            if self.state.lock().effective == EffectiveFormula::Empty {
                break;
            }

            let value = self.evaluate_and_track()?;
            let publish = match pass {
                Pass::Recalculate => true,
                Pass::Reattach => self.needs_refresh(&value),
            };
            trace!(
                cell = %self.cell.describe(),
                ?pass,
                state = value.state_name(),
                publish,
                "recalculated"
            );
            if publish {
                self.cell.set_value(value)?;
            }

            if !self.rerun.swap(false, Ordering::SeqCst) {
                break;
            }
            pass = Pass::Recalculate;
        }
        Ok(())
    }

    fn evaluate_and_track(self: &Arc<Self>) -> Result<Value<T>> {
        let evaluation = self.formula.evaluate(&self.context)?;
        self.apply_dependencies(evaluation.dependencies)?;
        Ok(evaluation.value)
    }

    /// Make the current subscriptions match `dependencies`.
    fn apply_dependencies(self: &Arc<Self>, dependencies: DependencySet) -> Result<()> {
        let (stale, fresh) = {
            let mut state = self.state.lock();
            let stale_ids: SmallVec<[CellId; 4]> = state
                .sources
                .keys()
                .filter(|id| !dependencies.contains(**id))
                .copied()
                .collect();
            let stale: SmallVec<[SourceEntry; 4]> = stale_ids
                .iter()
                .filter_map(|id| state.sources.shift_remove(id))
                .collect();
            let fresh: SmallVec<[(CellId, SourceCell); 4]> = dependencies
                .into_iter()
                .filter(|(id, _)| !state.sources.contains_key(id))
                .collect();
            (stale, fresh)
        };

        // Every source is processed even after a failure; the first error wins
        let mut outcome = Ok(());
        for entry in stale {
            trace!(cell = %self.cell.describe(), source = ?entry.cell.id(), "unsubscribing");
            outcome = outcome.and(
                entry
                    .cell
                    .dependencies_slot()
                    .unsubscribe(&entry.subscription)
                    .map(drop),
            );
        }

        for (id, source) in fresh {
            trace!(cell = %self.cell.describe(), source = %id, "subscribing");
            let weak = Arc::downgrade(self);
            let subscribed = source.dependencies_slot().subscribe(move || match weak.upgrade() {
                Some(inner) => inner.recalculate(),
                None => Ok(()),
            });
            let subscription = match subscribed {
                Ok(subscription) => subscription,
                Err(err) => {
                    outcome = outcome.and(Err(err));
                    continue;
                }
            };

            let mut state = self.state.lock();
            if state.effective == EffectiveFormula::Empty {
                // Detached while subscribing
                drop(state);
                outcome = outcome.and(
                    source
                        .dependencies_slot()
                        .unsubscribe(&subscription)
                        .map(drop),
                );
                continue;
            }
            state.sources.insert(
                id,
                SourceEntry {
                    cell: source,
                    subscription,
                },
            );
        }
        outcome
    }
}

impl<T> Drop for FormulaInner<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn drop(&mut self) {
        let sources = std::mem::take(&mut self.state.get_mut().sources);
        for (id, entry) in sources {
            if let Err(err) = entry.cell.dependencies_slot().unsubscribe(&entry.subscription) {
                warn!(source = %id, error = %err, "failed to release dependency");
            }
        }
    }
}

/// Marks a cell as busy evaluating; cleared on drop.
struct Busy<'a>(&'a AtomicBool);

impl<'a> Busy<'a> {
    fn enter(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Busy(flag))
    }
}

impl Drop for Busy<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<T> Deref for FormulaCell<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    type Target = Cell<T>;

    fn deref(&self) -> &Cell<T> {
        &self.inner.cell
    }
}

impl<T> AsCell for FormulaCell<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    type Value = T;

    fn as_cell(&self) -> &Cell<T> {
        &self.inner.cell
    }
}

impl<T> Clone for FormulaCell<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Debug for FormulaCell<T>
where
    T: Clone + PartialEq + Send + Sync + Debug + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FormulaCell")
            .field("id", &self.id())
            .field("label", &self.inner.cell.label())
            .field("attachment", &self.attachment())
            .field("value", &self.inner.cell.value())
            .field("sources", &self.source_ids())
            .finish()
    }
}

/// Point-in-time view of a formula cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CellSnapshot {
    /// The cell's identity.
    pub id: CellId,
    /// The cell's label.
    pub label: Option<String>,
    /// Whether the real formula is installed.
    pub attachment: Attachment,
    /// Whether the cell was created eager.
    pub eager: bool,
    /// `"unset"`, `"ready"` or `"pending"`.
    pub state: &'static str,
    /// Identities of the cells it is subscribed to.
    pub sources: Vec<CellId>,
}

impl CellSnapshot {
    /// Render as JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::value::Pending;
    use std::sync::atomic::AtomicI32;

    fn options<T>(registry: &Arc<IdentityRegistry>) -> ComputeOptions<T> {
        ComputeOptions::new().registry(registry.clone())
    }

    fn lazy<T, F, R>(registry: &Arc<IdentityRegistry>, formula: F) -> FormulaCell<T>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
        F: Fn(&mut Accessor<'_, T>) -> std::result::Result<R, FormulaError>
            + Send
            + Sync
            + 'static,
        R: Into<Value<T>>,
    {
        FormulaCell::with_options(formula, options(registry)).unwrap()
    }

    #[test]
    fn eager_cell_computes_at_construction() {
        let registry = Arc::new(IdentityRegistry::new());
        let cell: FormulaCell<i32> =
            FormulaCell::with_options(|_| Ok(1), options(&registry).eager(true)).unwrap();

        assert_eq!(cell.get(), Some(1));
        assert!(cell.is_attached());
        assert!(cell.is_eager());
        assert!(cell.source_ids().is_empty());
    }

    #[test]
    fn lazy_cell_does_nothing_without_demand() {
        let registry = Arc::new(IdentityRegistry::new());
        let runs = Arc::new(AtomicI32::new(0));
        let runs_clone = runs.clone();

        let cell: FormulaCell<i32> = lazy(&registry, move |_| {
            runs_clone.fetch_add(1, Ordering::SeqCst);
            Ok(1)
        });

        assert!(!cell.is_attached());
        assert!(cell.value().is_unset());
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn demand_on_any_slot_attaches() {
        let registry = Arc::new(IdentityRegistry::new());
        let base = Cell::new(3);
        let reader = base.clone();
        let cell: FormulaCell<i32> = lazy(&registry, move |v| Ok(v.need(&reader)? + 1));

        for kind in [SlotKind::Changed, SlotKind::Undefined, SlotKind::Dependencies] {
            let subscription = cell.slot(kind).subscribe(|| Ok(())).unwrap();
            assert!(cell.is_attached(), "{kind:?} should attach");
            assert_eq!(cell.get(), Some(4));
            assert_eq!(base.dependencies_slot().subscriber_count(), 1);

            cell.slot(kind).unsubscribe(&subscription).unwrap();
            assert!(!cell.is_attached(), "{kind:?} should detach");
            assert_eq!(base.dependencies_slot().subscriber_count(), 0);
        }
    }

    #[test]
    fn attachment_follows_or_of_demand() {
        let registry = Arc::new(IdentityRegistry::new());
        let cell: FormulaCell<i32> = lazy(&registry, |_| Ok(0));

        let changed = cell.changed_slot().subscribe(|| Ok(())).unwrap();
        let undefined = cell.undefined_slot().subscribe(|| Ok(())).unwrap();
        assert!(cell.is_attached());

        cell.changed_slot().unsubscribe(&changed).unwrap();
        assert!(cell.is_attached());

        cell.undefined_slot().unsubscribe(&undefined).unwrap();
        assert!(!cell.is_attached());
    }

    #[test]
    fn recalculation_rediffs_dependencies() {
        let registry = Arc::new(IdentityRegistry::new());
        let switch = Cell::new(true);
        let left = Cell::new("left".to_string());
        let right = Cell::new("right".to_string());
        let (s, l, r) = (switch.clone(), left.clone(), right.clone());

        let cell: FormulaCell<String> = lazy(&registry, move |v| {
            if v.need(&s)? {
                Ok(v.need(&l)?)
            } else {
                Ok(v.need(&r)?)
            }
        });
        let _watch = cell.changed_slot().subscribe(|| Ok(())).unwrap();

        let switch_id = registry.identity_of(&switch);
        let left_id = registry.identity_of(&left);
        let right_id = registry.identity_of(&right);
        assert_eq!(cell.source_ids(), vec![switch_id, left_id]);

        switch.set_value(false).unwrap();
        assert_eq!(cell.get().as_deref(), Some("right"));
        assert_eq!(cell.source_ids(), vec![switch_id, right_id]);
        assert_eq!(left.dependencies_slot().subscriber_count(), 0);
        assert_eq!(right.dependencies_slot().subscriber_count(), 1);

        // Changes to the dropped dependency no longer matter
        left.set_value("ignored".to_string()).unwrap();
        assert_eq!(cell.get().as_deref(), Some("right"));
    }

    #[test]
    fn detach_empties_sources_and_keeps_value() {
        let registry = Arc::new(IdentityRegistry::new());
        let base = Cell::new(2);
        let reader = base.clone();
        let cell: FormulaCell<i32> = lazy(&registry, move |v| Ok(v.need(&reader)? * 10));

        let watch = cell.changed_slot().subscribe(|| Ok(())).unwrap();
        assert_eq!(cell.source_cells().len(), 1);
        assert!(cell.source_cells()[0].is(&base));

        cell.changed_slot().unsubscribe(&watch).unwrap();
        assert!(cell.source_ids().is_empty());
        assert_eq!(base.dependencies_slot().subscriber_count(), 0);
        assert_eq!(cell.get(), Some(20));
    }

    #[test]
    fn reattach_skips_publish_when_value_is_unchanged() {
        let registry = Arc::new(IdentityRegistry::new());
        let base = Cell::new(1);
        let reader = base.clone();
        let cell: FormulaCell<i32> = lazy(&registry, move |v| Ok(v.need(&reader)?));

        let changes = Arc::new(AtomicI32::new(0));
        let changes_clone = changes.clone();
        let watch = cell
            .changed_slot()
            .subscribe(move || {
                changes_clone.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        assert_eq!(changes.load(Ordering::SeqCst), 1);

        cell.detach().unwrap();
        cell.attach_back().unwrap();
        assert_eq!(changes.load(Ordering::SeqCst), 1);
        assert_eq!(cell.source_ids().len(), 1);

        // While detached the cell misses changes and catches up on attach
        cell.detach().unwrap();
        base.set_value(5).unwrap();
        assert_eq!(cell.get(), Some(1));
        cell.attach_back().unwrap();
        assert_eq!(cell.get(), Some(5));
        assert_eq!(changes.load(Ordering::SeqCst), 2);

        cell.changed_slot().unsubscribe(&watch).unwrap();
    }

    #[test]
    fn attach_back_is_idempotent() {
        let registry = Arc::new(IdentityRegistry::new());
        let runs = Arc::new(AtomicI32::new(0));
        let runs_clone = runs.clone();
        let cell: FormulaCell<i32> = lazy(&registry, move |_| {
            runs_clone.fetch_add(1, Ordering::SeqCst);
            Ok(1)
        });

        cell.attach_back().unwrap();
        cell.attach_back().unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn refresh_policy() {
        let registry = Arc::new(IdentityRegistry::new());
        let cell: FormulaCell<i32> = lazy(&registry, |_| Ok(1));

        // No value yet: always refresh, even for pending
        assert!(cell.needs_refresh(&Value::Pending(Pending::new())));
        assert!(cell.needs_refresh(&Value::Ready(1)));

        cell.attach_back().unwrap();
        assert_eq!(cell.get(), Some(1));
        assert!(!cell.needs_refresh(&Value::Pending(Pending::new())));
        assert!(!cell.needs_refresh(&Value::Ready(1)));
        assert!(cell.needs_refresh(&Value::Ready(2)));
        assert!(cell.needs_refresh(&Value::Unset));
    }

    #[test]
    fn pending_result_does_not_overwrite_on_reattach() {
        let registry = Arc::new(IdentityRegistry::new());
        let remote = Cell::new(true);
        let reader = remote.clone();
        let token = Pending::new();
        let token_clone = token.clone();

        // Ready while the flag is false, pending once it flips
        let cell: FormulaCell<i32> = lazy(&registry, move |v| {
            if v.need(&reader)? {
                Ok(Value::Ready(1))
            } else {
                Ok(Value::Pending(token_clone.clone()))
            }
        });
        cell.attach_back().unwrap();
        assert_eq!(cell.get(), Some(1));

        cell.detach().unwrap();
        remote.set_value(false).unwrap();
        cell.attach_back().unwrap();

        assert_eq!(cell.get(), Some(1));
        assert!(!token.is_cancelled());
        assert_eq!(cell.source_ids().len(), 1);
    }

    #[test]
    fn detach_cancels_pending_value() {
        let registry = Arc::new(IdentityRegistry::new());
        let token = Pending::new();
        let token_clone = token.clone();
        let cell: FormulaCell<i32> =
            lazy(&registry, move |_| Ok(Value::Pending(token_clone.clone())));

        cell.attach_back().unwrap();
        assert!(cell.value().is_pending());

        cell.detach().unwrap();
        assert!(token.is_cancelled());
        assert!(cell.value().is_unset());
    }

    #[test]
    fn set_sources_is_rejected() {
        let registry = Arc::new(IdentityRegistry::new());
        let cell: FormulaCell<i32> = lazy(&registry, |_| Ok(1));
        let other = Cell::new(1);

        let err = cell.set_sources(&[other.as_source()]).unwrap_err();
        assert!(matches!(err, CellError::Unsupported { operation: "set_sources" }));
    }

    #[test]
    fn formula_errors_surface_to_the_trigger() {
        let registry = Arc::new(IdentityRegistry::new());
        let divisor = Cell::new(2);
        let reader = divisor.clone();
        let cell: FormulaCell<i32> = lazy(&registry, move |v| {
            let d = v.need(&reader)?;
            if d == 0 {
                return Err(FormulaError::msg("division by zero"));
            }
            Ok(10 / d)
        });
        let _watch = cell.changed_slot().subscribe(|| Ok(())).unwrap();
        assert_eq!(cell.get(), Some(5));

        let err = divisor.set_value(0).unwrap_err();
        assert!(err.is_formula_failure());
        // The previous value is untouched
        assert_eq!(cell.get(), Some(5));

        divisor.set_value(5).unwrap();
        assert_eq!(cell.get(), Some(2));
    }

    #[test]
    fn failing_attach_rolls_back_demand() {
        let registry = Arc::new(IdentityRegistry::new());
        let cell: FormulaCell<i32> = lazy(&registry, |_| -> std::result::Result<i32, FormulaError> {
            Err(FormulaError::msg("nope"))
        });

        let result = cell.changed_slot().subscribe(|| Ok(()));
        assert!(result.is_err());
        assert!(!cell.is_attached());
        assert_eq!(cell.changed_slot().subscriber_count(), 0);
    }

    #[test]
    fn chained_lazy_cells_attach_upstream() {
        let registry = Arc::new(IdentityRegistry::new());
        let base = Cell::new(5);
        let reader = base.clone();
        let doubled: FormulaCell<i32> = lazy(&registry, move |v| Ok(v.need(&reader)? * 2));
        let upstream = doubled.clone();
        let plus_ten: FormulaCell<i32> = lazy(&registry, move |v| Ok(v.need(&upstream)? + 10));

        let watch = plus_ten.changed_slot().subscribe(|| Ok(())).unwrap();
        assert!(doubled.is_attached());
        assert_eq!(doubled.get(), Some(10));
        assert_eq!(plus_ten.get(), Some(20));

        base.set_value(10).unwrap();
        assert_eq!(plus_ten.get(), Some(30));

        plus_ten.changed_slot().unsubscribe(&watch).unwrap();
        assert!(!plus_ten.is_attached());
        assert!(!doubled.is_attached());
        assert_eq!(base.dependencies_slot().subscriber_count(), 0);
    }

    #[test]
    fn dropping_the_last_handle_releases_dependencies() {
        let registry = Arc::new(IdentityRegistry::new());
        let base = Cell::new(1);
        let reader = base.clone();
        let cell: FormulaCell<i32> = FormulaCell::with_options(
            move |v| Ok(v.need(&reader)?),
            options(&registry).eager(true),
        )
        .unwrap();
        assert_eq!(base.dependencies_slot().subscriber_count(), 1);

        drop(cell);
        assert_eq!(base.dependencies_slot().subscriber_count(), 0);
    }

    #[test]
    fn formula_sees_its_own_cell() {
        let registry = Arc::new(IdentityRegistry::new());
        let tick = Cell::new(0);
        let reader = tick.clone();
        // Accumulates every tick it has seen
        let total: FormulaCell<i32> = FormulaCell::with_options(
            move |v| {
                let previous = v.this().get().unwrap_or(0);
                Ok(previous + v.need(&reader)?)
            },
            options(&registry).eager(true),
        )
        .unwrap();

        tick.set_value(2).unwrap();
        tick.set_value(3).unwrap();
        assert_eq!(total.get(), Some(5));
    }

    #[test]
    fn pending_input_does_not_overwrite_downstream_on_reattach() {
        let registry = Arc::new(IdentityRegistry::new());
        let remote = Cell::new(1);
        let reader = remote.clone();
        let mid: FormulaCell<i32> = lazy(&registry, move |v| Ok(v.need(&reader)?));
        let upstream = mid.clone();
        let top: FormulaCell<i32> = lazy(&registry, move |v| Ok(v.need(&upstream)? + 1));

        let watch = top.changed_slot().subscribe(|| Ok(())).unwrap();
        assert_eq!(top.get(), Some(2));
        top.changed_slot().unsubscribe(&watch).unwrap();
        assert!(!mid.is_attached());

        let token = Pending::new();
        remote.set_value(Value::Pending(token.clone())).unwrap();

        let watch = top.changed_slot().subscribe(|| Ok(())).unwrap();
        assert!(mid.is_attached());
        assert_eq!(mid.get(), Some(1));
        assert_eq!(top.get(), Some(2));
        assert!(!token.is_cancelled());

        // The computation lands and flows through
        remote.set_value(3).unwrap();
        assert!(token.is_cancelled());
        assert_eq!(top.get(), Some(4));

        top.changed_slot().unsubscribe(&watch).unwrap();
    }

    #[test]
    fn custom_differ_governs_publish_and_refresh() {
        let registry = Arc::new(IdentityRegistry::new());
        let sensor = Cell::new(20.0_f64);
        let reader = sensor.clone();
        let reading: FormulaCell<f64> = FormulaCell::with_options(
            move |v| Ok(v.need(&reader)?),
            options(&registry).differ(|a: &f64, b: &f64| (a - b).abs() > 0.5),
        )
        .unwrap();

        let changes = Arc::new(AtomicI32::new(0));
        let changes_clone = changes.clone();
        let _watch = reading
            .changed_slot()
            .subscribe(move || {
                changes_clone.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        assert_eq!(reading.get(), Some(20.0));
        assert_eq!(changes.load(Ordering::SeqCst), 1);

        // Within tolerance: nothing is published
        sensor.set_value(20.3).unwrap();
        assert_eq!(reading.get(), Some(20.0));
        assert_eq!(changes.load(Ordering::SeqCst), 1);

        sensor.set_value(21.0).unwrap();
        assert_eq!(reading.get(), Some(21.0));
        assert_eq!(changes.load(Ordering::SeqCst), 2);

        assert!(!reading.needs_refresh(&Value::Ready(21.4)));
        assert!(reading.needs_refresh(&Value::Ready(22.0)));

        reading.detach().unwrap();
        sensor.set_value(21.2).unwrap();
        reading.attach_back().unwrap();
        assert_eq!(reading.get(), Some(21.0));
        assert_eq!(changes.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failed_release_still_subscribes_new_sources() {
        let registry = Arc::new(IdentityRegistry::new());
        let switch = Cell::new(true);
        let flaky = Cell::new(1);
        let steady = Cell::new(2);
        flaky.dependencies_slot().on_demand_changed(|demand| {
            if demand {
                Ok(())
            } else {
                Err(CellError::Unsupported { operation: "release" })
            }
        });

        let (s, f, st) = (switch.clone(), flaky.clone(), steady.clone());
        let cell: FormulaCell<i32> = FormulaCell::with_options(
            move |v| {
                if v.need(&s)? {
                    Ok(v.need(&f)?)
                } else {
                    Ok(v.need(&st)?)
                }
            },
            options(&registry).eager(true),
        )
        .unwrap();

        let err = switch.set_value(false).unwrap_err();
        assert!(matches!(err, CellError::Unsupported { operation: "release" }));
        assert_eq!(
            cell.source_ids(),
            vec![registry.identity_of(&switch), registry.identity_of(&steady)]
        );
        assert_eq!(flaky.dependencies_slot().subscriber_count(), 0);
        assert_eq!(steady.dependencies_slot().subscriber_count(), 1);

        steady.set_value(5).unwrap();
        assert_eq!(cell.get(), Some(5));
    }

    #[test]
    fn snapshot_describes_the_cell() {
        let registry = Arc::new(IdentityRegistry::new());
        let base = Cell::new(1);
        let reader = base.clone();
        let cell: FormulaCell<i32> = FormulaCell::with_options(
            move |v| Ok(v.need(&reader)?),
            options(&registry).label("mirror"),
        )
        .unwrap();

        let detached = cell.snapshot();
        assert_eq!(detached.attachment, Attachment::Detached);
        assert_eq!(detached.state, "unset");
        assert!(detached.sources.is_empty());

        cell.attach_back().unwrap();
        let attached = cell.snapshot();
        assert_eq!(attached.id.index(), 1);
        assert_eq!(attached.sources, vec![registry.identity_of(&base)]);

        let r = registry.id();
        let expected = format!(
            r#"{{"id":{{"registry":{r},"index":1}},"label":"mirror","attachment":"attached","eager":false,"state":"ready","sources":[{{"registry":{r},"index":2}}]}}"#
        );
        assert_eq!(attached.to_json().unwrap(), expected);
    }
}
