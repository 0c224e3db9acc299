//! Demand tracking.
//!
//! A lazy formula cell watches its own three slots. Each slot reports
//! whether it has subscribers; the cell should be attached exactly when
//! at least one of them does.

use serde::Serialize;

use super::slot::SlotKind;

/// Whether a formula cell currently runs its real formula.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Attachment {
    /// Subscribed to its dependencies and recomputing on change.
    Attached,
    /// Holding its last value, subscribed to nothing.
    Detached,
}

/// Latest demand reported by each of a cell's slots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DemandFlags {
    /// Someone listens for value changes.
    pub changed: bool,
    /// Someone listens for the value becoming unset.
    pub undefined: bool,
    /// A dependent cell reads this one.
    pub dependencies: bool,
}

impl DemandFlags {
    /// Record the demand reported by one slot.
    pub fn set(&mut self, kind: SlotKind, demand: bool) {
        match kind {
            SlotKind::Changed => self.changed = demand,
            SlotKind::Undefined => self.undefined = demand,
            SlotKind::Dependencies => self.dependencies = demand,
        }
    }

    /// Whether any slot has demand.
    pub fn any(&self) -> bool {
        self.changed || self.undefined || self.dependencies
    }

    /// The attachment these flags call for.
    pub fn attachment(&self) -> Attachment {
        if self.any() {
            Attachment::Attached
        } else {
            Attachment::Detached
        }
    }
}
