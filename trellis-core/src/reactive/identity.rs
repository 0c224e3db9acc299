//! Cell identities.
//!
//! Every cell gets an identity the first time anyone asks for it.
//! Identities are handed out by an [`IdentityRegistry`] and cached on the
//! cell, so later requests return the same one, whichever registry asks.
//! Formula cells use them as keys of their dependency maps.
//!
//! An identity is the pair of the assigning registry's number and an
//! index counted per registry. Two registries both start their indices
//! at 1, but never hand out the same identity.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use serde::Serialize;

/// Number of the process-wide registry.
const GLOBAL_REGISTRY: u64 = 0;

/// Unique identifier for a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct CellId {
    registry: u64,
    index: u64,
}

impl CellId {
    /// Position of the cell within the registry that assigned it.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Number of the registry that assigned this identity.
    pub fn registry(&self) -> u64 {
        self.registry
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.registry == GLOBAL_REGISTRY {
            write!(f, "#{}", self.index)
        } else {
            write!(f, "#{}@{}", self.index, self.registry)
        }
    }
}

/// Anything that can carry a lazily assigned [`CellId`].
pub trait Identified {
    /// The slot where the identity is cached once assigned.
    fn identity_slot(&self) -> &OnceLock<CellId>;

    /// The identity, if one was already assigned.
    fn assigned_identity(&self) -> Option<CellId> {
        self.identity_slot().get().copied()
    }
}

/// Allocator of cell identities.
///
/// Indices start at 1 and only grow. Tests that need predictable numbers
/// create their own registry instead of using [`global`].
///
/// [`global`]: IdentityRegistry::global
#[derive(Debug)]
pub struct IdentityRegistry {
    id: u64,
    next: AtomicU64,
}

impl IdentityRegistry {
    /// Create a registry whose first index is 1.
    pub fn new() -> Self {
        static REGISTRIES: AtomicU64 = AtomicU64::new(GLOBAL_REGISTRY + 1);
        Self::numbered(REGISTRIES.fetch_add(1, Ordering::Relaxed))
    }

    fn numbered(id: u64) -> Self {
        Self {
            id,
            next: AtomicU64::new(1),
        }
    }

    /// The process-wide registry used when no other one is configured.
    pub fn global() -> Arc<IdentityRegistry> {
        static GLOBAL: OnceLock<Arc<IdentityRegistry>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(IdentityRegistry::numbered(GLOBAL_REGISTRY))))
    }

    /// This registry's number, shared by every identity it assigns.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Return the identity of `cell`, assigning the next free one on the
    /// first call.
    ///
    /// A cell identified earlier by another registry keeps that identity.
    pub fn identity_of<C>(&self, cell: &C) -> CellId
    where
        C: Identified + ?Sized,
    {
        *cell.identity_slot().get_or_init(|| CellId {
            registry: self.id,
            index: self.next.fetch_add(1, Ordering::Relaxed),
        })
    }

    /// Number of identities handed out so far.
    pub fn allocated(&self) -> u64 {
        self.next.load(Ordering::Relaxed) - 1
    }
}

impl Default for IdentityRegistry {
    fn default() -> Self {
        Self::new()
    }
}
