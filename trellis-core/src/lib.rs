//! Trellis Core
//!
//! This crate provides lazy, demand-driven reactive cells. It implements:
//!
//! - Base cells with change notification and demand-aware slots
//! - Formula cells whose dependencies are discovered on every evaluation
//! - Attach/detach driven by whether anyone still consumes a value
//! - Early exit from formulas whose required inputs are missing
//!
//! # Architecture
//!
//! - `reactive`: cells, formula cells, dependency capture and demand tracking
//! - `error`: the crate-wide error type
//!
//! # Example
//!
//! ```rust
//! use trellis_core::reactive::{compute, Cell, FormulaCell, Value};
//!
//! let first = Cell::new("Ada".to_string());
//! let last: Cell<String> = Cell::unset();
//!
//! let (f, l) = (first.clone(), last.clone());
//! let full: FormulaCell<String> =
//!     compute(move |v| Ok(format!("{} {}", v.need(&f)?, v.need(&l)?)));
//!
//! let watch = full.changed_slot().subscribe(|| Ok(())).unwrap();
//!
//! // `last` is missing, so `full` has no value yet
//! assert!(full.value().is_unset());
//!
//! last.set_value("Lovelace".to_string()).unwrap();
//! assert_eq!(full.get().as_deref(), Some("Ada Lovelace"));
//!
//! full.changed_slot().unsubscribe(&watch).unwrap();
//! assert!(matches!(full.value(), Value::Ready(_)));
//! ```

pub mod error;
pub mod reactive;

pub use error::{CellError, Result};
