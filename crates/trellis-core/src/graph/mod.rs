//! Relationship graph for Trellis.
//!
//! Maintains, per project, a directed graph whose nodes are data models and
//! whose edges are declared relationships. Guards the two referential
//! invariants: no all-cascade cycles, and no observable dangling references
//! across committed states.

mod graph;
mod relation;

pub use graph::{DeletionPlan, PlannedDelete, RelationGraph};
pub use relation::{IntegrityMode, RelationDef};
