//! Trellis shared types.
//!
//! This crate defines the runtime value model and mutation IR shared by the
//! Trellis engine crates.
//!
//! # Modules
//!
//! - [`value`] - Runtime value types for document fields
//! - [`mutation`] - Mutation IR describing write operations
//! - [`error`] - Shared error types
//!
//! # Serialization
//!
//! Types used in catalog snapshots derive `rkyv::Archive`, `rkyv::Serialize`,
//! and `rkyv::Deserialize`; everything also derives serde traits because
//! documents, policies, and workflow runs persist as JSON.

pub mod error;
pub mod mutation;
pub mod value;

pub use error::Error;
pub use mutation::{FieldValue, Mutation, MutationKind};
pub use value::Value;
