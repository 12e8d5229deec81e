//! Document store contract and the sled-backed implementation.
//!
//! The engine performs every instance read and write through the
//! [`DocumentStore`] trait: get/create/update/delete by id plus a full
//! collection scan, all bounded by a caller-supplied deadline and raising
//! distinguishable not-found, conflict, and unavailable conditions. Updates
//! and deletes are conditional on an expected version; a losing writer gets
//! [`StoreError::Conflict`](crate::error::StoreError::Conflict), never a
//! silent overwrite.

mod document;
mod sled_store;

pub use document::Document;
pub use sled_store::SledStore;

use std::time::{Duration, Instant};

use trellis_proto::FieldValue;

use crate::error::StoreError;

/// Deadline for a store call. Expiry is reported as
/// [`StoreError::Unavailable`](crate::error::StoreError::Unavailable), which
/// the workflow engine treats as a transient condition.
#[derive(Debug, Clone, Copy)]
pub struct Deadline(Instant);

impl Deadline {
    /// A deadline `timeout` from now.
    pub fn after(timeout: Duration) -> Self {
        Deadline(Instant::now() + timeout)
    }

    /// Whether the deadline has passed.
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.0
    }

    /// Error out if the deadline has passed.
    pub fn check(&self) -> Result<(), StoreError> {
        if self.is_expired() {
            Err(StoreError::Unavailable("deadline exceeded".into()))
        } else {
            Ok(())
        }
    }
}

/// Name of the collection holding instances of a model within a project.
pub fn collection_name(project: &str, model: &str) -> String {
    format!("{}:{}", project, model)
}

/// Abstract document store the engine mutates through.
///
/// Implementations must guarantee single-document atomicity: an update either
/// applies the whole patch at the expected version or changes nothing.
pub trait DocumentStore: Send + Sync {
    /// Fetch a document by id.
    fn get(&self, collection: &str, id: &str, deadline: Deadline) -> Result<Document, StoreError>;

    /// Insert a new document. The stored version is 1. Fails with
    /// `Conflict` if the id already exists.
    fn create(
        &self,
        collection: &str,
        doc: Document,
        deadline: Deadline,
    ) -> Result<Document, StoreError>;

    /// Merge `patch` into the document, conditional on `expected_version`.
    /// Returns the committed document (version incremented by 1).
    fn update(
        &self,
        collection: &str,
        id: &str,
        patch: &[FieldValue],
        expected_version: u64,
        deadline: Deadline,
    ) -> Result<Document, StoreError>;

    /// Remove the document, conditional on `expected_version`. Returns the
    /// removed document as its pre-image.
    fn delete(
        &self,
        collection: &str,
        id: &str,
        expected_version: u64,
        deadline: Deadline,
    ) -> Result<Document, StoreError>;

    /// Scan every document in a collection. Reflects the most recently
    /// committed state.
    fn list(&self, collection: &str, deadline: Deadline) -> Result<Vec<Document>, StoreError>;
}
