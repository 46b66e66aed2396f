use async_trait::async_trait;
use thiserror::Error;

use crate::document::{Document, Filter, IndexSpec, Update};

/// An error raised by a [`DocumentStore`] operation.
///
/// Only [`DuplicateKey`](Self::DuplicateKey) is ever treated as retryable by
/// the services built on top; every other variant is a fatal store fault and
/// is propagated unconditionally.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// An insert collided with an existing `_id` (or another unique index).
    #[error("duplicate key: {0}")]
    DuplicateKey(String),
    /// The backend failed to execute the operation.
    #[error("store backend error: {0}")]
    Backend(String),
    /// A document could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Whether this error is a uniqueness conflict.
    pub fn is_duplicate_key(&self) -> bool {
        matches!(self, StoreError::DuplicateKey(_))
    }
}

/// Options for [`DocumentStore::find_one_and_update`].
#[derive(Debug, Clone, Default)]
pub struct FindAndUpdateOptions {
    /// Return the document as it looks after the update, instead of before.
    pub return_new: bool,
    /// Restrict the returned document to these fields.
    pub projection: Option<Vec<String>>,
}

/// Outcome of [`DocumentStore::find_one_and_update`].
#[derive(Debug, Clone, Default)]
pub struct FindAndUpdateResult {
    /// Whether a document matched the filter (and was therefore updated).
    pub matched: bool,
    /// The matched document (pre- or post-update depending on
    /// [`FindAndUpdateOptions::return_new`]), if any.
    pub value: Option<Document>,
}

/// Atomic single-document operations over one collection.
///
/// Implementations must guarantee that each method is atomic with respect to
/// concurrent calls from other processes; this is the only cross-process
/// synchronization primitive the services rely on.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Finds the document matching `filter`, optionally projected to the
    /// given fields.
    async fn find_one(
        &self,
        filter: &Filter,
        projection: Option<&[&str]>,
    ) -> Result<Option<Document>, StoreError>;

    /// Atomically applies `update` to the document matching `filter`.
    ///
    /// The match against the *whole* filter and the update are a single
    /// atomic step, which makes this a compare-and-swap when the filter pins
    /// a previously observed field value.
    async fn find_one_and_update(
        &self,
        filter: &Filter,
        update: &Update,
        options: FindAndUpdateOptions,
    ) -> Result<FindAndUpdateResult, StoreError>;

    /// Replaces the document matching `filter` wholesale, inserting
    /// `document` if nothing matches and `upsert` is set.
    async fn replace_one(
        &self,
        filter: &Filter,
        document: Document,
        upsert: bool,
    ) -> Result<(), StoreError>;

    /// Inserts a new document, failing with [`StoreError::DuplicateKey`] if
    /// the `_id` already exists.
    async fn insert_one(&self, document: Document) -> Result<(), StoreError>;

    /// Deletes the document matching `filter`. Returns whether a document
    /// was deleted.
    async fn delete_one(&self, filter: &Filter) -> Result<bool, StoreError>;

    /// Ensures an index exists. Idempotent: creating the same index twice is
    /// a no-op.
    async fn create_index(&self, spec: IndexSpec) -> Result<(), StoreError>;
}
