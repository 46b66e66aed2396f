//! The document store abstraction underlying the `refetch` services.
//!
//! The locking and cached-fetch services only require a handful of atomic
//! single-document operations, which are collected in the [`DocumentStore`]
//! trait. One trait object corresponds to one *collection* of documents, each
//! keyed by a unique `_id`. The trait is intentionally small so that it can be
//! backed by any document database exposing compare-and-swap updates,
//! insert-uniqueness, and TTL-style index expiry.
//!
//! Two things are central to how the services use this trait:
//!
//! - [`DocumentStore::insert_one`] must fail with
//!   [`StoreError::DuplicateKey`] when the `_id` collides. This is the sole
//!   primitive behind mutual exclusion.
//! - [`DocumentStore::find_one_and_update`] must be atomic with respect to
//!   the whole [`Filter`], which makes it a compare-and-swap when the filter
//!   includes a previously observed field value.
//!
//! The crate ships a [`MemoryStore`] backend which emulates TTL indexes by
//! lazily discarding expired documents. It serves both as the test double and
//! as an embedded single-process backend.

mod document;
mod memory;
mod store;

pub use document::{Document, Filter, IndexSpec, Update, datetime_value, parse_datetime};
pub use memory::MemoryStore;
pub use store::{DocumentStore, FindAndUpdateOptions, FindAndUpdateResult, StoreError};

/// The reserved unique-id field of every document.
pub const ID_FIELD: &str = "_id";
