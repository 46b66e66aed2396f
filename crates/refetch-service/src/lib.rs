//! # Refetch services
//!
//! Coordination services built on top of an atomic document store:
//!
//! - [`lock`] provides a named mutual-exclusion lock backed by document
//!   insert-uniqueness, with store-side TTL expiry as crash recovery and a
//!   bounded-retry acquisition loop.
//! - [`retry`] is the generic bounded-backoff retry policy used by the lock,
//!   applicable to any fallible operation whose failure mode is transient
//!   contention.
//! - [`fetch`] is a single-flight cache fetcher: it wraps a remote resource
//!   fetch behind a cache record, coalesces concurrent callers per cache
//!   key, revalidates conditionally with ETag-style validators, and degrades
//!   to stale content when the upstream fails or is too slow.
//!
//! ## Concurrency model
//!
//! Everything here is cooperative async. Within one process, at most one
//! underlying cache resolution runs per key at a time; attached callers are
//! served after that resolution completes, each with an independently
//! mutable deep copy of the result. Across processes the *only*
//! synchronization primitives are the store's atomic insert-uniqueness and
//! compare-and-swap update; no in-memory state is shared.
//!
//! Deadlines abandon work rather than abort it: once a refresh times out,
//! the underlying network call keeps running in a background task and its
//! eventual store write is allowed to complete.
//!
//! ## Error taxonomy
//!
//! Lock conflicts are a distinguished, retryable error kind carried
//! structurally on the error value ([`lock::LockError::Conflict`]); all
//! other store faults are fatal and never retried. Upstream fetch faults,
//! parse faults, and refresh timeouts are recoverable by serving stale
//! cache content where it exists, and are reported through the configured
//! error callback (and `tracing`) even when the caller receives a
//! successful-looking result. Callers distinguish staleness via
//! [`fetch::FetchOutcome::is_cache_fresh`], never via an error.

pub mod config;
pub mod fetch;
pub mod lock;
pub mod retry;
