//! A named mutual-exclusion lock backed by document insert-uniqueness.
//!
//! Acquiring the lock inserts a `{_id: key, lockId, acquiredAt}` record; the
//! store's uniqueness constraint on `_id` guarantees at most one holder per
//! key. A TTL index on `acquiredAt` reclaims records from crashed holders.
//! Release is a delete-if-match on `{_id, lockId}` so that a record already
//! reclaimed and re-acquired by someone else is never deleted.
//!
//! Acquisition ordering across processes is not FIFO: contention is resolved
//! by bounded randomized backoff, so starvation is possible but bounded by
//! the configured deadline.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::OnceCell;
use uuid::Uuid;

use refetch_store::{Document, DocumentStore, Filter, IndexSpec, StoreError, datetime_value};

use crate::config::{LockConfig, LockOptions};
use crate::retry::{Contention, RetryOptions, run_with_retry};

/// Field holding the opaque per-acquisition identifier.
pub const LOCK_ID_FIELD: &str = "lockId";
/// Field holding the acquisition timestamp, indexed for TTL expiry.
pub const ACQUIRED_AT_FIELD: &str = "acquiredAt";

/// An error during lock acquisition.
#[derive(Debug, Clone, Error)]
pub enum LockError {
    /// Another holder currently owns the lock and the retry budget is
    /// exhausted ("concurrent request").
    #[error("concurrent request: lock {0:?} is already held")]
    Conflict(String),
    /// A store operation failed for a reason other than a uniqueness
    /// conflict. Never retried.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Contention for LockError {
    fn is_contention(&self) -> bool {
        matches!(self, LockError::Conflict(_))
    }
}

/// A distributed mutual-exclusion lock over one document collection.
///
/// The lock is scoped to the collection behind `store`: two locks sharing a
/// store and a key exclude each other, across processes.
pub struct DistributedLock {
    store: Arc<dyn DocumentStore>,
    config: LockConfig,
    index_ensured: OnceCell<()>,
}

impl DistributedLock {
    pub fn new(store: Arc<dyn DocumentStore>, config: LockConfig) -> Self {
        Self {
            store,
            config,
            index_ensured: OnceCell::new(),
        }
    }

    /// Runs `callback` while holding the lock named `key`.
    ///
    /// The lock is acquired with bounded retries per the configuration, and
    /// released on every exit path, including cancellation. The callback's
    /// output is returned as-is after release; callers that need fallible
    /// callbacks return a `Result` from the callback itself.
    ///
    /// # Errors
    ///
    /// [`LockError::Conflict`] when the lock is still held by someone else
    /// once the deadline passes, [`LockError::Store`] for any other store
    /// fault.
    pub async fn with_lock<F, Fut, T>(&self, key: &str, callback: F) -> Result<T, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.with_lock_opts(key, LockOptions::from(&self.config), callback)
            .await
    }

    /// Like [`with_lock`](Self::with_lock), with a per-call retry budget.
    ///
    /// A zero `no_later_than` makes this a single try-acquire, so one lock
    /// instance can serve both patient and opportunistic callers.
    pub async fn with_lock_opts<F, Fut, T>(
        &self,
        key: &str,
        options: LockOptions,
        callback: F,
    ) -> Result<T, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.ensure_index().await?;

        let retry = RetryOptions {
            no_later_than: options.no_later_than,
            start_attempts_delay: options.start_attempts_delay,
        };
        let lock_id = run_with_retry(|| self.try_acquire(key), &retry).await?;

        let mut guard = ReleaseGuard {
            store: Arc::clone(&self.store),
            key: key.to_owned(),
            lock_id,
            released: false,
        };

        let result = callback().await;
        guard.release().await;
        Ok(result)
    }

    /// One acquisition attempt: insert a fresh lock record.
    ///
    /// A duplicate-key failure is classified as a retryable conflict; any
    /// other store error propagates unconditionally.
    async fn try_acquire(&self, key: &str) -> Result<String, LockError> {
        let lock_id = Uuid::new_v4().simple().to_string();
        let record = Document::new(key)
            .with_field(LOCK_ID_FIELD, lock_id.clone())
            .with_field(ACQUIRED_AT_FIELD, datetime_value(Utc::now()));

        match self.store.insert_one(record).await {
            Ok(()) => {
                tracing::trace!(key, lock_id = %lock_id, "lock acquired");
                Ok(lock_id)
            }
            Err(err) if err.is_duplicate_key() => Err(LockError::Conflict(key.to_owned())),
            Err(err) => Err(LockError::Store(err)),
        }
    }

    async fn ensure_index(&self) -> Result<(), StoreError> {
        let store = &self.store;
        let expiry = self.config.expiry;
        self.index_ensured
            .get_or_try_init(|| store.create_index(IndexSpec::ttl(ACQUIRED_AT_FIELD, expiry)))
            .await?;
        Ok(())
    }
}

/// Deletes the lock record matching `{_id: key, lockId}` when released or
/// dropped.
///
/// The match on `lockId` guards against deleting a record that was already
/// reclaimed by store-side expiry and re-acquired by another holder.
struct ReleaseGuard {
    store: Arc<dyn DocumentStore>,
    key: String,
    lock_id: String,
    released: bool,
}

impl ReleaseGuard {
    async fn release(&mut self) {
        self.released = true;
        let filter = Filter::id(self.key.clone()).field(LOCK_ID_FIELD, self.lock_id.clone());
        // A missing record is fine here: it was reclaimed by expiry.
        if let Err(err) = self.store.delete_one(&filter).await {
            tracing::warn!(
                key = %self.key,
                error = %err,
                "failed to release lock; record will expire via TTL",
            );
        }
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // The callback future was dropped before release. Spawn a
        // best-effort delete; TTL expiry covers the case where no runtime
        // is available.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let store = Arc::clone(&self.store);
        let filter = Filter::id(self.key.clone()).field(LOCK_ID_FIELD, self.lock_id.clone());
        handle.spawn(async move {
            let _ = store.delete_one(&filter).await;
        });
    }
}
