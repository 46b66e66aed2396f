//! The single-flight cache fetcher.
//!
//! [`CachedFetcher`] wraps a remote resource fetch behind a cache record in
//! the document store. Per cache key it:
//!
//! 1. coalesces concurrent callers onto one in-flight resolution, fanning
//!    the result out as independently mutable deep copies;
//! 2. reads only `{fetchedAt, etag}` from the cache record, so large
//!    payloads are not held in memory during the refresh;
//! 3. skips the network entirely while the record is fresh;
//! 4. otherwise revalidates conditionally with the stored validator,
//!    deriving a weak validator from the body when the upstream sends none;
//! 5. on "not modified", bumps only `fetchedAt` with a compare-and-swap,
//!    re-reading instead of overwriting when another process refreshed
//!    concurrently;
//! 6. on new content, transforms and upserts the full record;
//! 7. serves the stale record (flagged via
//!    [`FetchOutcome::is_cache_fresh`]) when the upstream fails or the
//!    refresh deadline fires, as long as a prior record exists.
//!
//! Content is materialized lazily, at most once per resolution, and only
//! when a caller actually needs it.

mod http;
mod single_flight;
mod validator;

pub use http::{HttpFetch, RemoteFetch, RemoteResponse};
pub use validator::derive_weak_validator;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::OnceCell;

use refetch_store::{
    Document, DocumentStore, Filter, FindAndUpdateOptions, ID_FIELD, IndexSpec, StoreError,
    Update, datetime_value, parse_datetime,
};

use crate::config::{FetchOptions, FetcherConfig};
use crate::fetch::single_flight::SingleFlight;

/// Cache record field holding the cached resource body.
pub const CONTENT_FIELD: &str = "content";
/// Cache record field holding the validator.
pub const ETAG_FIELD: &str = "etag";
/// Cache record field holding the last successful fetch/revalidation time.
pub const FETCHED_AT_FIELD: &str = "fetchedAt";

/// An error from the cache fetcher.
///
/// `Clone` so it can flow through the shared future of a coalesced
/// resolution to every attached caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The remote returned an error status or the transport failed.
    /// Recoverable by serving stale content when a prior record exists.
    #[error("upstream fetch failed: {0}")]
    Upstream(String),
    /// The fetched body is not valid content. Handled like an upstream
    /// fault.
    #[error("malformed upstream response: {0}")]
    Malformed(String),
    /// The refresh did not complete within the configured deadline.
    /// Recoverable via stale fallback.
    #[error("cache refresh timed out after {0:?}")]
    Timeout(Duration),
    /// A store operation failed. Always fatal, never retried.
    #[error("store error: {0}")]
    Store(String),
    /// A cache record was expected but absent. Signals a bug or external
    /// tampering; always fatal.
    #[error("cache record missing for key {0:?}")]
    MissingRecord(String),
    /// The fetcher is misconfigured, e.g. called without a URL. Always
    /// fatal.
    #[error("configuration error: {0}")]
    Config(String),
    /// An unexpected error inside the fetcher itself.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for FetchError {
    fn from(err: StoreError) -> Self {
        FetchError::Store(err.to_string())
    }
}

impl FetchError {
    /// Whether a stale cache record may be served instead of this error.
    fn allows_stale_fallback(&self) -> bool {
        matches!(
            self,
            FetchError::Upstream(_) | FetchError::Malformed(_) | FetchError::Timeout(_)
        )
    }
}

/// Per-call options for [`CachedFetcher::fetch`].
#[derive(Debug, Clone, Default)]
pub struct FetchRequest {
    /// Resource URL; falls back to [`FetcherConfig::url`].
    pub url: Option<String>,
    /// Cache key; defaults to the URL.
    pub key: Option<String>,
    /// Overrides the configured fetch options for this call.
    pub fetch_options: Option<FetchOptions>,
    /// Caller-supplied validator: when it matches the resolved validator,
    /// content loading is skipped and the outcome reports `etag_match`.
    pub if_none_match: Option<String>,
    /// Resolve metadata only; the outcome carries no content.
    pub meta_only: bool,
}

impl FetchRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn if_none_match(mut self, validator: impl Into<String>) -> Self {
        self.if_none_match = Some(validator.into());
        self
    }

    pub fn meta_only(mut self) -> Self {
        self.meta_only = true;
        self
    }
}

/// The result of a cached fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchOutcome {
    /// Whether the served record was fresh (successfully validated within
    /// the cache lifetime), as opposed to a stale fallback.
    pub is_cache_fresh: bool,
    /// The resolved validator.
    pub etag: String,
    /// Whether the caller's `if_none_match` validator matched.
    pub etag_match: bool,
    /// The content, unless `meta_only` was requested or the caller's
    /// validator already matched.
    pub content: Option<Value>,
    /// When the served record was last fetched or revalidated.
    pub fetched_at: DateTime<Utc>,
}

type Transform = Arc<dyn Fn(Value, &str) -> Value + Send + Sync>;
type ErrorLogger = Arc<dyn Fn(&FetchError) + Send + Sync>;
type ResolveResult = Result<Arc<Resolution>, FetchError>;

/// A single-flight cached fetcher over one document collection.
///
/// Each fetcher owns its in-flight resolver table, so independent fetchers
/// never coalesce with each other. Cloning is cheap and clones share the
/// table.
#[derive(Clone)]
pub struct CachedFetcher {
    store: Arc<dyn DocumentStore>,
    config: FetcherConfig,
    remote: Arc<dyn RemoteFetch>,
    transform: Option<Transform>,
    log_error: ErrorLogger,
    in_flight: Arc<SingleFlight<ResolveResult>>,
    index_ensured: Arc<OnceCell<()>>,
}

impl std::fmt::Debug for CachedFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedFetcher")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CachedFetcher {
    pub fn new(store: Arc<dyn DocumentStore>, config: FetcherConfig) -> Self {
        Self {
            store,
            config,
            remote: Arc::new(HttpFetch::new()),
            transform: None,
            log_error: Arc::new(|err| {
                tracing::error!(error = %err, "cache refresh failed");
            }),
            in_flight: Arc::new(SingleFlight::new()),
            index_ensured: Arc::new(OnceCell::new()),
        }
    }

    /// Substitutes the remote fetch implementation.
    pub fn with_remote(mut self, remote: Arc<dyn RemoteFetch>) -> Self {
        self.remote = remote;
        self
    }

    /// Applies `transform(content, key)` to newly fetched content before it
    /// is stored.
    pub fn with_transform<F>(mut self, transform: F) -> Self
    where
        F: Fn(Value, &str) -> Value + Send + Sync + 'static,
    {
        self.transform = Some(Arc::new(transform));
        self
    }

    /// Replaces the error callback invoked for handled-but-notable
    /// failures (stale fallbacks and refresh timeouts).
    pub fn with_log_error<F>(mut self, log_error: F) -> Self
    where
        F: Fn(&FetchError) + Send + Sync + 'static,
    {
        self.log_error = Arc::new(log_error);
        self
    }

    /// Fetches the resource for `request`, serving from cache where
    /// possible.
    ///
    /// Concurrent calls for the same key share one resolution; each caller
    /// receives an independently mutable copy of the result.
    pub async fn fetch(&self, request: FetchRequest) -> Result<FetchOutcome, FetchError> {
        let url = request
            .url
            .clone()
            .or_else(|| self.config.url.clone())
            .ok_or_else(|| FetchError::Config("no url configured".into()))?;
        let key = request.key.clone().unwrap_or_else(|| url.clone());

        let state = ResolveState {
            store: Arc::clone(&self.store),
            remote: Arc::clone(&self.remote),
            transform: self.transform.clone(),
            log_error: Arc::clone(&self.log_error),
            cache_lifetime: self.config.cache_lifetime,
            timeout: self.config.timeout,
            ensure_indexes: self.config.ensure_indexes,
            index_ensured: Arc::clone(&self.index_ensured),
            url,
            key: key.clone(),
            fetch_options: request
                .fetch_options
                .clone()
                .unwrap_or_else(|| self.config.fetch_options.clone()),
        };

        let resolution = self
            .in_flight
            .run(&key, move || resolve(state).boxed())
            .await?;

        let etag_match = request.if_none_match.as_deref() == Some(resolution.etag.as_str());
        let content = if request.meta_only || etag_match {
            None
        } else {
            Some(resolution.content().await?)
        };

        Ok(FetchOutcome {
            is_cache_fresh: resolution.is_cache_fresh,
            etag: resolution.etag.clone(),
            etag_match,
            content,
            fetched_at: resolution.fetched_at,
        })
    }
}

/// Everything one resolution needs, detached from the fetcher so the
/// resolution future is `'static`.
#[derive(Clone)]
struct ResolveState {
    store: Arc<dyn DocumentStore>,
    remote: Arc<dyn RemoteFetch>,
    transform: Option<Transform>,
    log_error: ErrorLogger,
    cache_lifetime: Duration,
    timeout: Duration,
    ensure_indexes: bool,
    index_ensured: Arc<OnceCell<()>>,
    url: String,
    key: String,
    fetch_options: FetchOptions,
}

/// The shared output of one coalesced resolution.
///
/// Metadata is resolved eagerly; content is loaded from the store lazily
/// and memoized, unless the refresh itself already produced it.
struct Resolution {
    key: String,
    etag: String,
    fetched_at: DateTime<Utc>,
    is_cache_fresh: bool,
    store: Arc<dyn DocumentStore>,
    content: OnceCell<Value>,
}

impl Resolution {
    fn lazy(state: &ResolveState, etag: String, fetched_at: DateTime<Utc>, fresh: bool) -> Self {
        Self {
            key: state.key.clone(),
            etag,
            fetched_at,
            is_cache_fresh: fresh,
            store: Arc::clone(&state.store),
            content: OnceCell::new(),
        }
    }

    fn with_content(
        state: &ResolveState,
        etag: String,
        fetched_at: DateTime<Utc>,
        content: Value,
    ) -> Self {
        Self {
            key: state.key.clone(),
            etag,
            fetched_at,
            is_cache_fresh: true,
            store: Arc::clone(&state.store),
            content: OnceCell::new_with(Some(content)),
        }
    }

    /// Loads the content, memoized across all attached callers. The
    /// returned value is a deep copy owned by the caller.
    async fn content(&self) -> Result<Value, FetchError> {
        let value = self
            .content
            .get_or_try_init(|| async {
                let doc = self
                    .store
                    .find_one(&Filter::id(self.key.as_str()), Some(&[CONTENT_FIELD]))
                    .await?;
                doc.and_then(|doc| doc.get(CONTENT_FIELD).cloned())
                    .ok_or_else(|| FetchError::MissingRecord(self.key.clone()))
            })
            .await?;
        Ok(value.clone())
    }
}

/// Metadata of an existing cache record, as read by the projection query.
#[derive(Debug, Clone)]
struct PriorMeta {
    etag: String,
    fetched_at: DateTime<Utc>,
    /// The raw stored `fetchedAt` value, kept verbatim so the
    /// compare-and-swap filter matches exactly what is stored.
    fetched_at_raw: Value,
}

/// One full resolution for a key: freshness check, refresh with timeout,
/// stale fallback.
async fn resolve(state: ResolveState) -> ResolveResult {
    if state.ensure_indexes {
        let store = Arc::clone(&state.store);
        state
            .index_ensured
            .get_or_try_init(|| async move {
                store
                    .create_index(IndexSpec::on(&[ID_FIELD, FETCHED_AT_FIELD, ETAG_FIELD]))
                    .await
            })
            .await
            .map_err(FetchError::from)?;
    }

    let prior = read_meta(&state.store, &state.key).await?;

    if let Some(meta) = &prior {
        if is_fresh(meta.fetched_at, state.cache_lifetime) {
            tracing::trace!(key = %state.key, "cache record is fresh, skipping fetch");
            return Ok(Arc::new(Resolution::lazy(
                &state,
                meta.etag.clone(),
                meta.fetched_at,
                true,
            )));
        }
    }

    // The refresh runs in its own task: when the deadline fires the task is
    // abandoned, not aborted, so its eventual store write still completes.
    let mut refresh_task = tokio::spawn(refresh(state.clone(), prior.clone()));

    match tokio::time::timeout(state.timeout, &mut refresh_task).await {
        Ok(Ok(Ok(resolution))) => Ok(Arc::new(resolution)),
        Ok(Ok(Err(err))) if err.allows_stale_fallback() => stale_or(err, prior, &state),
        Ok(Ok(Err(err))) => Err(err),
        Ok(Err(join_err)) => Err(FetchError::Internal(format!(
            "refresh task failed: {join_err}"
        ))),
        Err(_elapsed) => stale_or(FetchError::Timeout(state.timeout), prior, &state),
    }
}

/// Serves the stale record for a recoverable error, or propagates it when
/// there is nothing to serve. The error is reported either way.
fn stale_or(err: FetchError, prior: Option<PriorMeta>, state: &ResolveState) -> ResolveResult {
    (state.log_error)(&err);
    match prior {
        Some(meta) => {
            tracing::warn!(key = %state.key, error = %err, "serving stale cache record");
            Ok(Arc::new(Resolution::lazy(
                state,
                meta.etag,
                meta.fetched_at,
                false,
            )))
        }
        None => Err(err),
    }
}

/// The conditional fetch plus write-back (raced against the refresh
/// deadline by [`resolve`]).
async fn refresh(state: ResolveState, prior: Option<PriorMeta>) -> Result<Resolution, FetchError> {
    let stored_etag = prior.as_ref().map(|meta| meta.etag.as_str());
    let response = state
        .remote
        .fetch(&state.url, stored_etag, &state.fetch_options)
        .await?;

    if response.is_not_modified() {
        let meta = prior.as_ref().ok_or_else(|| {
            FetchError::Upstream("upstream returned not-modified without a prior record".into())
        })?;
        return not_modified(&state, meta).await;
    }

    let etag = response
        .etag
        .clone()
        .unwrap_or_else(|| derive_weak_validator(&response.body));

    // Validator equality counts as not modified too; this is what makes
    // derived validators useful for upstreams without ETag support.
    if let Some(meta) = &prior {
        if etag == meta.etag {
            return not_modified(&state, meta).await;
        }
    }

    let content: Value = serde_json::from_slice(&response.body)
        .map_err(|err| FetchError::Malformed(err.to_string()))?;
    let content = match &state.transform {
        Some(transform) => transform(content, &state.key),
        None => content,
    };

    let now = Utc::now();
    let record = Document::new(state.key.as_str())
        .with_field(CONTENT_FIELD, content.clone())
        .with_field(ETAG_FIELD, etag.clone())
        .with_field(FETCHED_AT_FIELD, datetime_value(now));
    state
        .store
        .replace_one(&Filter::id(state.key.as_str()), record, true)
        .await?;

    tracing::debug!(key = %state.key, etag = %etag, "cache record replaced with new content");
    Ok(Resolution::with_content(&state, etag, now, content))
}

/// The upstream confirmed no change: bump only `fetchedAt`, conditioned on
/// it still holding the previously observed value.
async fn not_modified(state: &ResolveState, meta: &PriorMeta) -> Result<Resolution, FetchError> {
    // Always-revalidate mode: bumping the timestamp buys nothing, the next
    // call revalidates anyway.
    if state.cache_lifetime.is_zero() {
        return Ok(Resolution::lazy(
            state,
            meta.etag.clone(),
            meta.fetched_at,
            true,
        ));
    }

    let now = Utc::now();
    let filter =
        Filter::id(state.key.as_str()).field(FETCHED_AT_FIELD, meta.fetched_at_raw.clone());
    let update = Update::set(FETCHED_AT_FIELD, datetime_value(now));
    let result = state
        .store
        .find_one_and_update(
            &filter,
            &update,
            FindAndUpdateOptions {
                return_new: true,
                projection: Some(vec![FETCHED_AT_FIELD.into(), ETAG_FIELD.into()]),
            },
        )
        .await?;

    if result.matched {
        return Ok(Resolution::lazy(state, meta.etag.clone(), now, true));
    }

    // Another process refreshed the record in the meantime; use its state
    // rather than overwriting the fresher write.
    tracing::debug!(key = %state.key, "record was refreshed concurrently, re-reading");
    let current = read_meta(&state.store, &state.key)
        .await?
        .ok_or_else(|| FetchError::MissingRecord(state.key.clone()))?;
    Ok(Resolution::lazy(
        state,
        current.etag,
        current.fetched_at,
        true,
    ))
}

/// Reads only `{fetchedAt, etag}` from the cache record, leaving `content`
/// in the store.
async fn read_meta(
    store: &Arc<dyn DocumentStore>,
    key: &str,
) -> Result<Option<PriorMeta>, FetchError> {
    let doc = store
        .find_one(&Filter::id(key), Some(&[FETCHED_AT_FIELD, ETAG_FIELD]))
        .await?;
    Ok(doc.and_then(|doc| {
        let fetched_at_raw = doc.get(FETCHED_AT_FIELD)?.clone();
        let fetched_at = parse_datetime(&fetched_at_raw)?;
        let etag = doc.get(ETAG_FIELD)?.as_str()?.to_owned();
        Some(PriorMeta {
            etag,
            fetched_at,
            fetched_at_raw,
        })
    }))
}

/// A record is fresh iff its last fetch is within the cache lifetime. A
/// zero lifetime means always-stale.
fn is_fresh(fetched_at: DateTime<Utc>, lifetime: Duration) -> bool {
    if lifetime.is_zero() {
        return false;
    }
    let Ok(lifetime) = chrono::Duration::from_std(lifetime) else {
        return true;
    };
    Utc::now().signed_duration_since(fetched_at) < lifetime
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_lifetime_is_never_fresh() {
        assert!(!is_fresh(Utc::now(), Duration::ZERO));
    }

    #[test]
    fn freshness_follows_the_lifetime_window() {
        let lifetime = Duration::from_secs(10);
        assert!(is_fresh(Utc::now(), lifetime));
        let old = Utc::now() - chrono::Duration::seconds(11);
        assert!(!is_fresh(old, lifetime));
    }

    #[test]
    fn recoverable_errors_allow_stale_fallback() {
        assert!(FetchError::Upstream("500".into()).allows_stale_fallback());
        assert!(FetchError::Malformed("bad json".into()).allows_stale_fallback());
        assert!(FetchError::Timeout(Duration::from_secs(2)).allows_stale_fallback());
        assert!(!FetchError::Store("io".into()).allows_stale_fallback());
        assert!(!FetchError::MissingRecord("cfg".into()).allows_stale_fallback());
        assert!(!FetchError::Config("no url".into()).allows_stale_fallback());
    }
}
