use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;

/// Controls lock acquisition and expiry.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Deadline by which the *last* acquisition attempt must start.
    ///
    /// Once retrying would push past this deadline, acquisition fails with a
    /// lock conflict.
    #[serde(with = "humantime_serde")]
    pub no_later_than: Duration,

    /// Base delay for the first retry; subsequent retries back off
    /// quadratically in the attempt number.
    #[serde(with = "humantime_serde")]
    pub start_attempts_delay: Duration,

    /// Store-side expiry window for lock records.
    ///
    /// The TTL index on `acquiredAt` removes lock records older than this,
    /// which is the safety net against a crashed holder that never releases.
    #[serde(with = "humantime_serde")]
    pub expiry: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            no_later_than: Duration::from_millis(1000),
            start_attempts_delay: Duration::from_millis(50),
            expiry: Duration::from_secs(120),
        }
    }
}

/// Per-call overrides for one lock acquisition.
///
/// Defaults to the values of [`LockConfig`]; a zero `no_later_than` turns
/// the call into a single try-acquire.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LockOptions {
    /// Deadline by which the *last* acquisition attempt must start.
    #[serde(with = "humantime_serde")]
    pub no_later_than: Duration,

    /// Base delay for the first retry.
    #[serde(with = "humantime_serde")]
    pub start_attempts_delay: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        let config = LockConfig::default();
        Self {
            no_later_than: config.no_later_than,
            start_attempts_delay: config.start_attempts_delay,
        }
    }
}

impl From<&LockConfig> for LockOptions {
    fn from(config: &LockConfig) -> Self {
        Self {
            no_later_than: config.no_later_than,
            start_attempts_delay: config.start_attempts_delay,
        }
    }
}

/// Per-request options for the remote fetch.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FetchOptions {
    /// Additional request headers.
    pub headers: BTreeMap<String, String>,
    /// Per-request network timeout. Distinct from
    /// [`FetcherConfig::timeout`], which bounds the whole refresh.
    #[serde(with = "humantime_serde")]
    pub timeout: Option<Duration>,
}

/// Configuration for a [`CachedFetcher`](crate::fetch::CachedFetcher).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetcherConfig {
    /// Default resource URL, used when a fetch request does not carry one.
    pub url: Option<String>,

    /// How long a cache record counts as fresh after its last successful
    /// fetch or revalidation.
    ///
    /// The default of zero means always-stale: every call revalidates
    /// against the upstream.
    #[serde(with = "humantime_serde")]
    pub cache_lifetime: Duration,

    /// Wall-clock deadline for a whole refresh (conditional fetch plus
    /// write-back). When it fires and a stale record exists, the stale
    /// record is served instead.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Default options for the remote fetch.
    pub fetch_options: FetchOptions,

    /// Ensure the covering index on `{_id, fetchedAt, etag}` on first use,
    /// so metadata reads never have to touch `content`.
    pub ensure_indexes: bool,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            url: None,
            cache_lifetime: Duration::ZERO,
            timeout: Duration::from_millis(2000),
            fetch_options: FetchOptions::default(),
            ensure_indexes: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configs_deserialize_with_defaults() {
        let lock: LockConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(lock.no_later_than, Duration::from_millis(1000));
        assert_eq!(lock.start_attempts_delay, Duration::from_millis(50));
        assert_eq!(lock.expiry, Duration::from_secs(120));

        let fetcher: FetcherConfig = serde_json::from_str(
            r#"{"url": "https://example.com/cfg", "cache_lifetime": "10s", "timeout": "2s"}"#,
        )
        .unwrap();
        assert_eq!(fetcher.url.as_deref(), Some("https://example.com/cfg"));
        assert_eq!(fetcher.cache_lifetime, Duration::from_secs(10));
        assert!(fetcher.ensure_indexes);
    }
}
