//! End-to-end tests over real HTTP, using the local content server.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use refetch_service::config::FetcherConfig;
use refetch_service::fetch::{CachedFetcher, FetchRequest};
use refetch_store::{DocumentStore, MemoryStore};

use refetch_test::ContentServer;

fn fetcher(store: &Arc<MemoryStore>, config: FetcherConfig) -> CachedFetcher {
    let store: Arc<dyn DocumentStore> = Arc::clone(store) as _;
    CachedFetcher::new(store, config)
}

#[tokio::test]
async fn conditional_refetch_over_http() {
    refetch_test::setup();
    let server = ContentServer::spawn(json!({"version": 1})).await;
    let store = Arc::new(MemoryStore::new());
    let fetcher = fetcher(&store, FetcherConfig::default());

    let first = fetcher
        .fetch(FetchRequest::new().url(server.url()))
        .await
        .unwrap();
    assert!(first.is_cache_fresh);
    assert_eq!(first.content, Some(json!({"version": 1})));
    assert_eq!(server.hits(), 1);

    // Revalidation sends the stored validator and gets a 304 back.
    let second = fetcher
        .fetch(FetchRequest::new().url(server.url()))
        .await
        .unwrap();
    assert!(second.is_cache_fresh);
    assert_eq!(second.etag, first.etag);
    assert_eq!(second.content, Some(json!({"version": 1})));
    assert_eq!(server.hits(), 2);

    server.set_payload(json!({"version": 2}));
    let third = fetcher
        .fetch(FetchRequest::new().url(server.url()))
        .await
        .unwrap();
    assert!(third.is_cache_fresh);
    assert_ne!(third.etag, first.etag);
    assert_eq!(third.content, Some(json!({"version": 2})));
    assert_eq!(server.hits(), 3);
}

#[tokio::test]
async fn server_failure_degrades_to_stale_content() {
    refetch_test::setup();
    let server = ContentServer::spawn(json!({"version": 1})).await;
    let store = Arc::new(MemoryStore::new());
    let fetcher = fetcher(&store, FetcherConfig::default());

    fetcher
        .fetch(FetchRequest::new().url(server.url()))
        .await
        .unwrap();

    server.set_fail(true);
    let stale = fetcher
        .fetch(FetchRequest::new().url(server.url()))
        .await
        .unwrap();
    assert!(!stale.is_cache_fresh);
    assert_eq!(stale.content, Some(json!({"version": 1})));
}

#[tokio::test]
async fn server_without_etag_uses_derived_validators() {
    refetch_test::setup();
    let server = ContentServer::spawn(json!({"version": 1})).await;
    server.set_send_etag(false);
    let store = Arc::new(MemoryStore::new());

    let config = FetcherConfig {
        cache_lifetime: Duration::from_secs(10),
        ..Default::default()
    };
    let fetcher = fetcher(&store, config);

    let outcome = fetcher
        .fetch(FetchRequest::new().url(server.url()))
        .await
        .unwrap();
    assert!(outcome.etag.starts_with("W/\"sha256-"));
    assert_eq!(outcome.content, Some(json!({"version": 1})));
}
