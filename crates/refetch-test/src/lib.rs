//! Helpers for testing the lock and cache fetcher services.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`ContentServer`], make sure that the server is held until all requests to
//!    it have been made. If the server is dropped, its port is closed and connections to it
//!    fail. To avoid this, assign it to a variable: `let server = ContentServer::spawn(...)`.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `refetch` crates and mutes
///    all other logs (such as hyper or reqwest).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new(
            "refetch_service=trace,refetch_store=debug,refetch_test=debug",
        ))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

#[derive(Debug)]
struct ServerState {
    payload: Value,
    hits: usize,
    delay: Duration,
    fail: bool,
    send_etag: bool,
}

/// A local HTTP server serving one JSON document with conditional-request
/// support.
///
/// The server answers `GET /content` with the configured payload and a
/// strong ETag derived from the body. A request whose `If-None-Match` header
/// matches the current ETag receives a `304 Not Modified` without a body.
/// Latency and failures can be injected per test.
pub struct ContentServer {
    state: Arc<Mutex<ServerState>>,
    addr: SocketAddr,
    handle: tokio::task::JoinHandle<()>,
}

impl ContentServer {
    /// Spawns the server on a random localhost port.
    pub async fn spawn(payload: Value) -> Self {
        let state = Arc::new(Mutex::new(ServerState {
            payload,
            hits: 0,
            delay: Duration::ZERO,
            fail: false,
            send_etag: true,
        }));

        let app = Router::new()
            .route("/content", get(serve_content))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        tracing::debug!(%addr, "content server listening");
        Self {
            state,
            addr,
            handle,
        }
    }

    /// The URL of the served document.
    pub fn url(&self) -> String {
        format!("http://{}/content", self.addr)
    }

    /// How many requests the server has answered, including 304s and
    /// injected failures.
    pub fn hits(&self) -> usize {
        self.state.lock().unwrap().hits
    }

    /// Replaces the served payload, which also changes the ETag.
    pub fn set_payload(&self, payload: Value) {
        self.state.lock().unwrap().payload = payload;
    }

    /// Delays every response by `delay`.
    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().unwrap().delay = delay;
    }

    /// Makes the server answer every request with a 500.
    pub fn set_fail(&self, fail: bool) {
        self.state.lock().unwrap().fail = fail;
    }

    /// Suppresses the `ETag` response header, for testing validators
    /// derived on the client side.
    pub fn set_send_etag(&self, send_etag: bool) {
        self.state.lock().unwrap().send_etag = send_etag;
    }
}

impl Drop for ContentServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn strong_etag(body: &[u8]) -> String {
    format!("\"{}\"", hex::encode(Sha256::digest(body)))
}

async fn serve_content(
    State(state): State<Arc<Mutex<ServerState>>>,
    headers: HeaderMap,
) -> Response {
    let (body, etag, delay, fail, send_etag) = {
        let mut state = state.lock().unwrap();
        state.hits += 1;
        let body = serde_json::to_vec(&state.payload).unwrap();
        let etag = strong_etag(&body);
        (body, etag, state.delay, state.fail, state.send_etag)
    };

    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    if fail {
        return (StatusCode::INTERNAL_SERVER_ERROR, "injected failure").into_response();
    }

    let if_none_match = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|value| value.to_str().ok());
    if send_etag && if_none_match == Some(etag.as_str()) {
        return (
            StatusCode::NOT_MODIFIED,
            [(header::ETAG, etag)],
        )
            .into_response();
    }

    if send_etag {
        ([(header::ETAG, etag)], body).into_response()
    } else {
        body.into_response()
    }
}
