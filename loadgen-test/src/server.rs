//! Exposes an in-process stub object store for use in integration tests.
//!
//! ```
//! use loadgen_test::server::TestServer;
//!
//! #[tokio::main]
//! async fn main() {
//!    let server = TestServer::new().await;
//!    let url = server.url("/bucket/object");
//!    // use the URL in tests...
//! }
//! ```
//!
//! The server accepts `PUT /{bucket}/{key}` and `GET /{bucket}/{key}`, keeps objects in memory
//! and answers with the MD5 of the object as quoted `ETag`, like S3 does for single-part
//! uploads. Through [`ServerOptions`] it can be told to delay responses, fail or corrupt
//! specific keys. Every handled request is recorded as a [`RequestEvent`].

use std::collections::{HashMap, HashSet};
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::put;

/// Behavior of a [`TestServer`].
#[derive(Clone, Debug, Default)]
pub struct ServerOptions {
    delay: Duration,
    fail: HashSet<String>,
    corrupt_etag: HashSet<String>,
    omit_etag: bool,
}

impl ServerOptions {
    /// Holds every request for `delay` before answering.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Answers requests for `key` with `503 Service Unavailable`.
    pub fn fail(mut self, key: impl Into<String>) -> Self {
        self.fail.insert(key.into());
        self
    }

    /// Answers requests for `key` with an `ETag` that does not match the object.
    pub fn corrupt_etag(mut self, key: impl Into<String>) -> Self {
        self.corrupt_etag.insert(key.into());
        self
    }

    /// Leaves out the `ETag` header from all responses.
    pub fn omit_etag(mut self) -> Self {
        self.omit_etag = true;
        self
    }
}

/// A request handled by the [`TestServer`].
#[derive(Clone, Debug)]
pub struct RequestEvent {
    /// HTTP method of the request.
    pub method: &'static str,
    /// The bucket segment of the path.
    pub bucket: String,
    /// The object key segment of the path.
    pub key: String,
    /// The `Authorization` header, if sent.
    pub authorization: Option<String>,
    /// When the handler started processing the request.
    pub started: Instant,
    /// When the handler produced its response.
    pub finished: Instant,
}

#[derive(Debug, Default)]
struct Inner {
    options: ServerOptions,
    objects: Mutex<HashMap<(String, String), Bytes>>,
    events: Mutex<Vec<RequestEvent>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl Inner {
    fn enter(&self) -> Instant {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        Instant::now()
    }

    fn exit(
        &self,
        method: &'static str,
        bucket: String,
        key: String,
        headers: &HeaderMap,
        started: Instant,
    ) {
        let authorization = headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);

        self.events.lock().unwrap().push(RequestEvent {
            method,
            bucket,
            key,
            authorization,
            started,
            finished: Instant::now(),
        });
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    fn respond(&self, key: &str, body: &[u8], payload: Bytes) -> Response {
        let mut etag = format!("{:x}", md5::compute(body));
        if self.options.corrupt_etag.contains(key) {
            etag = format!("{:x}", md5::compute(etag.as_bytes()));
        }

        if self.options.omit_etag {
            (StatusCode::OK, payload).into_response()
        } else {
            let etag = format!("\"{etag}\"");
            (StatusCode::OK, [(header::ETAG, etag)], payload).into_response()
        }
    }
}

async fn put_object(
    State(state): State<Arc<Inner>>,
    Path((bucket, key)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let started = state.enter();
    tokio::time::sleep(state.options.delay).await;

    let response = if state.options.fail.contains(&key) {
        StatusCode::SERVICE_UNAVAILABLE.into_response()
    } else {
        let response = state.respond(&key, &body, Bytes::new());
        state
            .objects
            .lock()
            .unwrap()
            .insert((bucket.clone(), key.clone()), body);
        response
    };

    state.exit("PUT", bucket, key, &headers, started);
    response
}

async fn get_object(
    State(state): State<Arc<Inner>>,
    Path((bucket, key)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    let started = state.enter();
    tokio::time::sleep(state.options.delay).await;

    let stored = state
        .objects
        .lock()
        .unwrap()
        .get(&(bucket.clone(), key.clone()))
        .cloned();

    let response = if state.options.fail.contains(&key) {
        StatusCode::SERVICE_UNAVAILABLE.into_response()
    } else if let Some(body) = stored {
        state.respond(&key, &body, body.clone())
    } else {
        StatusCode::NOT_FOUND.into_response()
    };

    state.exit("GET", bucket, key, &headers, started);
    response
}

/// An in-process stub object store for use in integration tests.
///
/// The server listens on a random available port on localhost and stops when dropped.
#[derive(Debug)]
pub struct TestServer {
    handle: tokio::task::JoinHandle<()>,
    socket: SocketAddr,
    state: Arc<Inner>,
}

impl TestServer {
    /// Starts a server that stores objects and answers immediately.
    pub async fn new() -> Self {
        Self::with_options(ServerOptions::default()).await
    }

    /// Starts a server with the given behavior.
    pub async fn with_options(options: ServerOptions) -> Self {
        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let listener = TcpListener::bind(addr).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();

        let state = Arc::new(Inner {
            options,
            ..Default::default()
        });

        let app = Router::new()
            .route("/{bucket}/{key}", put(put_object).get(get_object))
            .with_state(Arc::clone(&state));

        let handle = tokio::spawn(async move {
            let listener = tokio::net::TcpListener::from_std(listener).unwrap();
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            handle,
            socket,
            state,
        }
    }

    /// Returns a full URL pointing to the given path.
    ///
    /// This URL uses `localhost` as hostname.
    pub fn url(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        format!("http://localhost:{}/{}", self.socket.port(), path)
    }

    /// The base URL of the server, without trailing slash.
    pub fn endpoint(&self) -> String {
        format!("http://localhost:{}", self.socket.port())
    }

    /// Stores an object directly, bypassing HTTP.
    pub fn insert(&self, bucket: &str, key: &str, contents: impl Into<Bytes>) {
        self.state
            .objects
            .lock()
            .unwrap()
            .insert((bucket.to_owned(), key.to_owned()), contents.into());
    }

    /// Returns the stored contents of an object.
    pub fn object(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.state
            .objects
            .lock()
            .unwrap()
            .get(&(bucket.to_owned(), key.to_owned()))
            .cloned()
    }

    /// All requests handled so far, in the order they finished.
    pub fn events(&self) -> Vec<RequestEvent> {
        self.state.events.lock().unwrap().clone()
    }

    /// The highest number of requests the server was handling at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.state.peak_in_flight.load(Ordering::SeqCst)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
