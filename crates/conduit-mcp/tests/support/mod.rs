//! Shared fixtures for the integration tests: an in-process event-stream
//! MCP server built on axum, and helpers for the stdio stub binary.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use conduit_mcp::{RetryConfig, ServerDescriptor};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;

const SESSION: &str = "mcp-session-id";

/// Knobs and counters shared with the running stub.
#[derive(Default)]
pub struct StubState {
    /// Reject this many upcoming stream requests with 503.
    pub fail_connects: AtomicUsize,
    /// Reject every stream request with 503.
    pub refuse_connects: AtomicBool,
    /// Close the event stream when a `tools/call` arrives, and refuse
    /// reconnects from then on.
    pub drop_on_call: AtomicBool,
    pub stream_requests: AtomicUsize,
    pub initializes: AtomicUsize,
    pub tool_lists: AtomicUsize,
    pub tool_calls: AtomicUsize,
    pub cancellations: AtomicUsize,
    pub authorization: Mutex<Vec<String>>,
    pub resumed: Mutex<Vec<String>>,
    streams: Mutex<HashMap<String, mpsc::UnboundedSender<String>>>,
    sessions: Mutex<Vec<String>>,
    next_session: AtomicUsize,
}

impl StubState {
    fn sender(&self, session: &str) -> Option<mpsc::UnboundedSender<String>> {
        self.streams.lock().unwrap().get(session).cloned()
    }

    /// Close every open event stream, as if the server went away.
    pub fn drop_streams(&self) {
        self.streams.lock().unwrap().clear();
    }

    /// Forget every session so resumption attempts are rejected.
    pub fn forget_sessions(&self) {
        self.sessions.lock().unwrap().clear();
    }

    /// Push a raw message to every open stream.
    pub fn broadcast(&self, message: &Value) {
        for tx in self.streams.lock().unwrap().values() {
            let _ = tx.send(message.to_string());
        }
    }
}

pub struct StreamStub {
    pub url: String,
    pub state: Arc<StubState>,
    handle: tokio::task::JoinHandle<()>,
}

impl StreamStub {
    pub async fn start() -> Self {
        let state = Arc::new(StubState::default());
        let app = Router::new()
            .route("/mcp", get(open_stream).post(handle_post).delete(end_session))
            .with_state(Arc::clone(&state));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self {
            url: format!("http://{addr}/mcp"),
            state,
            handle,
        }
    }

    pub fn descriptor(&self, name: &str) -> ServerDescriptor {
        ServerDescriptor::stream(name, &self.url).with_timeout(Duration::from_secs(5))
    }
}

impl Drop for StreamStub {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn open_stream(State(state): State<Arc<StubState>>, headers: HeaderMap) -> Response {
    state.stream_requests.fetch_add(1, Ordering::SeqCst);
    if state.refuse_connects.load(Ordering::SeqCst) {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    let failing = state
        .fail_connects
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if failing {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    if let Some(auth) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        state.authorization.lock().unwrap().push(auth.to_string());
    }

    let session = match headers.get(SESSION).and_then(|v| v.to_str().ok()) {
        Some(offered) => {
            if !state.sessions.lock().unwrap().iter().any(|s| s == offered) {
                return StatusCode::NOT_FOUND.into_response();
            }
            state.resumed.lock().unwrap().push(offered.to_string());
            offered.to_string()
        }
        None => {
            let n = state.next_session.fetch_add(1, Ordering::SeqCst) + 1;
            let session = format!("sess-{n}");
            state.sessions.lock().unwrap().push(session.clone());
            session
        }
    };

    let (tx, rx) = mpsc::unbounded_channel::<String>();
    state.streams.lock().unwrap().insert(session.clone(), tx);
    let events = UnboundedReceiverStream::new(rx)
        .map(|data| Ok::<Event, Infallible>(Event::default().data(data)));

    (
        [(SESSION, session)],
        Sse::new(events).keep_alive(KeepAlive::default()),
    )
        .into_response()
}

async fn handle_post(State(state): State<Arc<StubState>>, headers: HeaderMap, body: String) -> Response {
    let Some(session) = headers.get(SESSION).and_then(|v| v.to_str().ok()).map(str::to_string) else {
        return (StatusCode::BAD_REQUEST, "missing session").into_response();
    };
    if !state.sessions.lock().unwrap().iter().any(|s| *s == session) {
        return StatusCode::NOT_FOUND.into_response();
    }
    let Ok(message) = serde_json::from_str::<Value>(&body) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let method = message["method"].as_str().unwrap_or_default().to_string();
    let Some(id) = message.get("id").cloned() else {
        if method == "notifications/cancelled" {
            state.cancellations.fetch_add(1, Ordering::SeqCst);
        }
        return StatusCode::ACCEPTED.into_response();
    };
    if message.get("method").is_none() {
        // reply to a server-initiated request
        return StatusCode::ACCEPTED.into_response();
    }
    let Some(tx) = state.sender(&session) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let params = message.get("params").cloned().unwrap_or(Value::Null);
    let result = match method.as_str() {
        "initialize" => {
            state.initializes.fetch_add(1, Ordering::SeqCst);
            json!({
                "protocolVersion": "2025-03-26",
                "capabilities": {"tools": {"listChanged": true}},
                "serverInfo": {"name": "stream-stub", "version": "0.1.0"}
            })
        }
        "ping" => json!({}),
        "tools/list" => {
            state.tool_lists.fetch_add(1, Ordering::SeqCst);
            json!({"tools": [
            {"name": "add", "description": "Add two numbers"},
            {"name": "slow", "description": "Answer after ms milliseconds"}
            ]})
        }
        "tools/call" => {
            state.tool_calls.fetch_add(1, Ordering::SeqCst);
            if state.drop_on_call.load(Ordering::SeqCst) {
                state.refuse_connects.store(true, Ordering::SeqCst);
                state.drop_streams();
                return StatusCode::ACCEPTED.into_response();
            }
            let args = &params["arguments"];
            match params["name"].as_str().unwrap_or_default() {
                "add" => json!(args["a"].as_i64().unwrap_or(0) + args["b"].as_i64().unwrap_or(0)),
                "slow" => {
                    let ms = args["ms"].as_u64().unwrap_or(100);
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_millis(ms)).await;
                        let reply = json!({"jsonrpc": "2.0", "id": id, "result": {"content": []}});
                        let _ = tx.send(reply.to_string());
                    });
                    return StatusCode::ACCEPTED.into_response();
                }
                other => {
                    let reply = json!({"jsonrpc": "2.0", "id": id,
                        "error": {"code": -32602, "message": format!("Unknown tool: {other}")}});
                    let _ = tx.send(reply.to_string());
                    return StatusCode::ACCEPTED.into_response();
                }
            }
        }
        other => {
            let reply = json!({"jsonrpc": "2.0", "id": id,
                "error": {"code": -32601, "message": format!("Method not found: {other}")}});
            let _ = tx.send(reply.to_string());
            return StatusCode::ACCEPTED.into_response();
        }
    };

    let reply = json!({"jsonrpc": "2.0", "id": id, "result": result});
    let _ = tx.send(reply.to_string());
    StatusCode::ACCEPTED.into_response()
}

async fn end_session(State(state): State<Arc<StubState>>, headers: HeaderMap) -> StatusCode {
    if let Some(session) = headers.get(SESSION).and_then(|v| v.to_str().ok()) {
        state.sessions.lock().unwrap().retain(|s| s != session);
        state.streams.lock().unwrap().remove(session);
    }
    StatusCode::NO_CONTENT
}

/// Path of the stdio stub binary built alongside the tests.
pub fn stdio_stub() -> &'static str {
    env!("CARGO_BIN_EXE_conduit-stdio-stub")
}

pub fn process_descriptor(name: &str) -> ServerDescriptor {
    ServerDescriptor::process(name, stdio_stub()).with_timeout(Duration::from_secs(5))
}

/// Retry policy without jitter, for predictable timing.
pub fn fast_retry(max_retries: u32) -> RetryConfig {
    RetryConfig {
        max_retries,
        initial_delay_ms: 20,
        max_delay_ms: 200,
        backoff_factor: 2.0,
        jitter_factor: 0.0,
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Poll `condition` until it holds or two seconds pass.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
