//! Demultiplexer shared by every transport variant: correlates responses to
//! pending calls by id, forwards notifications, answers server-initiated
//! requests, and tracks traffic counters.

use super::InboundEvent;
use crate::cancel::CancellationToken;
use crate::protocol::{
    error_codes, methods, JsonRpcMessage, JsonRpcResponse, RequestId, ResponseOutcome,
};
use conduit_core::{ConduitError, ConduitResult};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

type Reply = ConduitResult<ResponseOutcome>;

/// A dispatched request waiting for its response.
struct PendingCall {
    method: String,
    issued_at: Instant,
    tx: oneshot::Sender<Reply>,
}

pub(crate) struct Inflight {
    server: String,
    pending: Mutex<HashMap<u64, PendingCall>>,
    next_id: AtomicU64,
    events_tx: Mutex<Option<mpsc::UnboundedSender<InboundEvent>>>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<InboundEvent>>>,
    connected_at: Instant,
    last_activity: Mutex<Instant>,
    sent: AtomicU64,
    received: AtomicU64,
    closed: AtomicBool,
}

impl Inflight {
    pub(crate) fn new(server: &str) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let now = Instant::now();
        Arc::new(Self {
            server: server.to_string(),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            events_tx: Mutex::new(Some(tx)),
            events_rx: Mutex::new(Some(rx)),
            connected_at: now,
            last_activity: Mutex::new(now),
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Allocate a call id and register the waiter for it.
    pub(crate) fn begin(&self, method: &str) -> ConduitResult<(u64, oneshot::Receiver<Reply>)> {
        if self.is_closed() {
            return Err(ConduitError::Connection(format!(
                "transport to '{}' is closed",
                self.server
            )));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(
            id,
            PendingCall {
                method: method.to_string(),
                issued_at: Instant::now(),
                tx,
            },
        );
        Ok((id, rx))
    }

    /// Wait for the response to `id`, bounded by `timeout` and `token`.
    pub(crate) async fn wait(
        self: &Arc<Self>,
        id: u64,
        rx: oneshot::Receiver<Reply>,
        timeout: Duration,
        token: &CancellationToken,
        method: &str,
    ) -> Reply {
        let inflight = Arc::clone(self);
        let _registration = token.register(move || {
            inflight.abandon(id, ConduitError::Cancelled);
        });

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(ConduitError::Connection(format!(
                "response channel for '{method}' dropped"
            ))),
            Err(_) => {
                self.discard(id);
                Err(ConduitError::Timeout(format!(
                    "'{method}' to '{}' got no response within {}ms",
                    self.server,
                    timeout.as_millis()
                )))
            }
        }
    }

    /// Complete a pending call with an error. Any later response for the id
    /// is dropped as late.
    pub(crate) fn abandon(&self, id: u64, err: ConduitError) {
        if let Some(call) = self.pending.lock().remove(&id) {
            let _ = call.tx.send(Err(err));
        }
    }

    /// Forget a pending call without notifying its waiter.
    pub(crate) fn discard(&self, id: u64) {
        self.pending.lock().remove(&id);
    }

    pub(crate) fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
        *self.last_activity.lock() = Instant::now();
    }

    /// Route one decoded inbound message. Returns a reply that the caller
    /// must write back when the server sent a request.
    pub(crate) fn route(&self, message: JsonRpcMessage) -> Option<JsonRpcMessage> {
        self.received.fetch_add(1, Ordering::Relaxed);
        *self.last_activity.lock() = Instant::now();

        match message {
            JsonRpcMessage::Response(response) => {
                self.complete(response);
                None
            }
            JsonRpcMessage::Notification(note) => {
                debug!(server = %self.server, method = %note.method, "Notification received");
                self.emit(InboundEvent::Notification(note));
                None
            }
            JsonRpcMessage::Request(request) => {
                let reply = if request.method == methods::PING {
                    JsonRpcResponse::success(request.id, serde_json::json!({}))
                } else {
                    debug!(server = %self.server, method = %request.method, "Unsupported server request");
                    JsonRpcResponse::failure(
                        Some(request.id),
                        error_codes::METHOD_NOT_FOUND,
                        format!("Method not found: {}", request.method),
                    )
                };
                Some(JsonRpcMessage::Response(reply))
            }
        }
    }

    fn complete(&self, response: JsonRpcResponse) {
        let id = match response.id {
            Some(RequestId::Number(id)) => id,
            Some(RequestId::Text(other)) => {
                self.violation(format!("response carries a non-numeric id '{other}'"));
                return;
            }
            None => {
                self.violation(format!("response without id: {:?}", response.outcome));
                return;
            }
        };

        let call = self.pending.lock().remove(&id);
        match call {
            Some(call) => {
                debug!(
                    server = %self.server,
                    call_id = id,
                    method = %call.method,
                    elapsed_ms = call.issued_at.elapsed().as_millis() as u64,
                    "Response received"
                );
                let _ = call.tx.send(Ok(response.outcome));
            }
            None if id < self.next_id.load(Ordering::SeqCst) => {
                debug!(server = %self.server, call_id = id, "Dropping late response");
            }
            None => self.violation(format!("response for unknown call id {id}")),
        }
    }

    /// A JSON value arrived that is not a valid message. Fails the matching
    /// pending call, if the value carries a known id, and reports it.
    pub(crate) fn malformed(&self, raw: &Value, err: ConduitError) {
        self.received.fetch_add(1, Ordering::Relaxed);
        if let Some(id) = raw.get("id").and_then(Value::as_u64) {
            self.abandon(id, err.clone());
        }
        self.violation(err.to_string());
    }

    pub(crate) fn violation(&self, detail: String) {
        warn!(server = %self.server, detail = %detail, "Protocol violation");
        self.emit(InboundEvent::ProtocolViolation(detail));
    }

    fn emit(&self, event: InboundEvent) {
        if let Some(tx) = self.events_tx.lock().as_ref() {
            let _ = tx.send(event);
        }
    }

    /// Mark the channel closed and fail every pending call with `reason`.
    /// The inbound sequence ends after a final [`InboundEvent::Closed`].
    pub(crate) fn close(&self, reason: ConduitError) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let drained: Vec<(u64, PendingCall)> = self.pending.lock().drain().collect();
        if !drained.is_empty() {
            debug!(server = %self.server, pending = drained.len(), reason = %reason, "Discarding pending calls");
        }
        for (_, call) in drained {
            let _ = call.tx.send(Err(reason.clone()));
        }
        if let Some(tx) = self.events_tx.lock().take() {
            let _ = tx.send(InboundEvent::Closed(reason.to_string()));
        }
    }

    pub(crate) fn take_events(&self) -> Option<mpsc::UnboundedReceiver<InboundEvent>> {
        self.events_rx.lock().take()
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.pending.lock().len()
    }

    pub(crate) fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    pub(crate) fn idle(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    pub(crate) fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub(crate) fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }
}
