//! Transports: the closed set of wire channels to a capability server.
//!
//! Every variant shares the handshake, request/response correlation and
//! inbound notification delivery; only opening, writing and closing differ.

mod http;
pub(crate) mod inflight;
mod process;
mod sse;
mod stream;

pub use http::{HttpTransport, SESSION_HEADER};
pub use process::ProcessTransport;
pub use stream::StreamTransport;

pub(crate) use http::HttpChannel;

use crate::cancel::CancellationToken;
use crate::config::TransportKind;
use crate::protocol::{
    error_codes, initialize_params, methods, InitializeResult, JsonRpcError, JsonRpcMessage,
    JsonRpcNotification, JsonRpcRequest, ResponseOutcome, ServerCapabilities, ServerInfo,
};
use conduit_core::{ConduitError, ConduitResult};
use inflight::Inflight;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

/// Something the server sent that was not a response to one of our calls.
#[derive(Debug, Clone)]
pub enum InboundEvent {
    /// A server notification.
    Notification(JsonRpcNotification),
    /// A message that violated the protocol. The connection stays usable.
    ProtocolViolation(String),
    /// The channel closed; this is the last event.
    Closed(String),
}

/// Lazy sequence of inbound events. Ends after [`InboundEvent::Closed`].
pub type InboundStream = UnboundedReceiverStream<InboundEvent>;

/// Outcome of a successful `connect`.
#[derive(Debug, Clone)]
pub struct Handshake {
    pub session_id: String,
    /// False when `session_id` is a local bookkeeping id. Such ids are
    /// never sent to the server or offered for resumption.
    pub issued_by_server: bool,
    pub resumed: bool,
    pub protocol_version: String,
    pub server_info: Option<ServerInfo>,
    pub capabilities: ServerCapabilities,
}

/// Point-in-time view of a transport.
#[derive(Debug, Clone, Serialize)]
pub struct TransportStats {
    pub kind: TransportKind,
    pub connected: bool,
    pub age_ms: u64,
    pub idle_ms: u64,
    pub in_flight: usize,
    pub messages_sent: u64,
    pub messages_received: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// The wire-level channel behind a [`Transport`].
pub enum Channel {
    Stream(StreamTransport),
    Process(ProcessTransport),
    Http(HttpTransport),
}

/// A connection to one server over one of the [`Channel`] variants.
///
/// Created unconnected by [`crate::TransportFactory`]. `connect` opens the
/// channel and runs the `initialize` handshake; after a failed connect the
/// transport is left disconnected and must be discarded.
pub struct Transport {
    server: String,
    timeout: Duration,
    connect_timeout: Duration,
    channel: Channel,
}

impl Transport {
    pub(crate) fn new(
        server: &str,
        timeout: Duration,
        connect_timeout: Duration,
        channel: Channel,
    ) -> Self {
        Self {
            server: server.to_string(),
            timeout,
            connect_timeout,
            channel,
        }
    }

    pub fn kind(&self) -> TransportKind {
        match self.channel {
            Channel::Stream(_) => TransportKind::Stream,
            Channel::Process(_) => TransportKind::Process,
            Channel::Http(_) => TransportKind::Http,
        }
    }

    pub fn server_name(&self) -> &str {
        &self.server
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Declared per-request deadline.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Open the channel and negotiate. `resume` is a previous session token
    /// to offer the server; when the server rejects it a new session is
    /// created instead.
    pub async fn connect(
        &mut self,
        resume: Option<&str>,
        token: &CancellationToken,
    ) -> ConduitResult<Handshake> {
        token.check()?;
        let mut result = self.connect_once(resume, token).await;
        if resume.is_some() && matches!(result, Err(ConduitError::SessionExpired(_))) {
            info!(server = %self.server, "Session no longer valid, renegotiating");
            result = self.connect_once(None, token).await;
        }
        let mut handshake = result?;
        handshake.resumed =
            handshake.issued_by_server && resume == Some(handshake.session_id.as_str());
        info!(
            server = %self.server,
            kind = %self.kind(),
            version = %handshake.protocol_version,
            resumed = handshake.resumed,
            "Server connected"
        );
        Ok(handshake)
    }

    async fn connect_once(
        &mut self,
        resume: Option<&str>,
        token: &CancellationToken,
    ) -> ConduitResult<Handshake> {
        let connect_timeout = self.connect_timeout;
        let server = self.server.clone();
        let opened = tokio::select! {
            _ = token.cancelled() => Err(ConduitError::Cancelled),
            opened = tokio::time::timeout(connect_timeout, self.open(resume)) => {
                opened.unwrap_or_else(|_| Err(ConduitError::Timeout(format!(
                    "opening channel to '{server}' exceeded {}ms",
                    connect_timeout.as_millis()
                ))))
            }
        };
        if let Err(e) = opened {
            self.disconnect().await;
            return Err(e);
        }

        match self.negotiate(token).await {
            Ok(handshake) => Ok(handshake),
            Err(e) => {
                debug!(server = %self.server, error = %e, "Handshake failed");
                self.disconnect().await;
                Err(e)
            }
        }
    }

    async fn open(&mut self, resume: Option<&str>) -> ConduitResult<()> {
        match &mut self.channel {
            Channel::Stream(t) => t.open(resume).await,
            Channel::Process(t) => t.open().await,
            Channel::Http(t) => {
                t.open(resume);
                Ok(())
            }
        }
    }

    async fn negotiate(&self, token: &CancellationToken) -> ConduitResult<Handshake> {
        let result = self
            .request(methods::INITIALIZE, Some(initialize_params()), token)
            .await?;
        let init: InitializeResult = serde_json::from_value(result).map_err(|e| {
            ConduitError::Protocol(format!("invalid initialize result from '{}': {e}", self.server))
        })?;
        self.notify(methods::INITIALIZED, None).await?;

        let (session_id, issued_by_server) = match (&self.channel, self.session_id()) {
            (Channel::Process(_), Some(local)) => (local, false),
            (_, Some(issued)) => (issued, true),
            // Servers that issue no token still get a local one for bookkeeping.
            (_, None) => (uuid::Uuid::new_v4().to_string(), false),
        };
        Ok(Handshake {
            session_id,
            issued_by_server,
            resumed: false,
            protocol_version: init.protocol_version,
            server_info: init.server_info,
            capabilities: init.capabilities,
        })
    }

    /// Write one message to the channel without waiting for anything.
    pub async fn send(&self, message: &JsonRpcMessage) -> ConduitResult<()> {
        match &self.channel {
            Channel::Stream(t) => t.send(message).await,
            Channel::Process(t) => t.send(message).await,
            Channel::Http(t) => t.send(message).await,
        }
    }

    /// Issue a request and wait for its response, bounded by the declared
    /// timeout and `token`. JSON-RPC error responses become errors.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        token: &CancellationToken,
    ) -> ConduitResult<Value> {
        token.check()?;
        let inflight = self.live_inflight()?;
        let (id, rx) = inflight.begin(method)?;
        let message = JsonRpcMessage::Request(JsonRpcRequest::new(id, method, params));

        let sent = tokio::select! {
            _ = token.cancelled() => Err(ConduitError::Cancelled),
            sent = self.send(&message) => sent,
        };
        if let Err(e) = sent {
            inflight.discard(id);
            return Err(e);
        }

        let reply = inflight.wait(id, rx, self.timeout, token, method).await;
        match reply {
            Ok(ResponseOutcome::Result(value)) => Ok(value),
            Ok(ResponseOutcome::Error(err)) => Err(rpc_error(&self.server, method, &err)),
            Err(ConduitError::Cancelled) => {
                self.notify_cancelled(id).await;
                Err(ConduitError::Cancelled)
            }
            Err(e) => Err(e),
        }
    }

    /// Tell the server to stop working on `id`. Best effort.
    async fn notify_cancelled(&self, id: u64) {
        let params = serde_json::json!({"requestId": id, "reason": "cancelled by caller"});
        let note = self.notify(methods::CANCELLED, Some(params));
        match tokio::time::timeout(Duration::from_secs(1), note).await {
            Ok(Ok(())) => debug!(server = %self.server, call_id = id, "Cancellation sent"),
            Ok(Err(e)) => debug!(server = %self.server, error = %e, "Cancellation not delivered"),
            Err(_) => debug!(server = %self.server, "Cancellation timed out"),
        }
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> ConduitResult<()> {
        self.live_inflight()?;
        self.send(&JsonRpcMessage::Notification(JsonRpcNotification::new(method, params)))
            .await
    }

    /// Inbound notifications and protocol violations. Can be taken once.
    pub fn receive(&self) -> ConduitResult<InboundStream> {
        let inflight = self.inflight().ok_or_else(|| {
            ConduitError::Connection(format!("transport to '{}' is not connected", self.server))
        })?;
        let rx = inflight.take_events().ok_or_else(|| {
            ConduitError::Request(format!(
                "inbound events of '{}' are already being consumed",
                self.server
            ))
        })?;
        Ok(UnboundedReceiverStream::new(rx))
    }

    /// Close the channel. Pending calls fail with a connection error.
    /// Safe to call more than once.
    pub async fn disconnect(&self) {
        match &self.channel {
            Channel::Stream(t) => t.disconnect().await,
            Channel::Process(t) => t.disconnect().await,
            Channel::Http(t) => t.disconnect().await,
        }
    }

    /// Ask the server to drop the session, where the channel supports it.
    pub async fn terminate_session(&self) {
        match &self.channel {
            Channel::Stream(t) => t.terminate_session().await,
            Channel::Http(t) => t.terminate_session().await,
            Channel::Process(_) => {}
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inflight().is_some_and(|i| !i.is_closed())
    }

    pub fn session_id(&self) -> Option<String> {
        match &self.channel {
            Channel::Stream(t) => t.session_id(),
            Channel::Process(t) => t.session_id(),
            Channel::Http(t) => t.session_id(),
        }
    }

    pub fn stats(&self) -> TransportStats {
        let inflight = self.inflight();
        let millis = |d: Duration| u64::try_from(d.as_millis()).unwrap_or(u64::MAX);
        TransportStats {
            kind: self.kind(),
            connected: self.is_connected(),
            age_ms: inflight.map(|i| millis(i.age())).unwrap_or(0),
            idle_ms: inflight.map(|i| millis(i.idle())).unwrap_or(0),
            in_flight: inflight.map(|i| i.in_flight()).unwrap_or(0),
            messages_sent: inflight.map(|i| i.sent()).unwrap_or(0),
            messages_received: inflight.map(|i| i.received()).unwrap_or(0),
            pid: match &self.channel {
                Channel::Process(t) => t.pid(),
                _ => None,
            },
            session_id: self.session_id(),
        }
    }

    fn inflight(&self) -> Option<&Arc<Inflight>> {
        match &self.channel {
            Channel::Stream(t) => t.inflight(),
            Channel::Process(t) => t.inflight(),
            Channel::Http(t) => t.inflight(),
        }
    }

    fn live_inflight(&self) -> ConduitResult<&Arc<Inflight>> {
        match self.inflight() {
            Some(inflight) if !inflight.is_closed() => Ok(inflight),
            Some(_) => Err(ConduitError::Connection(format!(
                "transport to '{}' is closed",
                self.server
            ))),
            None => Err(ConduitError::Connection(format!(
                "transport to '{}' is not connected",
                self.server
            ))),
        }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("server", &self.server)
            .field("kind", &self.kind())
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Map a JSON-RPC error response onto the taxonomy.
fn rpc_error(server: &str, method: &str, err: &JsonRpcError) -> ConduitError {
    let message = format!("{server} rejected {method} ({}): {}", err.code, err.message);
    match err.code {
        error_codes::INVALID_PARAMS | error_codes::INVALID_REQUEST => ConduitError::Request(message),
        _ if method == methods::TOOLS_CALL => ConduitError::ToolExecution(message),
        _ => {
            warn!(server, method, code = err.code, "Server returned an error");
            ConduitError::Protocol(message)
        }
    }
}
