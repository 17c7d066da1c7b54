//! Persistent event-stream transport: a long-lived GET carries server
//! messages as SSE events, client messages go out as discrete POSTs.

use super::http::{map_reqwest, route_payload, status_error, HttpChannel, SESSION_HEADER};
use super::inflight::Inflight;
use super::sse::SseParser;
use crate::protocol::JsonRpcMessage;
use conduit_core::{ConduitError, ConduitResult};
use futures_util::StreamExt;
use parking_lot::Mutex;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Response, StatusCode};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct StreamTransport {
    channel: HttpChannel,
    inflight: Option<Arc<Inflight>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl StreamTransport {
    pub(crate) fn new(channel: HttpChannel) -> Self {
        Self {
            channel,
            inflight: None,
            listener: Mutex::new(None),
        }
    }

    /// Open the event stream, offering `resume` as the session token. A
    /// rejected token falls back to a fresh session.
    pub(crate) async fn open(&mut self, resume: Option<&str>) -> ConduitResult<()> {
        let server = self.channel.server.clone();
        let mut response = self.open_stream(resume).await?;
        if resume.is_some() && response.status() == StatusCode::NOT_FOUND {
            info!(server = %server, "Session token rejected, opening a new session");
            response = self.open_stream(None).await?;
        }

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(status_error(&server, status, false, &detail));
        }
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if !content_type.starts_with("text/event-stream") {
            return Err(ConduitError::Protocol(format!(
                "server '{server}' answered the stream request with '{content_type}'"
            )));
        }

        // Only a token the server issued ever goes back on the wire.
        let session = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        self.channel.set_session(session);

        let inflight = Inflight::new(&server);
        let handle = tokio::spawn(listen(response, Arc::clone(&inflight), self.channel.clone()));
        *self.listener.lock() = Some(handle);
        self.inflight = Some(inflight);
        debug!(server = %server, "Event stream open");
        Ok(())
    }

    async fn open_stream(&self, session: Option<&str>) -> ConduitResult<Response> {
        let mut request = self
            .channel
            .client
            .get(self.channel.endpoint.clone())
            .headers(self.channel.headers.clone())
            .header(ACCEPT, "text/event-stream");
        if let Some(session) = session {
            request = request.header(SESSION_HEADER, session);
        }
        request
            .send()
            .await
            .map_err(|e| map_reqwest(&self.channel.server, e))
    }

    pub(crate) async fn send(&self, message: &JsonRpcMessage) -> ConduitResult<()> {
        let inflight = self.inflight.as_ref().ok_or_else(|| {
            ConduitError::Connection(format!(
                "transport to '{}' is not connected",
                self.channel.server
            ))
        })?;
        if inflight.is_closed() {
            return Err(ConduitError::Connection(format!(
                "event stream from '{}' is closed",
                self.channel.server
            )));
        }
        self.channel.post(message, inflight).await
    }

    pub(crate) async fn disconnect(&self) {
        if let Some(handle) = self.listener.lock().take() {
            handle.abort();
        }
        if let Some(inflight) = &self.inflight {
            inflight.close(ConduitError::Connection(format!(
                "transport to '{}' disconnected",
                self.channel.server
            )));
        }
    }

    pub(crate) async fn terminate_session(&self) {
        self.channel.terminate_session().await;
    }

    pub(crate) fn inflight(&self) -> Option<&Arc<Inflight>> {
        self.inflight.as_ref()
    }

    pub(crate) fn session_id(&self) -> Option<String> {
        self.channel.session_id()
    }
}

/// Read SSE events until the stream ends, then fail everything pending.
async fn listen(response: Response, inflight: Arc<Inflight>, channel: HttpChannel) {
    let server = channel.server.clone();
    let mut stream = Box::pin(response.bytes_stream());
    let mut parser = SseParser::default();

    let reason = loop {
        match stream.next().await {
            Some(Ok(chunk)) => {
                for event in parser.feed(&chunk) {
                    if !event.is_message() {
                        debug!(server = %server, event = ?event.event, "Ignoring typed event");
                        continue;
                    }
                    for reply in route_payload(&server, &event.data, &inflight) {
                        let channel = channel.clone();
                        let inflight = Arc::clone(&inflight);
                        tokio::spawn(async move {
                            if let Err(e) = channel.post(&reply, &inflight).await {
                                warn!(server = %channel.server, error = %e, "Failed to answer server request");
                            }
                        });
                    }
                }
            }
            Some(Err(e)) => break format!("event stream from '{server}' failed: {e}"),
            None => break format!("event stream from '{server}' closed by server"),
        }
    };

    if let Some(event) = parser.finish() {
        if event.is_message() {
            route_payload(&server, &event.data, &inflight);
        }
    }
    warn!(server = %server, reason = %reason, "Event stream ended");
    inflight.close(ConduitError::Connection(reason));
}
