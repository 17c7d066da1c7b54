//! HTTP plumbing shared by the stream and stateless transports, plus the
//! stateless transport itself: one POST per message, replies in the body.

use super::inflight::Inflight;
use super::sse;
use crate::protocol::JsonRpcMessage;
use conduit_core::{ConduitError, ConduitResult};
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{Client, StatusCode, Url};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Header carrying the server-assigned session token.
pub const SESSION_HEADER: &str = "mcp-session-id";

/// Client, endpoint, credential headers and session token for one server.
#[derive(Clone)]
pub(crate) struct HttpChannel {
    pub server: String,
    pub client: Client,
    pub endpoint: Url,
    pub headers: HeaderMap,
    pub timeout: Duration,
    pub session: Arc<RwLock<Option<String>>>,
}

impl HttpChannel {
    pub(crate) fn new(
        server: &str,
        endpoint: &str,
        credentials: &crate::config::Credentials,
        timeout: Duration,
        connect_timeout: Duration,
    ) -> ConduitResult<Self> {
        let endpoint = Url::parse(endpoint).map_err(|e| {
            ConduitError::Configuration(format!("server '{server}' endpoint is not a valid URL: {e}"))
        })?;

        let mut headers = HeaderMap::new();
        for (key, value) in credentials.iter() {
            let name = HeaderName::from_bytes(key.as_bytes()).map_err(|_| {
                ConduitError::Configuration(format!(
                    "server '{server}' credential '{key}' is not a valid header name"
                ))
            })?;
            let mut value = HeaderValue::from_str(value).map_err(|_| {
                ConduitError::Configuration(format!(
                    "server '{server}' credential '{key}' is not a valid header value"
                ))
            })?;
            value.set_sensitive(true);
            headers.insert(name, value);
        }

        // No client-wide timeout: it would also cut the long-lived event stream.
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| ConduitError::Configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            server: server.to_string(),
            client,
            endpoint,
            headers,
            timeout,
            session: Arc::new(RwLock::new(None)),
        })
    }

    pub(crate) fn session_id(&self) -> Option<String> {
        self.session.read().clone()
    }

    pub(crate) fn set_session(&self, session: Option<String>) {
        *self.session.write() = session;
    }

    pub(crate) fn session_header(&self) -> Option<HeaderValue> {
        self.session
            .read()
            .as_deref()
            .and_then(|s| HeaderValue::from_str(s).ok())
    }

    /// POST `message` and route whatever the body carries into `inflight`.
    /// Replies to server-initiated requests are posted back in turn.
    pub(crate) async fn post(&self, message: &JsonRpcMessage, inflight: &Inflight) -> ConduitResult<()> {
        let mut queue = vec![message.encode()?];
        while let Some(body) = queue.pop() {
            let replies = self.post_one(body, inflight).await?;
            for reply in replies {
                queue.push(reply.encode()?);
            }
        }
        Ok(())
    }

    async fn post_one(&self, body: String, inflight: &Inflight) -> ConduitResult<Vec<JsonRpcMessage>> {
        let mut request = self
            .client
            .post(self.endpoint.clone())
            .headers(self.headers.clone())
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json, text/event-stream")
            .timeout(self.timeout)
            .body(body);
        if let Some(session) = self.session_header() {
            request = request.header(SESSION_HEADER, session);
        }

        let response = request.send().await.map_err(|e| map_reqwest(&self.server, e))?;
        inflight.record_sent();

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(status_error(&self.server, status, self.session_id().is_some(), &detail));
        }
        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            self.set_session(Some(session.to_string()));
        }

        let is_sse = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));
        let text = response.text().await.map_err(|e| map_reqwest(&self.server, e))?;
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }

        let payloads: Vec<String> = if is_sse {
            sse::parse_body(&text)
                .into_iter()
                .filter(sse::SseEvent::is_message)
                .map(|event| event.data)
                .collect()
        } else {
            vec![text]
        };

        let mut replies = Vec::new();
        for payload in payloads {
            replies.extend(route_payload(&self.server, &payload, inflight));
        }
        Ok(replies)
    }

    /// Ask the server to end the session. Best effort.
    pub(crate) async fn terminate_session(&self) {
        let Some(session) = self.session_header() else {
            return;
        };
        let result = self
            .client
            .delete(self.endpoint.clone())
            .headers(self.headers.clone())
            .header(SESSION_HEADER, session)
            .timeout(self.timeout)
            .send()
            .await;
        match result {
            Ok(resp) => debug!(server = %self.server, status = %resp.status(), "Session terminated"),
            Err(e) => debug!(server = %self.server, error = %e, "Session termination failed"),
        }
    }
}

/// Decode one payload (single message or batch) and route every message.
/// Returns replies owed to server-initiated requests.
pub(crate) fn route_payload(server: &str, payload: &str, inflight: &Inflight) -> Vec<JsonRpcMessage> {
    let value: serde_json::Value = match serde_json::from_str(payload) {
        Ok(value) => value,
        Err(e) => {
            inflight.violation(format!("undecodable payload from '{server}': {e}"));
            return Vec::new();
        }
    };
    let items = match value {
        serde_json::Value::Array(items) => items,
        single => vec![single],
    };

    let mut replies = Vec::new();
    for item in items {
        match JsonRpcMessage::from_value(item.clone()) {
            Ok(message) => replies.extend(inflight.route(message)),
            Err(e) => inflight.malformed(&item, e),
        }
    }
    replies
}

/// Map an unsuccessful HTTP status to the error taxonomy.
pub(crate) fn status_error(server: &str, status: StatusCode, has_session: bool, detail: &str) -> ConduitError {
    let detail = detail.trim();
    let message = if detail.is_empty() {
        format!("server '{server}' returned {status}")
    } else {
        format!("server '{server}' returned {status}: {detail}")
    };
    match status {
        StatusCode::NOT_FOUND if has_session => ConduitError::SessionExpired(message),
        StatusCode::NOT_FOUND => ConduitError::Configuration(message),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ConduitError::Configuration(message),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => ConduitError::Timeout(message),
        StatusCode::TOO_MANY_REQUESTS => ConduitError::Connection(message),
        s if s.is_server_error() => ConduitError::Connection(message),
        s if s.is_client_error() => ConduitError::Request(message),
        _ => ConduitError::Protocol(message),
    }
}

pub(crate) fn map_reqwest(server: &str, e: reqwest::Error) -> ConduitError {
    if e.is_timeout() {
        ConduitError::Timeout(format!("request to '{server}' timed out: {e}"))
    } else if e.is_builder() {
        ConduitError::Request(format!("invalid request to '{server}': {e}"))
    } else if e.is_decode() {
        ConduitError::Protocol(format!("unreadable response from '{server}': {e}"))
    } else {
        ConduitError::Connection(format!("connection to '{server}' failed: {e}"))
    }
}

/// Stateless transport: no persistent channel, each message is its own POST.
pub struct HttpTransport {
    channel: HttpChannel,
    inflight: Option<Arc<Inflight>>,
}

impl HttpTransport {
    pub(crate) fn new(channel: HttpChannel) -> Self {
        Self {
            channel,
            inflight: None,
        }
    }

    /// Nothing to open on the wire; the handshake POST proves reachability.
    pub(crate) fn open(&mut self, resume: Option<&str>) {
        self.channel.set_session(resume.map(str::to_string));
        self.inflight = Some(Inflight::new(&self.channel.server));
    }

    pub(crate) async fn send(&self, message: &JsonRpcMessage) -> ConduitResult<()> {
        let inflight = self.inflight.as_ref().ok_or_else(|| {
            ConduitError::Connection(format!("transport to '{}' is not connected", self.channel.server))
        })?;
        let result = self.channel.post(message, inflight).await;
        if let Err(ConduitError::SessionExpired(reason)) = &result {
            warn!(server = %self.channel.server, reason = %reason, "Session expired");
        }
        result
    }

    pub(crate) async fn disconnect(&self) {
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

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use conduit_core::ErrorKind;

    #[test]
    fn test_status_mapping() {
        let kind = |status: u16, session: bool| {
            status_error("s", StatusCode::from_u16(status).unwrap(), session, "").kind()
        };
        assert_eq!(kind(404, true), ErrorKind::SessionExpired);
        assert_eq!(kind(404, false), ErrorKind::Configuration);
        assert_eq!(kind(401, false), ErrorKind::Configuration);
        assert_eq!(kind(403, true), ErrorKind::Configuration);
        assert_eq!(kind(429, true), ErrorKind::Connection);
        assert_eq!(kind(503, false), ErrorKind::Connection);
        assert_eq!(kind(504, false), ErrorKind::Timeout);
        assert_eq!(kind(400, true), ErrorKind::Request);
        assert_eq!(kind(422, true), ErrorKind::Request);
    }

    #[test]
    fn test_invalid_credential_header_is_configuration_error() {
        let creds: crate::config::Credentials = [("bad header", "s3cr3t")].into_iter().collect();
        let err = HttpChannel::new(
            "s",
            "http://localhost:1/mcp",
            &creds,
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .err()
        .unwrap();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(!err.to_string().contains("s3cr3t"));
    }

    #[test]
    fn test_route_payload_batch_and_garbage() {
        let inflight = Inflight::new("s");
        let (id, _rx) = inflight.begin("tools/list").unwrap();
        let batch = format!(
            r#"[{{"jsonrpc":"2.0","id":{id},"result":{{}}}},{{"jsonrpc":"2.0","id":"p","method":"ping"}}]"#
        );
        let replies = route_payload("s", &batch, &inflight);
        assert_eq!(replies.len(), 1);
        assert_eq!(inflight.in_flight(), 0);

        assert!(route_payload("s", "<html>", &inflight).is_empty());
    }
}
