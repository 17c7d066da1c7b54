//! MCP (Model Context Protocol) JSON-RPC 2.0 message codec and payload types.
//!
//! Messages are decoded from a generic JSON value rather than derived
//! structs so that `"result": null` stays distinguishable from a missing
//! `result` and so that every structural violation surfaces as a
//! [`ConduitError::Protocol`].

use conduit_core::{ConduitError, ConduitResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// The only JSON-RPC version spoken on the wire.
pub const JSONRPC_VERSION: &str = "2.0";

/// MCP protocol revision announced during `initialize`.
pub const PROTOCOL_VERSION: &str = "2025-03-26";

/// Standard JSON-RPC error codes.
pub mod error_codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i64 = -32700;
    /// The JSON sent is not a valid request object.
    pub const INVALID_REQUEST: i64 = -32600;
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i64 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i64 = -32603;
}

/// Method names used by the connection core.
pub mod methods {
    /// Capability negotiation request.
    pub const INITIALIZE: &str = "initialize";
    /// Sent by the client once the handshake completed.
    pub const INITIALIZED: &str = "notifications/initialized";
    /// Liveness check, in either direction.
    pub const PING: &str = "ping";
    /// Tool discovery.
    pub const TOOLS_LIST: &str = "tools/list";
    /// Tool invocation.
    pub const TOOLS_CALL: &str = "tools/call";
    /// Best-effort abort of an in-flight request.
    pub const CANCELLED: &str = "notifications/cancelled";
    /// The server's tool set changed.
    pub const TOOLS_LIST_CHANGED: &str = "notifications/tools/list_changed";
}

/// A JSON-RPC request id. Conduit issues numeric ids; servers may use
/// strings for their own requests.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Numeric id.
    Number(u64),
    /// String id.
    Text(String),
}

impl RequestId {
    /// The numeric value, if this id is numeric.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            RequestId::Number(n) => Some(*n),
            RequestId::Text(_) => None,
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::Text(s) => f.write_str(s),
        }
    }
}

impl From<u64> for RequestId {
    fn from(id: u64) -> Self {
        RequestId::Number(id)
    }
}

/// JSON-RPC 2.0 request.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcRequest {
    pub id: RequestId,
    pub method: String,
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC 2.0 notification (no id, no reply).
#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcNotification {
    pub method: String,
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Either the `result` or the `error` member of a response.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseOutcome {
    Result(Value),
    Error(JsonRpcError),
}

/// JSON-RPC 2.0 response. `id` is `None` only when the server could not
/// determine which request failed (e.g. a parse error).
#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcResponse {
    pub id: Option<RequestId>,
    pub outcome: ResponseOutcome,
}

impl JsonRpcResponse {
    pub fn success(id: impl Into<RequestId>, result: Value) -> Self {
        Self {
            id: Some(id.into()),
            outcome: ResponseOutcome::Result(result),
        }
    }

    pub fn failure(id: Option<RequestId>, code: i64, message: impl Into<String>) -> Self {
        Self {
            id,
            outcome: ResponseOutcome::Error(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }
}

/// Any message that may travel over a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum JsonRpcMessage {
    Request(JsonRpcRequest),
    Response(JsonRpcResponse),
    Notification(JsonRpcNotification),
}

impl JsonRpcMessage {
    /// Build the wire representation.
    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("jsonrpc".into(), Value::from(JSONRPC_VERSION));
        match self {
            JsonRpcMessage::Request(req) => {
                obj.insert("id".into(), id_to_value(Some(&req.id)));
                obj.insert("method".into(), Value::from(req.method.as_str()));
                if let Some(params) = &req.params {
                    obj.insert("params".into(), params.clone());
                }
            }
            JsonRpcMessage::Notification(note) => {
                obj.insert("method".into(), Value::from(note.method.as_str()));
                if let Some(params) = &note.params {
                    obj.insert("params".into(), params.clone());
                }
            }
            JsonRpcMessage::Response(resp) => {
                obj.insert("id".into(), id_to_value(resp.id.as_ref()));
                match &resp.outcome {
                    ResponseOutcome::Result(result) => {
                        obj.insert("result".into(), result.clone());
                    }
                    ResponseOutcome::Error(err) => {
                        let mut e = Map::new();
                        e.insert("code".into(), Value::from(err.code));
                        e.insert("message".into(), Value::from(err.message.as_str()));
                        if let Some(data) = &err.data {
                            e.insert("data".into(), data.clone());
                        }
                        obj.insert("error".into(), Value::Object(e));
                    }
                }
            }
        }
        Value::Object(obj)
    }

    /// Serialize to a single-line JSON string (no embedded newlines, so the
    /// result is safe to use as a stdio frame).
    pub fn encode(&self) -> ConduitResult<String> {
        serde_json::to_string(&self.to_value())
            .map_err(|e| ConduitError::Request(format!("Failed to serialize message: {e}")))
    }

    /// Parse one message from text.
    pub fn decode(text: &str) -> ConduitResult<Self> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(value)
    }

    /// Parse a body that holds either a single message or a JSON-RPC batch.
    pub fn decode_batch(text: &str) -> ConduitResult<Vec<Self>> {
        match serde_json::from_str::<Value>(text)? {
            Value::Array(items) => items.into_iter().map(Self::from_value).collect(),
            single => Ok(vec![Self::from_value(single)?]),
        }
    }

    /// Classify and validate an already-parsed JSON value.
    pub fn from_value(value: Value) -> ConduitResult<Self> {
        let Value::Object(mut obj) = value else {
            return Err(ConduitError::Protocol(
                "JSON-RPC message must be an object".into(),
            ));
        };

        match obj.get("jsonrpc") {
            Some(Value::String(v)) if v == JSONRPC_VERSION => {}
            other => {
                return Err(ConduitError::Protocol(format!(
                    "unsupported jsonrpc version: {}",
                    other.map(Value::to_string).unwrap_or_else(|| "missing".into())
                )))
            }
        }

        let params = match obj.remove("params") {
            None | Some(Value::Null) => None,
            Some(p) => Some(p),
        };

        if let Some(method) = obj.remove("method") {
            let Value::String(method) = method else {
                return Err(ConduitError::Protocol("method must be a string".into()));
            };
            return match obj.remove("id") {
                None | Some(Value::Null) => Ok(JsonRpcMessage::Notification(
                    JsonRpcNotification { method, params },
                )),
                Some(id) => Ok(JsonRpcMessage::Request(JsonRpcRequest {
                    id: parse_id(id)?,
                    method,
                    params,
                })),
            };
        }

        let Some(id) = obj.remove("id") else {
            return Err(ConduitError::Protocol(
                "message has neither method nor id".into(),
            ));
        };
        let id = match id {
            Value::Null => None,
            other => Some(parse_id(other)?),
        };

        let outcome = match (obj.remove("result"), obj.remove("error")) {
            (Some(result), None) => ResponseOutcome::Result(result),
            (None, Some(error)) => {
                let error: JsonRpcError = serde_json::from_value(error).map_err(|e| {
                    ConduitError::Protocol(format!("malformed error object: {e}"))
                })?;
                ResponseOutcome::Error(error)
            }
            (Some(_), Some(_)) => {
                return Err(ConduitError::Protocol(
                    "response carries both result and error".into(),
                ))
            }
            (None, None) => {
                return Err(ConduitError::Protocol(
                    "response carries neither result nor error".into(),
                ))
            }
        };

        Ok(JsonRpcMessage::Response(JsonRpcResponse { id, outcome }))
    }
}

fn id_to_value(id: Option<&RequestId>) -> Value {
    match id {
        Some(RequestId::Number(n)) => Value::from(*n),
        Some(RequestId::Text(s)) => Value::from(s.as_str()),
        None => Value::Null,
    }
}

fn parse_id(value: Value) -> ConduitResult<RequestId> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .map(RequestId::Number)
            .ok_or_else(|| ConduitError::Protocol(format!("unsupported numeric id: {n}"))),
        Value::String(s) => Ok(RequestId::Text(s)),
        other => Err(ConduitError::Protocol(format!(
            "id must be a number or string, got {other}"
        ))),
    }
}

// --- MCP payloads ---

/// MCP tool definition from the `tools/list` response.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct McpToolDef {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_input_schema", rename = "inputSchema")]
    pub input_schema: Value,
}

fn default_input_schema() -> Value {
    serde_json::json!({"type": "object", "properties": {}})
}

/// One page of a `tools/list` response.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsPage {
    #[serde(default)]
    pub tools: Vec<McpToolDef>,
    #[serde(default, rename = "nextCursor")]
    pub next_cursor: Option<String>,
}

/// MCP tool call result from the `tools/call` response.
#[derive(Debug, Clone, Deserialize)]
pub struct McpToolResult {
    #[serde(default)]
    pub content: Vec<McpContent>,
    #[serde(default, rename = "isError")]
    pub is_error: bool,
}

impl McpToolResult {
    /// Join every text block into one string.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// MCP content block.
#[derive(Debug, Clone, Deserialize)]
pub struct McpContent {
    #[serde(rename = "type")]
    pub content_type: String,
    #[serde(default)]
    pub text: String,
}

/// MCP server capabilities from the `initialize` response.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ServerCapabilities {
    #[serde(default)]
    pub tools: Option<Value>,
    #[serde(default)]
    pub resources: Option<Value>,
    #[serde(default)]
    pub prompts: Option<Value>,
}

/// MCP initialize response.
#[derive(Debug, Clone, Deserialize)]
pub struct InitializeResult {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: ServerCapabilities,
    #[serde(default, rename = "serverInfo")]
    pub server_info: Option<ServerInfo>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerInfo {
    pub name: String,
    #[serde(default)]
    pub version: String,
}

/// Parameters of the client's `initialize` request.
pub fn initialize_params() -> Value {
    serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": "conduit",
            "version": env!("CARGO_PKG_VERSION")
        }
    })
}
