use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A convenience `Result` alias using [`ConduitError`].
pub type ConduitResult<T> = Result<T, ConduitError>;

/// Coarse classification of a [`ConduitError`], used by retry policy and by
/// callers that need to branch on the failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad descriptor, unknown transport kind, rejected credentials.
    Configuration,
    /// Handshake or mid-session transport failure.
    Connection,
    /// The remote rejected the session token. Retryable with a fresh session.
    SessionExpired,
    /// A network operation exceeded its deadline. Retryable.
    Timeout,
    /// Malformed outbound request (caller bug).
    Request,
    /// Structurally invalid remote response (remote bug).
    Protocol,
    /// The operation was stopped by a fired cancellation token.
    Cancelled,
    /// No server is registered under the requested name.
    ServerNotFound,
    /// The server does not advertise the requested tool.
    ToolNotFound,
    /// The tool ran and reported a failure.
    ToolExecution,
}

impl ErrorKind {
    /// Whether an operation that failed with this kind may be attempted again.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Connection | ErrorKind::SessionExpired | ErrorKind::Timeout
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::Connection => "connection",
            ErrorKind::SessionExpired => "session_expired",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Request => "request",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::ServerNotFound => "server_not_found",
            ErrorKind::ToolNotFound => "tool_not_found",
            ErrorKind::ToolExecution => "tool_execution",
        };
        f.write_str(name)
    }
}

/// One attempt made by the retry engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// Zero-based attempt index.
    pub attempt: u32,
    /// Backoff slept before this attempt started (zero for the first one).
    pub delay_before_ms: u64,
    /// When the attempt started.
    pub started_at: DateTime<Utc>,
    /// How long the attempt ran.
    pub duration_ms: u64,
    /// Failure category, `None` when the attempt succeeded.
    pub error_kind: Option<ErrorKind>,
    /// Rendered failure, `None` when the attempt succeeded.
    pub error: Option<String>,
}

/// Top-level error type for the Conduit connection core.
///
/// Raw platform errors (I/O, HTTP client, JSON) are translated into one of
/// these variants at the transport boundary and never escape it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConduitError {
    /// A descriptor or configuration value is invalid. Never retried.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The channel to the server failed during connect or mid-session.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The server no longer recognises the session token.
    #[error("Session expired: {0}")]
    SessionExpired(String),

    /// A network operation exceeded its deadline.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The outbound request could not be built or was rejected as malformed.
    #[error("Request error: {0}")]
    Request(String),

    /// The server sent something that is not valid protocol.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The operation was cancelled through its token.
    #[error("Operation cancelled")]
    Cancelled,

    /// No server with this name is registered.
    #[error("Server not found: {0}")]
    ServerNotFound(String),

    /// The named tool is not advertised by the server.
    #[error("Tool '{tool}' not found on server '{server}'")]
    ToolNotFound {
        /// Server that was asked.
        server: String,
        /// Tool that was requested.
        tool: String,
    },

    /// The tool ran and reported failure, or the server answered the call
    /// with a JSON-RPC error.
    #[error("Tool execution error: {0}")]
    ToolExecution(String),

    /// Retries ran out. Carries the last cause and every attempt made.
    #[error("{source} (gave up after {attempts} attempts)")]
    Exhausted {
        /// Number of attempts made.
        attempts: u32,
        /// Per-attempt history, oldest first.
        history: Vec<AttemptRecord>,
        /// The error of the final attempt.
        source: Box<ConduitError>,
    },
}

impl ConduitError {
    /// Classify this error. [`ConduitError::Exhausted`] reports the kind of
    /// its last cause.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConduitError::Configuration(_) => ErrorKind::Configuration,
            ConduitError::Connection(_) => ErrorKind::Connection,
            ConduitError::SessionExpired(_) => ErrorKind::SessionExpired,
            ConduitError::Timeout(_) => ErrorKind::Timeout,
            ConduitError::Request(_) => ErrorKind::Request,
            ConduitError::Protocol(_) => ErrorKind::Protocol,
            ConduitError::Cancelled => ErrorKind::Cancelled,
            ConduitError::ServerNotFound(_) => ErrorKind::ServerNotFound,
            ConduitError::ToolNotFound { .. } => ErrorKind::ToolNotFound,
            ConduitError::ToolExecution(_) => ErrorKind::ToolExecution,
            ConduitError::Exhausted { source, .. } => source.kind(),
        }
    }

    /// Whether the retry engine may attempt the failed operation again.
    ///
    /// An exhausted error is terminal even though its cause may be retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            ConduitError::Exhausted { .. } => false,
            other => other.kind().is_retryable(),
        }
    }

    /// Whether this is a cancellation rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        self.kind() == ErrorKind::Cancelled
    }

    /// Whether this belongs to the connection family (plain connection
    /// failures, timeouts and expired sessions).
    pub fn is_connection(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Connection | ErrorKind::Timeout | ErrorKind::SessionExpired
        )
    }

    /// Attempt history attached by the retry engine, empty otherwise.
    pub fn history(&self) -> &[AttemptRecord] {
        match self {
            ConduitError::Exhausted { history, .. } => history,
            _ => &[],
        }
    }

    /// The innermost cause, unwrapping [`ConduitError::Exhausted`].
    pub fn root_cause(&self) -> &ConduitError {
        match self {
            ConduitError::Exhausted { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

impl From<serde_json::Error> for ConduitError {
    fn from(err: serde_json::Error) -> Self {
        ConduitError::Protocol(format!("invalid JSON: {err}"))
    }
}
