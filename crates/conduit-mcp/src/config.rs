use crate::retry::RetryConfig;
use conduit_core::{ConduitError, ConduitResult};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Wire transport used to reach a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Persistent HTTP event stream plus discrete POSTs.
    #[serde(alias = "sse")]
    Stream,
    /// Child process speaking newline-delimited JSON-RPC on stdio.
    #[serde(alias = "stdio")]
    Process,
    /// Independent POST per message, replies in the response body.
    Http,
}

impl TransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::Stream => "stream",
            TransportKind::Process => "process",
            TransportKind::Http => "http",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = ConduitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stream" | "sse" => Ok(TransportKind::Stream),
            "process" | "stdio" => Ok(TransportKind::Process),
            "http" => Ok(TransportKind::Http),
            other => Err(ConduitError::Configuration(format!(
                "unknown transport kind '{other}'"
            ))),
        }
    }
}

/// Opaque credential map. Values never appear in `Debug` output or logs.
#[derive(Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Credentials(HashMap<String, String>);

impl Credentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<&str> = self.0.keys().map(String::as_str).collect();
        keys.sort_unstable();
        f.debug_map()
            .entries(keys.into_iter().map(|k| (k, "<redacted>")))
            .finish()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Credentials {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Declarative description of one capability server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerDescriptor {
    /// Unique name used to address the server.
    pub name: String,
    #[serde(rename = "transport", alias = "transport_kind")]
    pub transport_kind: TransportKind,
    /// URL for HTTP kinds, command line for process servers.
    pub endpoint: String,
    /// Explicit argv for process servers. When empty the endpoint is split
    /// on whitespace.
    #[serde(default)]
    pub args: Vec<String>,
    /// Non-secret environment for process servers.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Headers for HTTP kinds, environment variables for process servers.
    #[serde(default)]
    pub credentials: Credentials,
    /// Per-request deadline in milliseconds (default: 30000).
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Deadline for opening the channel, in milliseconds (default: 10000).
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Grace period for a child process to exit before it is killed
    /// (default: 2000).
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

pub(crate) fn default_timeout_ms() -> u64 {
    30_000
}
pub(crate) fn default_connect_timeout_ms() -> u64 {
    10_000
}
pub(crate) fn default_shutdown_grace_ms() -> u64 {
    2_000
}

impl ServerDescriptor {
    pub fn new(name: impl Into<String>, kind: TransportKind, endpoint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transport_kind: kind,
            endpoint: endpoint.into(),
            args: Vec::new(),
            env: HashMap::new(),
            credentials: Credentials::new(),
            timeout_ms: default_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }

    pub fn stream(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self::new(name, TransportKind::Stream, url)
    }

    pub fn process(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self::new(name, TransportKind::Process, command)
    }

    pub fn http(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self::new(name, TransportKind::Http, url)
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_credential(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.credentials.insert(key, value);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn declared_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Program and argv for a process server.
    pub fn command_line(&self) -> ConduitResult<(String, Vec<String>)> {
        split_command(&self.name, &self.endpoint, &self.args)
    }

    pub fn validate(&self) -> ConduitResult<()> {
        if self.name.trim().is_empty() {
            return Err(ConduitError::Configuration("server name must not be empty".into()));
        }
        if self.endpoint.trim().is_empty() {
            return Err(ConduitError::Configuration(format!(
                "server '{}' has an empty endpoint",
                self.name
            )));
        }
        if self.timeout_ms == 0 || self.connect_timeout_ms == 0 {
            return Err(ConduitError::Configuration(format!(
                "server '{}' timeouts must be greater than zero",
                self.name
            )));
        }
        match self.transport_kind {
            TransportKind::Stream | TransportKind::Http => {
                let url = reqwest::Url::parse(&self.endpoint).map_err(|e| {
                    ConduitError::Configuration(format!(
                        "server '{}' endpoint is not a valid URL: {e}",
                        self.name
                    ))
                })?;
                if !matches!(url.scheme(), "http" | "https") {
                    return Err(ConduitError::Configuration(format!(
                        "server '{}' endpoint must use http or https",
                        self.name
                    )));
                }
            }
            TransportKind::Process => {
                self.command_line()?;
            }
        }
        Ok(())
    }
}

/// Top-level configuration: retry policy plus the servers to register.
#[derive(Debug, Clone, Deserialize)]
pub struct ConduitConfig {
    #[serde(default)]
    pub retry: RetryConfig,
    /// Health check interval in seconds (default: 60). Set to 0 to disable.
    #[serde(default = "default_health_interval")]
    pub health_check_interval_secs: u64,
    #[serde(default)]
    pub servers: Vec<ServerDescriptor>,
}

fn default_health_interval() -> u64 {
    60
}

impl Default for ConduitConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            health_check_interval_secs: default_health_interval(),
            servers: Vec::new(),
        }
    }
}

impl ConduitConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(text: &str) -> ConduitResult<Self> {
        let config: ConduitConfig = toml::from_str(text)
            .map_err(|e| ConduitError::Configuration(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub async fn load(path: impl AsRef<Path>) -> ConduitResult<Self> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            ConduitError::Configuration(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> ConduitResult<()> {
        self.retry.validate()?;
        let mut seen = HashSet::new();
        for server in &self.servers {
            server.validate()?;
            if !seen.insert(server.name.as_str()) {
                return Err(ConduitError::Configuration(format!(
                    "duplicate server name '{}'",
                    server.name
                )));
            }
        }
        Ok(())
    }

    pub fn health_check_interval(&self) -> Option<Duration> {
        (self.health_check_interval_secs > 0)
            .then(|| Duration::from_secs(self.health_check_interval_secs))
    }
}

/// Split a process endpoint into program and argv. Explicit `args` replace
/// whatever followed the program in `command`.
pub(crate) fn split_command(
    server: &str,
    command: &str,
    args: &[String],
) -> ConduitResult<(String, Vec<String>)> {
    let mut parts = command.split_whitespace();
    let program = parts.next().ok_or_else(|| {
        ConduitError::Configuration(format!("server '{server}' has an empty command"))
    })?;
    let args = if args.is_empty() {
        parts.map(str::to_string).collect()
    } else {
        args.to_vec()
    };
    Ok((program.to_string(), args))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use conduit_core::ErrorKind;

    #[test]
    fn test_descriptor_defaults() {
        let desc: ServerDescriptor = serde_json::from_str(
            r#"{"name":"fs","transport":"process","endpoint":"mcp-fs --root /tmp"}"#,
        )
        .unwrap();
        assert_eq!(desc.transport_kind, TransportKind::Process);
        assert_eq!(desc.declared_timeout(), Duration::from_secs(30));
        assert_eq!(desc.connect_timeout(), Duration::from_secs(10));
        assert!(desc.credentials.is_empty());
        let (program, args) = desc.command_line().unwrap();
        assert_eq!(program, "mcp-fs");
        assert_eq!(args, vec!["--root", "/tmp"]);
    }

    #[test]
    fn test_explicit_args_win_over_endpoint_split() {
        let desc = ServerDescriptor::process("x", "npx ignored").with_args(["-y", "server"]);
        let (program, args) = desc.command_line().unwrap();
        assert_eq!(program, "npx");
        assert_eq!(args, vec!["-y", "server"]);
    }

    #[test]
    fn test_split_command() {
        let (program, args) = split_command("x", "  srv   --a  b ", &[]).unwrap();
        assert_eq!(program, "srv");
        assert_eq!(args, vec!["--a", "b"]);

        let err = split_command("x", " \t ", &["--a".to_string()]).unwrap_err();
        assert_eq!(err.to_string(), ServerDescriptor::process("x", " ").command_line().unwrap_err().to_string());
        assert!(err.to_string().contains("empty command"));
    }

    #[test]
    fn test_transport_kind_parse() {
        assert_eq!("stream".parse::<TransportKind>().unwrap(), TransportKind::Stream);
        assert_eq!("SSE".parse::<TransportKind>().unwrap(), TransportKind::Stream);
        assert_eq!("stdio".parse::<TransportKind>().unwrap(), TransportKind::Process);
        assert_eq!("http".parse::<TransportKind>().unwrap(), TransportKind::Http);
        let err = "carrier-pigeon".parse::<TransportKind>().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_credentials_are_redacted() {
        let desc = ServerDescriptor::stream("gh", "https://mcp.example.com/mcp")
            .with_credential("Authorization", "Bearer super-secret");
        let rendered = format!("{desc:?}");
        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("Authorization"));
        assert_eq!(
            desc.credentials.get("Authorization"),
            Some("Bearer super-secret")
        );
    }

    #[test]
    fn test_validate() {
        assert!(ServerDescriptor::stream("a", "https://example.com/mcp").validate().is_ok());
        assert!(ServerDescriptor::stream("a", "not a url").validate().is_err());
        assert!(ServerDescriptor::http("a", "ftp://example.com").validate().is_err());
        assert!(ServerDescriptor::process("a", "   ").validate().is_err());
        assert!(ServerDescriptor::process("", "cmd").validate().is_err());
        let zero = ServerDescriptor::process("a", "cmd").with_timeout(Duration::ZERO);
        assert!(zero.validate().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let config = ConduitConfig::from_toml_str(
            r#"
            health_check_interval_secs = 0

            [retry]
            max_retries = 5
            initial_delay_ms = 250

            [[servers]]
            name = "calc"
            transport = "process"
            endpoint = "calc-server"
            env = { LOG_LEVEL = "error" }

            [[servers]]
            name = "search"
            transport = "stream"
            endpoint = "https://search.example.com/mcp"
            timeout_ms = 5000
            credentials = { Authorization = "Bearer t0k3n" }
            "#,
        )
        .unwrap();

        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.initial_delay_ms, 250);
        assert_eq!(config.retry.backoff_factor, 2.0);
        assert!(config.health_check_interval().is_none());
        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.servers[0].env.get("LOG_LEVEL").unwrap(), "error");
        assert_eq!(config.servers[1].declared_timeout(), Duration::from_secs(5));
        assert_eq!(config.servers[1].credentials.len(), 1);
    }

    #[test]
    fn test_config_rejects_duplicates_and_unknown_kinds() {
        let dup = ConduitConfig::from_toml_str(
            r#"
            [[servers]]
            name = "a"
            transport = "process"
            endpoint = "x"
            [[servers]]
            name = "a"
            transport = "process"
            endpoint = "y"
            "#,
        )
        .unwrap_err();
        assert_eq!(dup.kind(), ErrorKind::Configuration);

        let unknown = ConduitConfig::from_toml_str(
            r#"
            [[servers]]
            name = "a"
            transport = "telnet"
            endpoint = "x"
            "#,
        )
        .unwrap_err();
        assert_eq!(unknown.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_config_defaults() {
        let config = ConduitConfig::from_toml_str("").unwrap();
        assert!(config.servers.is_empty());
        assert_eq!(config.health_check_interval(), Some(Duration::from_secs(60)));
        assert_eq!(config.retry.max_retries, 3);
    }
}
