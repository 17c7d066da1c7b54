use crate::config::{self, Credentials, ServerDescriptor, TransportKind};
use crate::transport::{
    Channel, HttpChannel, HttpTransport, ProcessTransport, StreamTransport, Transport,
};
use conduit_core::ConduitResult;
use std::collections::HashMap;
use std::time::Duration;

/// Per-transport settings that do not fit in a kind and an endpoint.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub server_name: String,
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub shutdown_grace: Duration,
    /// Headers for HTTP kinds, environment variables for process servers.
    pub credentials: Credentials,
    /// Explicit argv for process servers.
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

impl TransportOptions {
    pub fn new(server_name: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            timeout: Duration::from_millis(config::default_timeout_ms()),
            connect_timeout: Duration::from_millis(config::default_connect_timeout_ms()),
            shutdown_grace: Duration::from_millis(config::default_shutdown_grace_ms()),
            credentials: Credentials::new(),
            args: Vec::new(),
            env: HashMap::new(),
        }
    }

    pub fn from_descriptor(descriptor: &ServerDescriptor) -> Self {
        Self {
            server_name: descriptor.name.clone(),
            timeout: descriptor.declared_timeout(),
            connect_timeout: descriptor.connect_timeout(),
            shutdown_grace: descriptor.shutdown_grace(),
            credentials: descriptor.credentials.clone(),
            args: descriptor.args.clone(),
            env: descriptor.env.clone(),
        }
    }
}

/// Builds unconnected transports.
pub struct TransportFactory;

impl TransportFactory {
    /// Build a transport from a kind name. Unknown kinds are a
    /// configuration error.
    pub fn create(kind: &str, endpoint: &str, options: TransportOptions) -> ConduitResult<Transport> {
        let kind: TransportKind = kind.parse()?;
        Self::build(kind, endpoint, options)
    }

    pub fn from_descriptor(descriptor: &ServerDescriptor) -> ConduitResult<Transport> {
        descriptor.validate()?;
        Self::build(
            descriptor.transport_kind,
            &descriptor.endpoint,
            TransportOptions::from_descriptor(descriptor),
        )
    }

    fn build(kind: TransportKind, endpoint: &str, options: TransportOptions) -> ConduitResult<Transport> {
        let server = options.server_name.as_str();
        let channel = match kind {
            TransportKind::Stream => Channel::Stream(StreamTransport::new(HttpChannel::new(
                server,
                endpoint,
                &options.credentials,
                options.timeout,
                options.connect_timeout,
            )?)),
            TransportKind::Http => Channel::Http(HttpTransport::new(HttpChannel::new(
                server,
                endpoint,
                &options.credentials,
                options.timeout,
                options.connect_timeout,
            )?)),
            TransportKind::Process => {
                let (program, args) = config::split_command(server, endpoint, &options.args)?;
                let mut env = options.env.clone();
                for (key, value) in options.credentials.iter() {
                    env.insert(key.to_string(), value.to_string());
                }
                Channel::Process(ProcessTransport::new(
                    server,
                    program,
                    args,
                    env,
                    options.shutdown_grace,
                ))
            }
        };
        Ok(Transport::new(
            server,
            options.timeout,
            options.connect_timeout,
            channel,
        ))
    }
}
