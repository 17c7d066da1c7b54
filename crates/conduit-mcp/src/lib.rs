//! MCP capability-provider connection core.
//!
//! Connects an agent to external tool servers over three transports (a
//! persistent HTTP event stream, a child process on stdio, and stateless
//! HTTP), keeps sessions alive across reconnects, and runs every call
//! through a cancellable retry engine.
//!
//! # Main types
//!
//! - [`CapabilityHandler`] — Registers servers, discovers tools, dispatches
//!   calls, reconnects and health-checks.
//! - [`Transport`] / [`TransportFactory`] — Wire channels and their builder.
//! - [`with_retry`] / [`RetryConfig`] — Exponential backoff with jitter.
//! - [`CancellationToken`] — Cooperative cancellation threaded through
//!   every suspending call.
//! - [`SessionRegistry`] — One live session per server.

pub mod cancel;
pub mod config;
pub mod factory;
pub mod handler;
pub mod protocol;
pub mod retry;
pub mod session;
pub mod transport;

pub use cancel::{CancellationToken, Registration};
pub use config::{ConduitConfig, Credentials, ServerDescriptor, TransportKind};
pub use factory::{TransportFactory, TransportOptions};
pub use handler::{CapabilityHandler, ConnectionStats, ServerState, ToolDescriptor, ToolListing};
pub use retry::{with_retry, Retried, RetryConfig, RetryOutcome, RetryStats};
pub use session::{Session, SessionChange, SessionRegistry};
pub use transport::{Handshake, InboundEvent, InboundStream, Transport, TransportStats};
