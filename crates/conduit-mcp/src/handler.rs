//! The capability handler: owns every registered server, its transport,
//! session and tool cache, and runs all traffic through the retry engine.

use crate::cancel::CancellationToken;
use crate::config::{ConduitConfig, ServerDescriptor, TransportKind};
use crate::factory::TransportFactory;
use crate::protocol::{methods, McpToolDef, McpToolResult, ToolsPage};
use crate::retry::{with_retry, RetryConfig, RetryOutcome, RetryStats};
use crate::session::{Session, SessionChange, SessionRegistry};
use crate::transport::{InboundEvent, InboundStream, Transport, TransportStats};
use chrono::{DateTime, Utc};
use conduit_core::{ConduitError, ConduitResult, ErrorKind};
use futures_util::StreamExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Upper bound on `tools/list` pages followed for one server.
const MAX_TOOL_PAGES: usize = 100;

/// Lifecycle of one server as seen by the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    Unregistered,
    Connecting,
    Connected,
    /// A transport error was seen; the next call reconnects.
    Degraded,
    Disconnected,
}

/// A tool advertised by a registered server.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub owning_server: String,
}

impl ToolDescriptor {
    fn from_def(def: McpToolDef, server: &str) -> Self {
        Self {
            name: def.name,
            description: def.description,
            input_schema: def.input_schema,
            owning_server: server.to_string(),
        }
    }
}

/// Result of [`CapabilityHandler::list_tools`]. `warnings` is non-empty when
/// the set is partial.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ToolListing {
    pub tools: Vec<ToolDescriptor>,
    pub warnings: Vec<String>,
}

impl ToolListing {
    pub fn is_partial(&self) -> bool {
        !self.warnings.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name.as_str()).collect()
    }
}

/// Status of a managed server.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    pub server: String,
    pub kind: TransportKind,
    pub state: ServerState,
    pub session_id: Option<String>,
    pub reconnect_count: usize,
    pub tool_count: usize,
    /// The cached tool set will be refreshed before its next use.
    pub tools_stale: bool,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_health_check: Option<DateTime<Utc>>,
    pub transport: Option<TransportStats>,
}

#[derive(Default)]
struct ToolCache {
    tools: Vec<ToolDescriptor>,
    warnings: Vec<String>,
    stale: bool,
}

struct Discovered {
    tools: Vec<ToolDescriptor>,
    warnings: Vec<String>,
}

/// The transport currently serving a server, tagged so a failure observed
/// on an old transport never tears down its replacement.
#[derive(Clone)]
struct Link {
    transport: Arc<Transport>,
    generation: u64,
}

/// Internal state for a managed server.
struct ManagedServer {
    descriptor: ServerDescriptor,
    state: RwLock<ServerState>,
    link: RwLock<Option<Link>>,
    reconnect_lock: tokio::sync::Mutex<()>,
    generation: AtomicU64,
    tools: RwLock<ToolCache>,
    connected_at: RwLock<Option<DateTime<Utc>>>,
    last_health_check: RwLock<Option<DateTime<Utc>>>,
    handshakes: AtomicUsize,
    removed: AtomicBool,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl ManagedServer {
    fn new(descriptor: ServerDescriptor) -> Self {
        Self {
            descriptor,
            state: RwLock::new(ServerState::Connecting),
            link: RwLock::new(None),
            reconnect_lock: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
            tools: RwLock::new(ToolCache {
                stale: true,
                ..ToolCache::default()
            }),
            connected_at: RwLock::new(None),
            last_health_check: RwLock::new(None),
            handshakes: AtomicUsize::new(0),
            removed: AtomicBool::new(false),
            watcher: Mutex::new(None),
        }
    }

    fn name(&self) -> &str {
        &self.descriptor.name
    }

    fn state(&self) -> ServerState {
        *self.state.read()
    }

    fn set_state(&self, next: ServerState) {
        let previous = std::mem::replace(&mut *self.state.write(), next);
        if previous != next {
            debug!(server = %self.name(), from = ?previous, to = ?next, "Server state changed");
        }
    }

    fn live_link(&self) -> Option<Link> {
        self.link
            .read()
            .as_ref()
            .filter(|link| link.transport.is_connected())
            .cloned()
    }

    fn take_link(&self) -> Option<Link> {
        self.link.write().take()
    }

    /// Take the link only if it is still the one identified by `generation`.
    fn take_link_if(&self, generation: u64) -> Option<Link> {
        let mut link = self.link.write();
        if link.as_ref().map(|l| l.generation) == Some(generation) {
            link.take()
        } else {
            None
        }
    }

    fn reconnect_count(&self) -> usize {
        self.handshakes.load(Ordering::SeqCst).saturating_sub(1)
    }

    fn tools_stale(&self) -> bool {
        self.tools.read().stale
    }

    fn has_tool(&self, tool: &str) -> bool {
        self.tools.read().tools.iter().any(|t| t.name == tool)
    }

    fn invalidate_tools(&self) {
        self.tools.write().stale = true;
    }

    fn store_tools(&self, discovered: Discovered) {
        let mut cache = self.tools.write();
        cache.tools = discovered.tools;
        cache.warnings = discovered.warnings;
        cache.stale = false;
    }

    fn listing(&self) -> ToolListing {
        let cache = self.tools.read();
        ToolListing {
            tools: cache.tools.clone(),
            warnings: cache.warnings.clone(),
        }
    }

    /// Consume the transport's inbound events until it closes.
    fn watch(self: &Arc<Self>, mut events: InboundStream, generation: u64) {
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let Some(server) = weak.upgrade() else {
                    break;
                };
                match event {
                    InboundEvent::Notification(note) if note.method == methods::TOOLS_LIST_CHANGED => {
                        info!(server = %server.name(), "Tool list changed");
                        server.invalidate_tools();
                    }
                    InboundEvent::Notification(note) => {
                        debug!(server = %server.name(), method = %note.method, "Unhandled notification");
                    }
                    InboundEvent::ProtocolViolation(detail) => {
                        warn!(server = %server.name(), detail = %detail, "Ignoring malformed message");
                    }
                    InboundEvent::Closed(reason) => {
                        if server.take_link_if(generation).is_some() {
                            warn!(server = %server.name(), reason = %reason, "Connection lost");
                            server.set_state(ServerState::Degraded);
                        }
                    }
                }
            }
        });
        if let Some(previous) = self.watcher.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Drop the transport and stop the watcher.
    async fn retire(&self) {
        self.removed.store(true, Ordering::SeqCst);
        if let Some(handle) = self.watcher.lock().take() {
            handle.abort();
        }
        if let Some(link) = self.take_link() {
            link.transport.terminate_session().await;
            link.transport.disconnect().await;
        }
        *self.tools.write() = ToolCache {
            stale: true,
            ..ToolCache::default()
        };
        self.set_state(ServerState::Disconnected);
    }
}

/// Whether an error means the transport itself is unusable.
fn breaks_transport(err: &ConduitError) -> bool {
    matches!(err.kind(), ErrorKind::Connection | ErrorKind::SessionExpired)
}

/// Manages every capability server connection: registration, tool
/// discovery, dispatch with retry, reconnection and health checks.
pub struct CapabilityHandler {
    servers: tokio::sync::RwLock<HashMap<String, Arc<ManagedServer>>>,
    sessions: SessionRegistry,
    retry: RetryConfig,
    retry_stats: RwLock<HashMap<String, RetryStats>>,
    health_loop: Mutex<Option<JoinHandle<()>>>,
}

impl CapabilityHandler {
    pub fn new(retry: RetryConfig) -> Self {
        Self {
            servers: tokio::sync::RwLock::new(HashMap::new()),
            sessions: SessionRegistry::new(),
            retry,
            retry_stats: RwLock::new(HashMap::new()),
            health_loop: Mutex::new(None),
        }
    }

    /// Build a handler from configuration and register every server in it.
    /// Returns the handler and the errors of servers that failed to connect.
    ///
    /// When `health_check_interval_secs` is non-zero the health loop is
    /// already running on the returned handler.
    pub async fn from_config(config: &ConduitConfig) -> ConduitResult<(Arc<Self>, Vec<ConduitError>)> {
        config.validate()?;
        let handler = Arc::new(Self::new(config.retry.clone()));
        let errors = handler.connect_all(&config.servers).await;
        if let Some(interval) = config.health_check_interval() {
            handler.start_health_loop(interval);
        }
        Ok((handler, errors))
    }

    /// Register every descriptor. Returns a list of errors for servers that
    /// failed to connect.
    pub async fn connect_all(&self, descriptors: &[ServerDescriptor]) -> Vec<ConduitError> {
        let mut errors = Vec::new();
        for descriptor in descriptors {
            if let Err(e) = self.register_server(descriptor.clone()).await {
                warn!(server = %descriptor.name, error = %e, "Failed to connect server");
                errors.push(e);
            }
        }
        errors
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    /// The session currently held with `server`, if any.
    pub fn session(&self, server: &str) -> Option<Session> {
        self.sessions.get(server)
    }

    /// Register a server and connect to it under the retry policy.
    ///
    /// A server whose attempts run out stays registered as
    /// [`ServerState::Disconnected`] and the error is returned.
    pub async fn register_server(&self, descriptor: ServerDescriptor) -> ConduitResult<ServerState> {
        descriptor.validate()?;
        let name = descriptor.name.clone();
        let server = Arc::new(ManagedServer::new(descriptor));

        let replaced = {
            let mut servers = self.servers.write().await;
            if servers.contains_key(&name) && self.sessions.is_active(&name) {
                return Err(ConduitError::Configuration(format!(
                    "server '{name}' is already registered with an active session"
                )));
            }
            servers.insert(name.clone(), Arc::clone(&server))
        };
        if let Some(previous) = replaced {
            debug!(server = %name, "Replacing previous registration");
            previous.retire().await;
        }

        info!(
            server = %name,
            kind = %server.descriptor.transport_kind,
            "Registering server"
        );
        let token = CancellationToken::new();
        let run = with_retry(&self.retry, &token, "connect", |attempt| {
            let server = Arc::clone(&server);
            let token = token.clone();
            async move {
                if attempt > 0 {
                    server.set_state(ServerState::Degraded);
                }
                self.acquire(&server, &token).await.map(|_| ())
            }
        })
        .await;
        self.record_stats(&name, run.stats);

        match run.result {
            Ok(()) => {
                info!(
                    server = %name,
                    tools = server.tools.read().tools.len(),
                    "Server registered"
                );
                Ok(ServerState::Connected)
            }
            Err(e) => {
                error!(server = %name, error = %e, "Server failed to connect");
                server.set_state(ServerState::Disconnected);
                Err(e)
            }
        }
    }

    /// Disconnect and forget a server. No-op if it is not registered.
    pub async fn deregister_server(&self, name: &str) {
        let removed = self.servers.write().await.remove(name);
        let Some(server) = removed else {
            return;
        };
        // Serialize with any reconnect in flight.
        let _guard = server.reconnect_lock.lock().await;
        server.retire().await;
        self.sessions.end(name);
        info!(server = %name, "Server deregistered");
    }

    /// Stop the health loop and deregister every server.
    pub async fn shutdown(&self) {
        self.stop_health_loop();
        let names = self.server_names().await;
        for name in names {
            self.deregister_server(&name).await;
        }
    }

    /// Registered server names, sorted.
    pub async fn server_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.servers.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn server_state(&self, name: &str) -> ServerState {
        self.servers
            .read()
            .await
            .get(name)
            .map_or(ServerState::Unregistered, |s| s.state())
    }

    /// Invoke `tool_name` on `server_name`.
    ///
    /// The tool must be advertised by the server; an unknown name fails with
    /// [`ConduitError::ToolNotFound`] without touching the network. A result
    /// flagged `isError` becomes [`ConduitError::ToolExecution`].
    pub async fn execute_tool(
        &self,
        server_name: &str,
        tool_name: &str,
        parameters: Value,
        token: Option<&CancellationToken>,
    ) -> ConduitResult<Value> {
        let token = token.cloned().unwrap_or_default();
        token.check()?;

        let arguments = match parameters {
            Value::Null => json!({}),
            object @ Value::Object(_) => object,
            other => {
                return Err(ConduitError::Request(format!(
                    "parameters for '{tool_name}' must be a JSON object, got {other}"
                )))
            }
        };
        let server = self.server(server_name).await?;
        self.ensure_tool(&server, tool_name, &token).await?;

        let operation = format!("{}:{tool_name}", methods::TOOLS_CALL);
        let params = json!({"name": tool_name, "arguments": arguments});
        let run = with_retry(&self.retry, &token, &operation, |_| {
            let server = Arc::clone(&server);
            let params = params.clone();
            let token = token.clone();
            async move {
                let link = self.acquire(&server, &token).await?;
                match link
                    .transport
                    .request(methods::TOOLS_CALL, Some(params), &token)
                    .await
                {
                    Ok(value) => {
                        self.sessions.touch(server.name());
                        Ok(value)
                    }
                    Err(e) => {
                        if breaks_transport(&e) {
                            self.mark_failed(&server, &link, &e).await;
                        }
                        Err(e)
                    }
                }
            }
        })
        .await;

        let outcome = run.stats.outcome;
        self.record_stats(server_name, run.stats);
        if outcome == RetryOutcome::Exhausted {
            self.give_up(&server).await;
        }

        let value = run.result?;
        debug!(server = %server_name, tool = %tool_name, "Tool executed");
        tool_outcome(server_name, tool_name, value)
    }

    /// Tools of one server, or of every server merged. Per-server failures
    /// in the merged form become warnings.
    pub async fn list_tools(&self, server_name: Option<&str>) -> ConduitResult<ToolListing> {
        if let Some(name) = server_name {
            let server = self.server(name).await?;
            return self.tools_of(&server).await;
        }

        let mut servers: Vec<Arc<ManagedServer>> =
            self.servers.read().await.values().cloned().collect();
        servers.sort_by(|a, b| a.name().cmp(b.name()));

        let mut listing = ToolListing::default();
        for server in servers {
            match self.tools_of(&server).await {
                Ok(part) => {
                    listing.tools.extend(part.tools);
                    listing.warnings.extend(part.warnings);
                }
                Err(e) => listing
                    .warnings
                    .push(format!("tools of '{}' unavailable: {e}", server.name())),
            }
        }
        Ok(listing)
    }

    /// Mark the cached tools of `name` stale so the next listing refreshes.
    pub async fn invalidate_tools(&self, name: &str) -> ConduitResult<()> {
        self.server(name).await?.invalidate_tools();
        Ok(())
    }

    /// Statistics of every registered server, sorted by name.
    pub async fn get_connection_stats(&self) -> Vec<ConnectionStats> {
        let servers = self.servers.read().await;
        let mut stats: Vec<ConnectionStats> = servers
            .values()
            .map(|s| {
                let transport = s.link.read().as_ref().map(|l| l.transport.stats());
                ConnectionStats {
                    server: s.name().to_string(),
                    kind: s.descriptor.transport_kind,
                    state: s.state(),
                    session_id: self.sessions.get(s.name()).map(|session| session.session_id),
                    reconnect_count: s.reconnect_count(),
                    tool_count: s.tools.read().tools.len(),
                    tools_stale: s.tools_stale(),
                    connected_at: *s.connected_at.read(),
                    last_health_check: *s.last_health_check.read(),
                    transport,
                }
            })
            .collect();
        stats.sort_by(|a, b| a.server.cmp(&b.server));
        stats
    }

    /// Statistics of the most recent retried operation against `server`.
    pub fn get_retry_stats(&self, server: &str) -> Option<RetryStats> {
        self.retry_stats.read().get(server).cloned()
    }

    /// Ping one server. A failure marks it degraded and drops its transport
    /// so the next call reconnects.
    pub async fn health_check(&self, name: &str) -> ConduitResult<()> {
        let server = self.server(name).await?;
        *server.last_health_check.write() = Some(Utc::now());
        let Some(link) = server.live_link() else {
            return Err(ConduitError::Connection(format!("server '{name}' is not connected")));
        };
        let token = CancellationToken::new();
        match link.transport.request(methods::PING, None, &token).await {
            Ok(_) => {
                debug!(server = %name, "Health check passed");
                Ok(())
            }
            Err(e) => {
                warn!(server = %name, error = %e, "Health check failed");
                self.mark_failed(&server, &link, &e).await;
                Err(e)
            }
        }
    }

    /// Run a health check on every registered server.
    pub async fn health_check_all(&self) -> Vec<(String, ConduitResult<()>)> {
        let mut results = Vec::new();
        for name in self.server_names().await {
            let result = self.health_check(&name).await;
            results.push((name, result));
        }
        results
    }

    /// Check every server each `interval`, replacing any loop already
    /// running. The loop ends on its own once the handler is dropped.
    pub fn start_health_loop(self: &Arc<Self>, interval: Duration) {
        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            // The first tick completes immediately.
            timer.tick().await;
            loop {
                timer.tick().await;
                let Some(handler) = weak.upgrade() else {
                    break;
                };
                for (name, result) in handler.health_check_all().await {
                    if let Err(e) = result {
                        debug!(server = %name, error = %e, "Server unhealthy");
                    }
                }
            }
        });
        if let Some(previous) = self.health_loop.lock().replace(task) {
            previous.abort();
        }
        info!(interval_secs = interval.as_secs(), "Health loop started");
    }

    pub fn stop_health_loop(&self) {
        if let Some(task) = self.health_loop.lock().take() {
            task.abort();
            debug!("Health loop stopped");
        }
    }

    pub fn is_health_loop_running(&self) -> bool {
        self.health_loop.lock().as_ref().is_some_and(|t| !t.is_finished())
    }

    async fn server(&self, name: &str) -> ConduitResult<Arc<ManagedServer>> {
        self.servers
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| ConduitError::ServerNotFound(name.to_string()))
    }

    fn record_stats(&self, server: &str, stats: RetryStats) {
        self.retry_stats.write().insert(server.to_string(), stats);
    }

    /// Return the live transport, reconnecting under the server's reconnect
    /// lock when there is none. Concurrent callers queue on the lock and
    /// reuse whatever the first one established.
    async fn acquire(&self, server: &Arc<ManagedServer>, token: &CancellationToken) -> ConduitResult<Link> {
        if let Some(link) = server.live_link() {
            return Ok(link);
        }
        let _guard = tokio::select! {
            _ = token.cancelled() => return Err(ConduitError::Cancelled),
            guard = server.reconnect_lock.lock() => guard,
        };
        if let Some(link) = server.live_link() {
            return Ok(link);
        }
        if server.removed.load(Ordering::SeqCst) {
            return Err(ConduitError::ServerNotFound(server.name().to_string()));
        }
        if let Some(stale) = server.take_link() {
            stale.transport.disconnect().await;
        }
        match server.state() {
            ServerState::Connected => server.set_state(ServerState::Degraded),
            ServerState::Disconnected => server.set_state(ServerState::Connecting),
            _ => {}
        }
        self.establish(server, token).await
    }

    /// Open a fresh transport, negotiate, discover tools and publish the
    /// link. Callers hold the reconnect lock.
    async fn establish(&self, server: &Arc<ManagedServer>, token: &CancellationToken) -> ConduitResult<Link> {
        let name = server.name();
        let mut transport = TransportFactory::from_descriptor(&server.descriptor)?;
        let resume = self.sessions.resume_token(name);

        let handshake = match transport.connect(resume.as_deref(), token).await {
            Ok(handshake) => handshake,
            Err(e) => {
                if matches!(e, ConduitError::SessionExpired(_)) {
                    self.sessions.end(name);
                }
                return Err(e);
            }
        };
        let transport = Arc::new(transport);
        let events = transport.receive();

        let discovered = match discover_tools(name, &transport, token).await {
            Ok(discovered) => discovered,
            Err(e) if breaks_transport(&e) || e.kind() == ErrorKind::Timeout || e.is_cancelled() => {
                transport.disconnect().await;
                return Err(e);
            }
            Err(e) => {
                warn!(server = %name, error = %e, "Tool discovery failed");
                Discovered {
                    tools: Vec::new(),
                    warnings: vec![format!("tool discovery for '{name}' failed: {e}")],
                }
            }
        };

        let change = self
            .sessions
            .establish(name, &handshake.session_id, handshake.issued_by_server);
        if let SessionChange::Replaced { previous } = change {
            debug!(server = %name, previous = %previous, "Server issued a new session");
        }
        let tool_count = discovered.tools.len();
        server.store_tools(discovered);

        let generation = server.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let link = Link {
            transport: Arc::clone(&transport),
            generation,
        };
        let previous = server.link.write().replace(link.clone());
        if let Some(previous) = previous {
            previous.transport.disconnect().await;
        }
        match events {
            Ok(events) => server.watch(events, generation),
            Err(e) => warn!(server = %name, error = %e, "Inbound events unavailable"),
        }

        if server.removed.load(Ordering::SeqCst) {
            if let Some(link) = server.take_link_if(generation) {
                link.transport.disconnect().await;
            }
            return Err(ConduitError::ServerNotFound(name.to_string()));
        }

        let handshakes = server.handshakes.fetch_add(1, Ordering::SeqCst) + 1;
        *server.connected_at.write() = Some(Utc::now());
        server.set_state(ServerState::Connected);
        if handshakes > 1 {
            info!(server = %name, tools = tool_count, reconnects = handshakes - 1, "Server reconnected");
        } else {
            info!(server = %name, tools = tool_count, "Server connected");
        }
        Ok(link)
    }

    /// A call saw `err` on `link`: drop that transport so the next attempt
    /// reconnects. A newer transport installed meanwhile is left alone.
    async fn mark_failed(&self, server: &ManagedServer, link: &Link, err: &ConduitError) {
        if let Some(stale) = server.take_link_if(link.generation) {
            if matches!(err.root_cause(), ConduitError::SessionExpired(_)) {
                self.sessions.end(server.name());
            }
            warn!(server = %server.name(), error = %err, "Connection degraded");
            server.set_state(ServerState::Degraded);
            stale.transport.disconnect().await;
        }
    }

    /// Retries ran out: the server is unreachable until the next call.
    async fn give_up(&self, server: &ManagedServer) {
        if let Some(link) = server.take_link() {
            link.transport.disconnect().await;
        }
        server.set_state(ServerState::Disconnected);
    }

    async fn ensure_tool(
        &self,
        server: &Arc<ManagedServer>,
        tool: &str,
        token: &CancellationToken,
    ) -> ConduitResult<()> {
        if server.tools_stale() {
            if let Err(e) = self.refresh_tools(server, token, false).await {
                if e.is_cancelled() || server.tools.read().tools.is_empty() {
                    return Err(e);
                }
                warn!(server = %server.name(), error = %e, "Validating against cached tools");
            }
        }
        if server.has_tool(tool) {
            Ok(())
        } else {
            Err(ConduitError::ToolNotFound {
                server: server.name().to_string(),
                tool: tool.to_string(),
            })
        }
    }

    async fn tools_of(&self, server: &Arc<ManagedServer>) -> ConduitResult<ToolListing> {
        let needs_refresh = {
            let cache = server.tools.read();
            cache.stale || cache.tools.is_empty()
        };
        if needs_refresh {
            let token = CancellationToken::new();
            if let Err(e) = self.refresh_tools(server, &token, true).await {
                let mut listing = server.listing();
                if listing.tools.is_empty() {
                    return Err(e);
                }
                listing
                    .warnings
                    .push(format!("serving cached tools of '{}': {e}", server.name()));
                return Ok(listing);
            }
        }
        Ok(server.listing())
    }

    /// Re-run tool discovery under the retry policy. Without `force`, a
    /// refresh already done by a reconnect is not repeated.
    async fn refresh_tools(
        &self,
        server: &Arc<ManagedServer>,
        token: &CancellationToken,
        force: bool,
    ) -> ConduitResult<()> {
        let run = with_retry(&self.retry, token, methods::TOOLS_LIST, |attempt| {
            let server = Arc::clone(server);
            let token = token.clone();
            async move {
                let link = self.acquire(&server, &token).await?;
                if !server.tools_stale() && !(force && attempt == 0) {
                    return Ok(None);
                }
                match discover_tools(server.name(), &link.transport, &token).await {
                    Ok(discovered) => Ok(Some(discovered)),
                    Err(e) => {
                        if breaks_transport(&e) {
                            self.mark_failed(&server, &link, &e).await;
                        }
                        Err(e)
                    }
                }
            }
        })
        .await;
        self.record_stats(server.name(), run.stats);
        if let Some(discovered) = run.result? {
            server.store_tools(discovered);
        }
        Ok(())
    }
}

impl Default for CapabilityHandler {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

/// Follow `tools/list` pagination. A failure after the first page yields
/// the partial set plus a warning.
async fn discover_tools(
    server: &str,
    transport: &Transport,
    token: &CancellationToken,
) -> ConduitResult<Discovered> {
    let mut tools = Vec::new();
    let mut warnings = Vec::new();
    let mut cursor: Option<String> = None;
    let mut seen = HashSet::new();

    for _ in 0..MAX_TOOL_PAGES {
        let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
        let page = transport
            .request(methods::TOOLS_LIST, params, token)
            .await
            .and_then(|value| {
                serde_json::from_value::<ToolsPage>(value).map_err(|e| {
                    ConduitError::Protocol(format!("invalid tools/list result from '{server}': {e}"))
                })
            });
        let page = match page {
            Ok(page) => page,
            Err(e) if cursor.is_none() || e.is_cancelled() => return Err(e),
            Err(e) => {
                warn!(server, error = %e, tools = tools.len(), "Tool listing incomplete");
                warnings.push(format!("tool listing of '{server}' is incomplete: {e}"));
                return Ok(Discovered { tools, warnings });
            }
        };

        tools.extend(page.tools.into_iter().map(|def| ToolDescriptor::from_def(def, server)));
        match page.next_cursor {
            Some(next) if !next.is_empty() => {
                if !seen.insert(next.clone()) {
                    warnings.push(format!("server '{server}' repeated cursor '{next}'"));
                    return Ok(Discovered { tools, warnings });
                }
                cursor = Some(next);
            }
            _ => {
                debug!(server, tools = tools.len(), "Tools discovered");
                return Ok(Discovered { tools, warnings });
            }
        }
    }

    warnings.push(format!(
        "tool listing of '{server}' stopped after {MAX_TOOL_PAGES} pages"
    ));
    Ok(Discovered { tools, warnings })
}

/// Surface `isError` results as failures; pass everything else through.
fn tool_outcome(server: &str, tool: &str, value: Value) -> ConduitResult<Value> {
    let flagged = value
        .get("isError")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if !flagged {
        return Ok(value);
    }
    let text = serde_json::from_value::<McpToolResult>(value)
        .map(|r| r.text())
        .unwrap_or_default();
    let detail = if text.is_empty() {
        "tool reported an error".to_string()
    } else {
        text
    };
    Err(ConduitError::ToolExecution(format!(
        "'{tool}' on '{server}' failed: {detail}"
    )))
}
