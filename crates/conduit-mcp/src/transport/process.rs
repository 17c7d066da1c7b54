//! Child-process transport: newline-delimited JSON-RPC over stdin/stdout.

use super::inflight::Inflight;
use crate::protocol::JsonRpcMessage;
use conduit_core::{ConduitError, ConduitResult};
use parking_lot::Mutex as SyncMutex;
use std::collections::HashMap;
use std::io::ErrorKind as IoErrorKind;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStderr, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

type SharedStdin = Arc<Mutex<Option<ChildStdin>>>;

/// Owns the child. A child still running when the guard drops is killed.
struct ChildGuard {
    child: Child,
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.start_kill();
        }
    }
}

pub struct ProcessTransport {
    server: String,
    program: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    shutdown_grace: Duration,
    child: Mutex<Option<ChildGuard>>,
    stdin: SharedStdin,
    inflight: Option<Arc<Inflight>>,
    tasks: SyncMutex<Vec<JoinHandle<()>>>,
    pid: Option<u32>,
    session_id: Option<String>,
}

impl ProcessTransport {
    pub(crate) fn new(
        server: &str,
        program: String,
        args: Vec<String>,
        env: HashMap<String, String>,
        shutdown_grace: Duration,
    ) -> Self {
        Self {
            server: server.to_string(),
            program,
            args,
            env,
            shutdown_grace,
            child: Mutex::new(None),
            stdin: Arc::new(Mutex::new(None)),
            inflight: None,
            tasks: SyncMutex::new(Vec::new()),
            pid: None,
            session_id: None,
        }
    }

    /// Spawn the server process and start the reader tasks.
    pub(crate) async fn open(&mut self) -> ConduitResult<()> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(&self.env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            IoErrorKind::NotFound | IoErrorKind::PermissionDenied => ConduitError::Configuration(
                format!("cannot start server '{}' ({}): {e}", self.server, self.program),
            ),
            _ => ConduitError::Connection(format!(
                "failed to spawn server '{}' ({}): {e}",
                self.server, self.program
            )),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            ConduitError::Connection(format!("server '{}' stdin not available", self.server))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            ConduitError::Connection(format!("server '{}' stdout not available", self.server))
        })?;
        let stderr = child.stderr.take();

        let inflight = Inflight::new(&self.server);
        *self.stdin.lock().await = Some(stdin);
        self.pid = child.id();

        let mut tasks = vec![tokio::spawn(read_stdout(
            self.server.clone(),
            stdout,
            Arc::clone(&inflight),
            Arc::clone(&self.stdin),
        ))];
        if let Some(stderr) = stderr {
            tasks.push(tokio::spawn(forward_stderr(self.server.clone(), stderr)));
        }
        *self.tasks.lock() = tasks;
        *self.child.lock().await = Some(ChildGuard { child });

        // Stdio servers hand out no session token; one is minted per process.
        self.session_id = Some(uuid::Uuid::new_v4().to_string());
        self.inflight = Some(inflight);

        info!(server = %self.server, pid = ?self.pid, command = %self.program, "Server process started");
        Ok(())
    }

    pub(crate) async fn send(&self, message: &JsonRpcMessage) -> ConduitResult<()> {
        let frame = message.encode()?;
        write_frame(&self.server, &self.stdin, &frame).await?;
        if let Some(inflight) = &self.inflight {
            inflight.record_sent();
        }
        Ok(())
    }

    /// Close stdin, give the child `shutdown_grace` to exit, then kill it.
    pub(crate) async fn disconnect(&self) {
        if let Some(inflight) = &self.inflight {
            inflight.close(ConduitError::Connection(format!(
                "transport to '{}' disconnected",
                self.server
            )));
        }
        self.stdin.lock().await.take();

        let guard = self.child.lock().await.take();
        if let Some(mut guard) = guard {
            match tokio::time::timeout(self.shutdown_grace, guard.child.wait()).await {
                Ok(Ok(status)) => {
                    debug!(server = %self.server, status = %status, "Server process exited");
                }
                Ok(Err(e)) => {
                    warn!(server = %self.server, error = %e, "Failed to wait for server process");
                }
                Err(_) => {
                    warn!(server = %self.server, "Server process ignored shutdown, killing");
                    if let Err(e) = guard.child.kill().await {
                        error!(server = %self.server, error = %e, "Failed to kill server process");
                    }
                }
            }
        }

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    pub(crate) fn inflight(&self) -> Option<&Arc<Inflight>> {
        self.inflight.as_ref()
    }

    pub(crate) fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub(crate) fn session_id(&self) -> Option<String> {
        self.session_id.clone()
    }
}

async fn write_frame(server: &str, stdin: &Mutex<Option<ChildStdin>>, frame: &str) -> ConduitResult<()> {
    let mut guard = stdin.lock().await;
    let stdin = guard.as_mut().ok_or_else(|| {
        ConduitError::Connection(format!("transport to '{server}' is closed"))
    })?;
    let write_err = |e: std::io::Error| {
        ConduitError::Connection(format!("failed to write to server '{server}': {e}"))
    };
    stdin.write_all(frame.as_bytes()).await.map_err(write_err)?;
    stdin.write_all(b"\n").await.map_err(write_err)?;
    stdin.flush().await.map_err(write_err)?;
    Ok(())
}

async fn read_stdout(
    server: String,
    stdout: ChildStdout,
    inflight: Arc<Inflight>,
    stdin: SharedStdin,
) {
    let mut reader = BufReader::new(stdout);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => {
                debug!(server = %server, "Server stdout closed");
                break;
            }
            Ok(_) => {
                let frame = line.trim_ascii();
                if frame.is_empty() {
                    continue;
                }
                // Undecodable lines are reported but never end the stream.
                let value = match serde_json::from_slice::<serde_json::Value>(frame) {
                    Ok(value) => value,
                    Err(e) => {
                        debug!(server = %server, line = %String::from_utf8_lossy(frame), "Undecodable stdout line");
                        inflight.violation(format!("undecodable line from '{server}': {e}"));
                        continue;
                    }
                };
                match JsonRpcMessage::from_value(value.clone()) {
                    Ok(message) => {
                        if let Some(reply) = inflight.route(message) {
                            let sent = match reply.encode() {
                                Ok(frame) => write_frame(&server, &stdin, &frame).await,
                                Err(e) => Err(e),
                            };
                            if let Err(e) = sent {
                                warn!(server = %server, error = %e, "Failed to answer server request");
                            }
                        }
                    }
                    Err(e) => inflight.malformed(&value, e),
                }
            }
            Err(e) => {
                error!(server = %server, error = %e, "Error reading server stdout");
                break;
            }
        }
    }
    inflight.close(ConduitError::Connection(format!(
        "server process '{server}' exited"
    )));
}

async fn forward_stderr(server: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(server = %server, stderr = %line, "Server stderr");
    }
}
