//! Stdio transport: spawn a child process and speak JSON-RPC over stdin/stdout.

use std::{
    collections::{BTreeMap, HashMap},
    path::Path,
    process::Stdio,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    tokio::{
        io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
        process::{Child, ChildStdin, Command},
        sync::{Mutex, oneshot},
    },
    tracing::{debug, info, trace, warn},
};

use crate::{
    error::{Context, Error, McpTransportError, Result},
    traits::McpTransport,
    types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse},
};

/// How long a child gets to exit after stdin is closed.
pub const GRACEFUL_EXIT_TIMEOUT: Duration = Duration::from_secs(2);
/// How long a child gets to exit after SIGINT before it is killed.
pub const INTERRUPT_EXIT_TIMEOUT: Duration = Duration::from_secs(2);

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<JsonRpcResponse>>>>;

/// Everything needed to start a local upstream process.
#[derive(Debug, Clone, Copy)]
pub struct SpawnSpec<'a> {
    pub command: &'a str,
    pub args: &'a [String],
    pub cwd: Option<&'a Path>,
    pub env: &'a BTreeMap<String, String>,
}

/// Timeouts for the close-stdin / interrupt / kill sequence.
#[derive(Debug, Clone, Copy)]
pub struct TerminationTimeouts {
    pub graceful: Duration,
    pub interrupt: Duration,
}

impl Default for TerminationTimeouts {
    fn default() -> Self {
        Self {
            graceful: GRACEFUL_EXIT_TIMEOUT,
            interrupt: INTERRUPT_EXIT_TIMEOUT,
        }
    }
}

/// Stdio-based transport for an upstream server process.
pub struct StdioTransport {
    child: Mutex<Child>,
    /// Taken (and thereby closed) when the transport is shut down.
    stdin: Mutex<Option<ChildStdin>>,
    pending: PendingMap,
    next_id: AtomicU64,
    closed: Arc<AtomicBool>,
    request_timeout: Duration,
    termination: TerminationTimeouts,
    /// Handle to the reader task so we can abort on shutdown.
    reader_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl StdioTransport {
    /// Spawn the server process and start the reader loop.
    pub async fn spawn(spec: SpawnSpec<'_>, request_timeout: Duration) -> Result<Arc<Self>> {
        Self::spawn_with_termination(spec, request_timeout, TerminationTimeouts::default()).await
    }

    pub async fn spawn_with_termination(
        spec: SpawnSpec<'_>,
        request_timeout: Duration,
        termination: TerminationTimeouts,
    ) -> Result<Arc<Self>> {
        info!(
            command = %spec.command,
            args = ?spec.args,
            "spawning upstream process"
        );

        let mut cmd = Command::new(spec.command);
        cmd.args(spec.args)
            .envs(spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = spec.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(|e| {
            Error::external(format!("failed to spawn upstream: {}", spec.command), e)
        })?;

        let stdin = child.stdin.take().context("failed to capture stdin")?;
        let stdout = child.stdout.take().context("failed to capture stdout")?;
        let stderr = child.stderr.take();

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let transport = Arc::new(Self {
            child: Mutex::new(child),
            stdin: Mutex::new(Some(stdin)),
            pending: Arc::clone(&pending),
            next_id: AtomicU64::new(1),
            closed: Arc::clone(&closed),
            request_timeout,
            termination,
            reader_handle: Mutex::new(None),
        });

        if let Some(stderr) = stderr {
            let command = spec.command.to_string();
            tokio::spawn(async move {
                let mut reader = BufReader::new(stderr);
                let mut line = String::new();
                loop {
                    line.clear();
                    match reader.read_line(&mut line).await {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {
                            let trimmed = line.trim();
                            if !trimmed.is_empty() {
                                debug!(command = %command, stderr = %trimmed, "upstream stderr");
                            }
                        },
                    }
                }
            });
        }

        let handle = tokio::spawn(async move {
            let mut reader = BufReader::new(stdout);
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => {
                        debug!("upstream stdout closed");
                        break;
                    },
                    Ok(_) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        trace!(raw = %trimmed, "upstream -> bundler");
                        dispatch_line(&pending, trimmed).await;
                    },
                    Err(e) => {
                        warn!(error = %e, "error reading from upstream stdout");
                        break;
                    },
                }
            }
            closed.store(true, Ordering::SeqCst);
            // Dropping the senders wakes every waiter with a closed-channel error.
            pending.lock().await.clear();
        });

        *transport.reader_handle.lock().await = Some(handle);
        Ok(transport)
    }

    async fn write_line(&self, payload: &str, method: &str) -> Result<()> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or_else(|| McpTransportError::Closed {
            reason: format!("stdin closed before '{method}'"),
        })?;
        let write = async {
            stdin.write_all(payload.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        };
        write.await.map_err(|e| McpTransportError::Closed {
            reason: format!("write for '{method}' failed: {e}"),
        })?;
        Ok(())
    }
}

async fn dispatch_line(pending: &PendingMap, line: &str) {
    let value: serde_json::Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            debug!(error = %e, line = %line, "upstream sent non-JSON line");
            return;
        },
    };

    // Requests and notifications from the upstream carry a method.
    if value.get("method").is_some() {
        debug!(
            method = ?value.get("method").and_then(|m| m.as_str()),
            "ignoring upstream-initiated message"
        );
        return;
    }

    match serde_json::from_value::<JsonRpcResponse>(value) {
        Ok(resp) => {
            let key = resp.id.to_string();
            if let Some(tx) = pending.lock().await.remove(&key) {
                let _ = tx.send(resp);
            } else {
                warn!(id = %key, "received response for unknown request id");
            }
        },
        Err(e) => debug!(error = %e, "upstream sent malformed response"),
    }
}

/// Wait for the child to exit, up to `timeout`.
async fn wait_exit(child: &mut Child, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => {
            debug!(?status, "upstream process exited");
            true
        },
        Ok(Err(e)) => {
            warn!(error = %e, "error waiting for upstream process");
            true
        },
        Err(_) => false,
    }
}

/// Close-stdin wait, then SIGINT and wait, then kill.
async fn terminate_child(child: &mut Child, timeouts: TerminationTimeouts) {
    if wait_exit(child, timeouts.graceful).await {
        return;
    }

    #[cfg(unix)]
    {
        use nix::{
            sys::signal::{Signal, kill},
            unistd::Pid,
        };

        if let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) {
            info!(pid, "upstream did not exit after stdin closed, sending SIGINT");
            let _ = kill(Pid::from_raw(pid), Signal::SIGINT);
            if wait_exit(child, timeouts.interrupt).await {
                return;
            }
        }
    }

    warn!("upstream process did not exit gracefully, killing");
    if let Err(e) = child.kill().await {
        debug!(error = %e, "kill failed, process already gone");
    }
}

#[async_trait::async_trait]
impl McpTransport for StdioTransport {
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(McpTransportError::Closed {
                reason: "upstream process exited".into(),
            }
            .into());
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let req = JsonRpcRequest::new(id, method, params);
        let id_key = req.id.to_string();

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id_key.clone(), tx);

        let payload = serde_json::to_string(&req)?;
        debug!(method = %method, id = %id, "bundler -> upstream");

        if let Err(e) = self.write_line(&payload, method).await {
            self.pending.lock().await.remove(&id_key);
            return Err(e);
        }

        let resp = match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(_)) => {
                return Err(McpTransportError::Closed {
                    reason: format!("upstream exited while waiting for '{method}'"),
                }
                .into());
            },
            Err(_) => {
                self.pending.lock().await.remove(&id_key);
                return Err(McpTransportError::Timeout {
                    method: method.to_string(),
                    secs: self.request_timeout.as_secs(),
                }
                .into());
            },
        };

        if let Some(ref err) = resp.error {
            return Err(McpTransportError::Rpc {
                method: method.to_string(),
                code: err.code,
                message: err.message.clone(),
            }
            .into());
        }

        Ok(resp)
    }

    async fn notify(&self, method: &str, params: Option<serde_json::Value>) -> Result<()> {
        let notif = JsonRpcNotification::new(method, params);
        let payload = serde_json::to_string(&notif)?;
        trace!(method = %method, "bundler -> upstream (notification)");
        self.write_line(&payload, method).await
    }

    async fn is_alive(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        let mut child = self.child.lock().await;
        matches!(child.try_wait(), Ok(None))
    }

    async fn kill(&self) {
        if let Some(handle) = self.reader_handle.lock().await.take() {
            handle.abort();
        }
        self.closed.store(true, Ordering::SeqCst);
        self.pending.lock().await.clear();
        // Closing stdin asks a well-behaved server to exit on its own.
        drop(self.stdin.lock().await.take());
        let mut child = self.child.lock().await;
        terminate_child(&mut child, self.termination).await;
    }
}
