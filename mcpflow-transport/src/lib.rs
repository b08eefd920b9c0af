//! ABOUTME: JSON-RPC-over-stdio transport for a single MCP server child process
//! ABOUTME: framing, request correlation, timeouts, and graceful teardown

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use mcpflow_core::{RetryDecision, Value};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// `tools/list`: lists the tools a server exposes.
pub const METHOD_TOOLS_LIST: &str = "tools/list";
/// `tools/call`: invokes a named tool.
pub const METHOD_TOOLS_CALL: &str = "tools/call";

const STARTUP_SETTLE: Duration = Duration::from_millis(100);
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);
const STDERR_DRAIN_BYTES: usize = 1024;
const LOG_TRUNCATE_THRESHOLD: usize = 500;
const LOG_TRUNCATE_HEAD_TAIL: usize = 250;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors raised while starting or driving a [`Transport`].
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("server process exited during startup: {stderr}")]
    StartFailed { stderr: String },
    #[error("timed out after {0:?} waiting for a response")]
    Timeout(Duration),
    #[error("malformed response frame: {0}")]
    Protocol(String),
    #[error("tool error: {message}")]
    Tool { message: String },
    #[error("transport is closed")]
    Closed,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Default retry classifier for [`mcpflow_core::with_retry`]: transport-level
/// failures are retryable, protocol-level tool errors are not.
#[must_use]
pub fn classify(error: &TransportError) -> RetryDecision {
    match error {
        TransportError::Tool { .. } | TransportError::Closed => RetryDecision::Stop,
        TransportError::Spawn { .. }
        | TransportError::StartFailed { .. }
        | TransportError::Timeout(_)
        | TransportError::Protocol(_)
        | TransportError::Io(_) => RetryDecision::Retry,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Init,
    Ready,
    Closed,
}

struct Inner {
    state: State,
    child: Option<Child>,
    stdin: Option<BufWriter<ChildStdin>>,
    stdout: Option<BufReader<ChildStdout>>,
    stderr: Option<ChildStderr>,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            state: State::Init,
            child: None,
            stdin: None,
            stdout: None,
            stderr: None,
        }
    }
}

/// Owns one MCP server child process and frames newline-delimited JSON-RPC
/// requests/responses over its stdio. A single transport serves requests
/// strictly sequentially: [`Transport::send_request`] holds an internal lock
/// across the full write-then-read round trip, so two concurrent callers
/// never interleave frames on the same pipe.
pub struct Transport {
    server_name: String,
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    inner: Mutex<Inner>,
    next_id: AtomicU64,
}

impl Transport {
    #[must_use]
    pub fn new(server_name: impl Into<String>, command: impl Into<String>, args: Vec<String>, env: HashMap<String, String>) -> Self {
        Self {
            server_name: server_name.into(),
            command: command.into(),
            args,
            env,
            inner: Mutex::new(Inner::default()),
            next_id: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Spawns the child process and waits briefly for it to come up. If the
    /// process has already exited by the time we check, drains stderr for
    /// diagnostics and fails with [`TransportError::StartFailed`].
    pub async fn start(&self) -> Result<(), TransportError> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TransportError::Spawn {
                command: self.command.clone(),
                source,
            })?;

        tokio::time::sleep(STARTUP_SETTLE).await;

        if let Ok(Some(_status)) = child.try_wait() {
            let stderr_text = match child.stderr.take() {
                Some(mut stderr) => drain_stderr(&mut stderr).await,
                None => String::new(),
            };
            return Err(TransportError::StartFailed { stderr: stderr_text });
        }

        let stdin = child.stdin.take().ok_or_else(|| TransportError::StartFailed {
            stderr: "child process has no stdin handle".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| TransportError::StartFailed {
            stderr: "child process has no stdout handle".to_string(),
        })?;
        let stderr = child.stderr.take();

        let mut inner = self.inner.lock().await;
        inner.child = Some(child);
        inner.stdin = Some(BufWriter::new(stdin));
        inner.stdout = Some(BufReader::new(stdout));
        inner.stderr = stderr;
        inner.state = State::Ready;

        debug!(server = %self.server_name, "transport started");
        Ok(())
    }

    /// Sends one JSON-RPC request and awaits its correlated response.
    pub async fn send_request(&self, method: &str, params: Value, timeout: Option<Duration>) -> Result<Value, TransportError> {
        let timeout = timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT);
        let mut inner = self.inner.lock().await;

        if inner.state != State::Ready {
            return Err(TransportError::Closed);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = json!({
            "jsonrpc": "2.0",
            "id": id.to_string(),
            "method": method,
            "params": params,
        });
        let mut line = serde_json::to_string(&request).map_err(|e| TransportError::Protocol(e.to_string()))?;
        line.push('\n');

        debug!(server = %self.server_name, method, %line, "sending request");

        let stdin = inner.stdin.as_mut().ok_or(TransportError::Closed)?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;

        let stdout = inner.stdout.as_mut().ok_or(TransportError::Closed)?;
        let mut response_line = String::new();
        let read_result = tokio::time::timeout(timeout, stdout.read_line(&mut response_line)).await;

        let bytes_read = match read_result {
            Ok(Ok(n)) => n,
            Ok(Err(io_err)) => return Err(TransportError::Io(io_err)),
            Err(_) => return Err(TransportError::Timeout(timeout)),
        };

        if bytes_read == 0 {
            let stderr_tail = drain_inner_stderr(&mut inner).await;
            return Err(TransportError::Protocol(format!("server closed stdout; stderr: {stderr_tail}")));
        }

        log_response(&self.server_name, &response_line);

        let response: serde_json::Value = serde_json::from_str(response_line.trim()).map_err(|parse_err| {
            TransportError::Protocol(format!("invalid JSON response: {parse_err}"))
        })?;

        if let Some(error) = response.get("error") {
            let message = error
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown error")
                .to_string();
            let stderr_tail = drain_inner_stderr(&mut inner).await;
            let full_message = if stderr_tail.is_empty() {
                message
            } else {
                format!("{message}\nstderr: {stderr_tail}")
            };
            return Err(TransportError::Tool { message: full_message });
        }

        Ok(response.get("result").cloned().unwrap_or_else(|| json!({})))
    }

    /// Best-effort graceful termination. Idempotent: calling `close` on an
    /// already-closed transport is a no-op.
    pub async fn close(&self) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().await;
        if inner.state == State::Closed {
            return Ok(());
        }
        inner.stdin = None; // closes the pipe, often a sufficient shutdown signal
        if let Some(mut child) = inner.child.take() {
            match tokio::time::timeout(GRACEFUL_SHUTDOWN_TIMEOUT, child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    warn!(server = %self.server_name, "graceful shutdown timed out, killing child");
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                }
            }
        }
        inner.stdout = None;
        inner.stderr = None;
        inner.state = State::Closed;
        debug!(server = %self.server_name, "transport closed");
        Ok(())
    }
}

async fn drain_inner_stderr(inner: &mut Inner) -> String {
    match inner.stderr.as_mut() {
        Some(stderr) => drain_stderr(stderr).await,
        None => String::new(),
    }
}

async fn drain_stderr(stderr: &mut ChildStderr) -> String {
    let mut buf = vec![0u8; STDERR_DRAIN_BYTES];
    match tokio::time::timeout(STDERR_DRAIN_TIMEOUT, stderr.read(&mut buf)).await {
        Ok(Ok(n)) if n > 0 => String::from_utf8_lossy(&buf[..n]).to_string(),
        _ => String::new(),
    }
}

/// Largest byte index `<= max` that lands on a char boundary of `s`.
fn floor_char_boundary(s: &str, max: usize) -> usize {
    if max >= s.len() {
        return s.len();
    }
    let mut idx = max;
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

/// Smallest byte index `>= min` that lands on a char boundary of `s`.
fn ceil_char_boundary(s: &str, min: usize) -> usize {
    let mut idx = min.min(s.len());
    while idx < s.len() && !s.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}

fn log_response(server_name: &str, raw: &str) {
    let trimmed = raw.trim_end();
    if trimmed.len() > LOG_TRUNCATE_THRESHOLD {
        let head_end = floor_char_boundary(trimmed, LOG_TRUNCATE_HEAD_TAIL);
        let tail_start = ceil_char_boundary(trimmed, trimmed.len() - LOG_TRUNCATE_HEAD_TAIL);
        let head = &trimmed[..head_end];
        let tail = &trimmed[tail_start..];
        debug!(server = server_name, "received response: {head}...[TRUNCATED]...{tail}");
    } else {
        debug!(server = server_name, response = trimmed, "received response");
    }
}
