//! ABOUTME: Scoped MCP session acquisition with guaranteed teardown
//! ABOUTME: tool discovery, tool invocation, and health checks

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use mcpflow_config::{ConfigError, ServerRegistry};
use mcpflow_core::{with_retry, ErrorClassifier, RetryDecision, RetryError, RetryPolicy, Value};
use mcpflow_transport::{Transport, TransportError, METHOD_TOOLS_CALL, METHOD_TOOLS_LIST};
use parking_lot::RwLock;
use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

/// Errors raised by [`SessionManager`] operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("server '{server}' has no command to launch (url-based servers are not executable by this transport)")]
    NotExecutable { server: String },
    #[error("tool '{tool}' not found on server '{server}'; available: {available:?}")]
    ToolNotFound {
        server: String,
        tool: String,
        available: Vec<String>,
    },
    #[error("tool result for '{tool}' on server '{server}' is not serializable")]
    NonSerializableResult { server: String, tool: String },
}

/// Retry classifier for [`SessionManager::call_tool_with_retry`]: transport
/// failures delegate to the transport's own classification; everything else
/// (tool-not-found, non-serializable results, config errors) is terminal.
pub struct SessionErrorClassifier;

impl ErrorClassifier<SessionError> for SessionErrorClassifier {
    fn classify(&self, error: &SessionError) -> RetryDecision {
        match error {
            SessionError::Transport(inner) => mcpflow_transport::classify(inner),
            SessionError::Config(_) | SessionError::NotExecutable { .. } | SessionError::ToolNotFound { .. } | SessionError::NonSerializableResult { .. } => {
                RetryDecision::Stop
            }
        }
    }
}

/// Opaque, non-serializable handle to one scoped MCP session. Must never be
/// stored in a [`mcpflow_context::WorkflowContext`] or a workflow result;
/// its only legal use is within the body passed to
/// [`SessionManager::scoped_session`].
pub struct SessionHandle {
    id: Uuid,
    server_name: String,
    transport: Arc<Transport>,
}

impl SessionHandle {
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn server_name(&self) -> &str {
        &self.server_name
    }
}

/// Lightweight, persistable record of a session's lifecycle, kept only for
/// observability. This is the only state the session manager retains across
/// scoped acquisitions.
#[derive(Debug, Clone)]
pub struct SessionMeta {
    pub id: Uuid,
    pub server_name: String,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
}

/// Acquires scoped MCP sessions against a [`ServerRegistry`], guaranteeing
/// transport teardown on every exit path of the scope, and provides tool
/// discovery/invocation with retry on top.
pub struct SessionManager {
    registry: Arc<ServerRegistry>,
    sessions: RwLock<HashMap<Uuid, SessionMeta>>,
}

impl SessionManager {
    #[must_use]
    pub fn new(registry: Arc<ServerRegistry>) -> Self {
        Self {
            registry,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Runs `body` with a freshly acquired [`SessionHandle`] for `server_name`.
    /// The transport is started before `body` runs and closed after it
    /// returns, whether `body` succeeded, failed, or panicked (the closure's
    /// own `Drop`/unwind semantics aside, `close` is always awaited on the
    /// synchronous-return paths).
    pub async fn scoped_session<F, Fut, T>(&self, server_name: &str, body: F) -> Result<T, SessionError>
    where
        F: FnOnce(SessionHandle) -> Fut,
        Fut: Future<Output = Result<T, SessionError>>,
    {
        let descriptor = self.registry.get_descriptor(server_name)?;
        let argv = descriptor.argv().ok_or_else(|| SessionError::NotExecutable {
            server: server_name.to_string(),
        })?;
        let env = self.registry.resolve_launch_env(server_name)?;

        let command = argv[0].clone();
        let args = argv[1..].to_vec();
        let transport = Arc::new(Transport::new(server_name, command, args, env));
        transport.start().await?;

        let id = Uuid::new_v4();
        let now = Utc::now();
        self.sessions.write().insert(
            id,
            SessionMeta {
                id,
                server_name: server_name.to_string(),
                created_at: now,
                last_used: now,
            },
        );

        let handle = SessionHandle {
            id,
            server_name: server_name.to_string(),
            transport: transport.clone(),
        };

        debug!(server = server_name, session = %id, "scoped session acquired");
        let result = body(handle).await;

        if let Err(close_err) = transport.close().await {
            warn!(server = server_name, session = %id, error = %close_err, "error closing transport on scope exit");
        }
        self.sessions.write().remove(&id);
        debug!(server = server_name, session = %id, "scoped session released");

        result
    }

    pub async fn list_tools(&self, handle: &SessionHandle) -> Result<Vec<String>, SessionError> {
        let response = handle.transport.send_request(METHOD_TOOLS_LIST, json!({}), None).await?;
        let names = response
            .get("tools")
            .and_then(Value::as_array)
            .map(|tools| {
                tools
                    .iter()
                    .filter_map(|t| t.get("name").and_then(Value::as_str).map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        Ok(names)
    }

    pub async fn call_tool(&self, handle: &SessionHandle, tool_name: &str, args: Value, timeout: Option<Duration>) -> Result<Value, SessionError> {
        let available = self.list_tools(handle).await?;
        if !available.iter().any(|t| t == tool_name) {
            return Err(SessionError::ToolNotFound {
                server: handle.server_name.clone(),
                tool: tool_name.to_string(),
                available,
            });
        }

        let result = handle
            .transport
            .send_request(METHOD_TOOLS_CALL, json!({"name": tool_name, "arguments": args}), timeout)
            .await?;

        if !mcpflow_core::serializable::probe(&result) {
            return Err(SessionError::NonSerializableResult {
                server: handle.server_name.clone(),
                tool: tool_name.to_string(),
            });
        }

        self.sessions.write().entry(handle.id).and_modify(|m| m.last_used = Utc::now());
        Ok(result)
    }

    /// Opens a fresh scoped session per attempt and applies the retry
    /// primitive with the transport-error classifier, so a broken process
    /// never poisons subsequent tries.
    pub async fn call_tool_with_retry(&self, server_name: &str, tool_name: &str, args: Value, policy: RetryPolicy, timeout: Option<Duration>) -> Result<Value, RetryError<SessionError>> {
        let classifier = SessionErrorClassifier;
        with_retry(&policy, &classifier, move || {
            let args = args.clone();
            async move {
                self.scoped_session(server_name, |handle| async move { self.call_tool(&handle, tool_name, args, timeout).await })
                    .await
            }
        })
        .await
    }

    /// Opens a scoped session and lists tools; healthy iff at least one tool
    /// is returned.
    pub async fn health_check_one(&self, server_name: &str) -> bool {
        self.scoped_session(server_name, |handle| async move { self.list_tools(&handle).await })
            .await
            .map(|tools| !tools.is_empty())
            .unwrap_or(false)
    }

    /// Runs [`SessionManager::health_check_one`] over every registered server.
    pub async fn health_check_all(&self) -> HashMap<String, bool> {
        let mut results = HashMap::new();
        for name in self.registry.list_servers() {
            let healthy = self.health_check_one(name).await;
            results.insert(name.to_string(), healthy);
        }
        results
    }

    #[must_use]
    pub fn session_metadata(&self) -> Vec<SessionMeta> {
        self.sessions.read().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn echo_server_registry(script_path: &std::path::Path) -> ServerRegistry {
        let doc = format!(
            r#"{{"mcpServers": {{"echo": {{"command": "python3", "args": ["{}"]}}}}}}"#,
            script_path.to_string_lossy().replace('\\', "\\\\")
        );
        ServerRegistry::parse(&doc, "test.json").unwrap()
    }

    fn echo_server_path() -> std::path::PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("mcpflow_session_echo_{}.py", std::process::id()));
        let script = r#"
import sys, json
for line in sys.stdin:
    line = line.strip()
    if not line:
        continue
    req = json.loads(line)
    method = req.get("method")
    if method == "tools/list":
        result = {"tools": [{"name": "ping"}]}
    elif method == "tools/call":
        result = {"pong": True}
    else:
        result = {}
    sys.stdout.write(json.dumps({"jsonrpc":"2.0","id":req["id"],"result":result}) + "\n")
    sys.stdout.flush()
"#;
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(script.as_bytes()).unwrap();
        path
    }

    fn python_available() -> bool {
        which::which("python3").is_ok()
    }

    #[tokio::test]
    async fn scoped_session_lists_and_calls_tools() {
        if !python_available() {
            eprintln!("skipping: python3 not found");
            return;
        }
        let script = echo_server_path();
        let registry = Arc::new(echo_server_registry(&script));
        let manager = SessionManager::new(registry);
        let manager_ref = &manager;

        let result = manager_ref
            .scoped_session("echo", |handle| async move {
                let tools = manager_ref.list_tools(&handle).await?;
                assert_eq!(tools, vec!["ping".to_string()]);
                Ok(())
            })
            .await;

        assert!(result.is_ok());
        assert!(manager.session_metadata().is_empty());
        let _ = std::fs::remove_file(script);
    }

    #[tokio::test]
    async fn call_tool_with_retry_succeeds() {
        if !python_available() {
            eprintln!("skipping: python3 not found");
            return;
        }
        let script = echo_server_path();
        let registry = Arc::new(echo_server_registry(&script));
        let manager = SessionManager::new(registry);

        let result = manager
            .call_tool_with_retry("echo", "ping", json!({}), RetryPolicy::default(), None)
            .await
            .unwrap();
        assert_eq!(result, json!({"pong": true}));
        let _ = std::fs::remove_file(script);
    }

    #[tokio::test]
    async fn unknown_tool_is_not_retried() {
        if !python_available() {
            eprintln!("skipping: python3 not found");
            return;
        }
        let script = echo_server_path();
        let registry = Arc::new(echo_server_registry(&script));
        let manager = SessionManager::new(registry);

        let err = manager
            .call_tool_with_retry("echo", "missing-tool", json!({}), RetryPolicy::default().with_max_attempts(3), None)
            .await
            .unwrap_err();
        assert_eq!(err.attempts, 1);
        let _ = std::fs::remove_file(script);
    }

    #[tokio::test]
    async fn health_check_all_reports_per_server() {
        if !python_available() {
            eprintln!("skipping: python3 not found");
            return;
        }
        let script = echo_server_path();
        let registry = Arc::new(echo_server_registry(&script));
        let manager = SessionManager::new(registry);

        let results = manager.health_check_all().await;
        assert_eq!(results.get("echo"), Some(&true));
        let _ = std::fs::remove_file(script);
    }

    #[tokio::test]
    async fn session_metadata_is_empty_outside_a_scope() {
        if !python_available() {
            eprintln!("skipping: python3 not found");
            return;
        }
        let script = echo_server_path();
        let registry = Arc::new(echo_server_registry(&script));
        let manager = SessionManager::new(registry);
        let _ = manager.scoped_session("echo", |h| async move { Ok(h.id()) }).await;
        assert!(manager.session_metadata().is_empty());
        let _ = std::fs::remove_file(script);
    }
}
