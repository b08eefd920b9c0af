//! ABOUTME: Server-registry configuration loader
//! ABOUTME: parses the `mcpServers` document and resolves launch-time environment

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, warn};

const DEFAULT_TIMEOUT_SECONDS: u64 = 30;

/// Errors raised while loading or querying a [`ServerRegistry`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("server descriptor '{name}' must specify either 'command' or 'url'")]
    MissingInvocation { name: String },
    #[error("unknown server: {name}")]
    UnknownServer { name: String },
}

#[derive(Debug, Clone, Deserialize)]
struct RawServerDescriptor {
    command: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    url: Option<String>,
    #[serde(rename = "defaultTimeoutSeconds")]
    default_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawRegistryDocument {
    #[serde(rename = "mcpServers")]
    mcp_servers: HashMap<String, RawServerDescriptor>,
}

/// Launch descriptor for a single named MCP server.
#[derive(Debug, Clone)]
pub struct ServerDescriptor {
    pub name: String,
    pub command: Option<String>,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub url: Option<String>,
    pub default_timeout_seconds: u64,
}

impl ServerDescriptor {
    fn from_raw(name: String, raw: RawServerDescriptor) -> Result<Self, ConfigError> {
        if raw.command.is_none() && raw.url.is_none() {
            return Err(ConfigError::MissingInvocation { name });
        }
        Ok(Self {
            name,
            command: raw.command,
            args: raw.args,
            env: raw.env,
            url: raw.url,
            default_timeout_seconds: raw.default_timeout_seconds.unwrap_or(DEFAULT_TIMEOUT_SECONDS),
        })
    }

    /// Full `command` + `args` argv, if this descriptor launches a child process.
    #[must_use]
    pub fn argv(&self) -> Option<Vec<String>> {
        let command = self.command.clone()?;
        let mut argv = vec![command];
        argv.extend(self.args.iter().cloned());
        Some(argv)
    }
}

/// Immutable, process-scoped mapping from server name to [`ServerDescriptor`].
#[derive(Debug, Clone)]
pub struct ServerRegistry {
    servers: HashMap<String, ServerDescriptor>,
}

impl ServerRegistry {
    /// Parses a registry document from `path`. Does not resolve env
    /// references yet; that happens per-launch in [`ServerRegistry::resolve_launch_env`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text, path)
    }

    /// Parses an already-read registry document. Exposed separately from
    /// [`ServerRegistry::load`] so tests and embedders can avoid disk IO.
    pub fn parse(text: &str, path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let doc: RawRegistryDocument = serde_json::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        let mut servers = HashMap::with_capacity(doc.mcp_servers.len());
        for (name, raw) in doc.mcp_servers {
            let descriptor = ServerDescriptor::from_raw(name.clone(), raw)?;
            servers.insert(name, descriptor);
        }
        debug!(count = servers.len(), "loaded server registry");
        Ok(Self { servers })
    }

    #[must_use]
    pub fn list_servers(&self) -> Vec<&str> {
        self.servers.keys().map(String::as_str).collect()
    }

    pub fn get_descriptor(&self, name: &str) -> Result<&ServerDescriptor, ConfigError> {
        self.servers.get(name).ok_or_else(|| ConfigError::UnknownServer { name: name.to_string() })
    }

    /// Merges the process environment with the descriptor's `env` overrides,
    /// resolving `$NAME` / `${NAME}` references. An unresolved reference
    /// yields the empty string and a WARN log.
    pub fn resolve_launch_env(&self, name: &str) -> Result<HashMap<String, String>, ConfigError> {
        let descriptor = self.get_descriptor(name)?;
        let mut env: HashMap<String, String> = std::env::vars().collect();

        for (key, value) in &descriptor.env {
            let resolved = match parse_env_reference(value) {
                Some(var_name) => match std::env::var(&var_name) {
                    Ok(v) => v,
                    Err(_) => {
                        warn!(server = name, var = %var_name, "unresolved environment reference, substituting empty string");
                        String::new()
                    }
                },
                None => value.clone(),
            };
            log_env_assignment(name, key, &resolved);
            env.insert(key.clone(), resolved);
        }

        Ok(env)
    }
}

/// Returns the referenced variable name if `value` is exactly `$NAME` or
/// `${NAME}`, otherwise `None` (meaning `value` is a literal).
fn parse_env_reference(value: &str) -> Option<String> {
    let rest = value.strip_prefix('$')?;
    if let Some(braced) = rest.strip_prefix('{') {
        braced.strip_suffix('}').map(str::to_string)
    } else if rest.is_empty() {
        None
    } else {
        Some(rest.to_string())
    }
}

fn is_sensitive_key(key: &str) -> bool {
    let upper = key.to_ascii_uppercase();
    upper.contains("TOKEN") || upper.contains("PASSWORD")
}

fn log_env_assignment(server: &str, key: &str, value: &str) {
    if is_sensitive_key(key) {
        let truncated = truncate_sensitive(value);
        debug!(server, key, value = %truncated, "resolved sensitive env var");
    } else {
        debug!(server, key, value, "resolved env var");
    }
}

fn truncate_sensitive(value: &str) -> String {
    if value.len() > 8 {
        let prefix: String = value.chars().take(4).collect();
        let suffix: String = {
            let mut rev: Vec<char> = value.chars().rev().take(4).collect();
            rev.reverse();
            rev.into_iter().collect()
        };
        format!("{prefix}…{suffix}")
    } else {
        "******".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const DOC: &str = r#"
    {
        "mcpServers": {
            "echo": {
                "command": "echo-server",
                "args": ["--stdio"],
                "env": { "GREETING": "hello", "TOKEN": "$MY_TOKEN" }
            },
            "remote": {
                "url": "https://example.test/mcp"
            }
        }
    }
    "#;

    #[test]
    fn parses_registry_document() {
        let registry = ServerRegistry::parse(DOC, "test.json").unwrap();
        let mut names = registry.list_servers();
        names.sort_unstable();
        assert_eq!(names, vec!["echo", "remote"]);
    }

    #[test]
    fn descriptor_requires_command_or_url() {
        let bad = r#"{"mcpServers": {"broken": {"env": {}}}}"#;
        let err = ServerRegistry::parse(bad, "test.json").unwrap_err();
        assert!(matches!(err, ConfigError::MissingInvocation { .. }));
    }

    #[test]
    fn unknown_server_is_an_error() {
        let registry = ServerRegistry::parse(DOC, "test.json").unwrap();
        assert!(matches!(registry.get_descriptor("ghost"), Err(ConfigError::UnknownServer { .. })));
    }

    #[test]
    #[serial(mcpflow_config_env)]
    fn resolves_literal_and_missing_env_references() {
        std::env::remove_var("MY_TOKEN");
        let registry = ServerRegistry::parse(DOC, "test.json").unwrap();
        let env = registry.resolve_launch_env("echo").unwrap();
        assert_eq!(env.get("GREETING"), Some(&"hello".to_string()));
        assert_eq!(env.get("TOKEN"), Some(&String::new()));
    }

    #[test]
    #[serial(mcpflow_config_env)]
    fn resolves_present_env_reference() {
        std::env::set_var("MY_TOKEN", "sk-1234567890");
        let registry = ServerRegistry::parse(DOC, "test.json").unwrap();
        let env = registry.resolve_launch_env("echo").unwrap();
        assert_eq!(env.get("TOKEN"), Some(&"sk-1234567890".to_string()));
        std::env::remove_var("MY_TOKEN");
    }

    #[test]
    fn braced_reference_syntax_also_resolves() {
        std::env::set_var("BRACED", "value");
        assert_eq!(parse_env_reference("${BRACED}"), Some("BRACED".to_string()));
        assert_eq!(parse_env_reference("$BRACED"), Some("BRACED".to_string()));
        assert_eq!(parse_env_reference("literal"), None);
        std::env::remove_var("BRACED");
    }

    #[test]
    fn missing_mcp_servers_key_is_a_parse_error() {
        let err = ServerRegistry::parse("{}", "test.json").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn argv_combines_command_and_args() {
        let registry = ServerRegistry::parse(DOC, "test.json").unwrap();
        let descriptor = registry.get_descriptor("echo").unwrap();
        assert_eq!(descriptor.argv(), Some(vec!["echo-server".to_string(), "--stdio".to_string()]));
        let remote = registry.get_descriptor("remote").unwrap();
        assert_eq!(remote.argv(), None);
    }

    #[test]
    fn default_timeout_applied_when_absent() {
        let registry = ServerRegistry::parse(DOC, "test.json").unwrap();
        assert_eq!(registry.get_descriptor("echo").unwrap().default_timeout_seconds, DEFAULT_TIMEOUT_SECONDS);
    }
}
