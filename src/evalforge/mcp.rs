//! MCP tool-server client abstraction (§6.2): the two transports an
//! [`crate::agent_runner`] can speak to a task's tool server over.
//!
//! Both transports expose the same opaque operation set (`list_tools`,
//! `call_tool`, `shutdown`) behind the [`McpTransport`] trait, mirroring the
//! teacher's HTTP-only MCP client generalised to also cover the
//! stdio-subprocess shape most of the catalog's tool servers actually use
//! (`npx -y @modelcontextprotocol/server-filesystem`, `npx -y
//! @playwright/mcp`, ...). The stdio child-process lifecycle (spawn, piped
//! stdio, `tokio::time::timeout`-bounded wait, kill on timeout) follows the
//! same pattern the bash tool uses for its own subprocess execution.

use std::collections::HashMap;
use std::fmt;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use crate::registry::ToolServerLaunch;

/// Schema for one tool the server exposes, already shaped as an OpenAI-compatible tool
/// definition via [`ToolInfo::to_tool_definition`].
#[derive(Debug, Clone, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_schema", rename = "inputSchema")]
    pub parameters_schema: serde_json::Value,
}

fn default_schema() -> serde_json::Value {
    serde_json::json!({"type": "object", "properties": {}})
}

impl ToolInfo {
    pub fn to_tool_definition(&self) -> crate::client_wrapper::ToolDefinition {
        crate::client_wrapper::ToolDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters_schema: self.parameters_schema.clone(),
        }
    }
}

/// Outcome of a single `call_tool` round-trip.
#[derive(Debug, Clone)]
pub struct ToolCallResult {
    pub content: serde_json::Value,
    pub is_error: bool,
}

/// Transport-level faults. A malformed individual tool call is not represented here — that
/// surfaces as an `is_error: true` [`ToolCallResult`] so the agent can see and recover from it.
#[derive(Debug, Clone)]
pub enum McpError {
    Spawn(String),
    Io(String),
    Protocol(String),
    Timeout,
}

impl fmt::Display for McpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            McpError::Spawn(msg) => write!(f, "failed to launch tool server: {msg}"),
            McpError::Io(msg) => write!(f, "tool server io error: {msg}"),
            McpError::Protocol(msg) => write!(f, "tool server protocol error: {msg}"),
            McpError::Timeout => write!(f, "tool server call timed out"),
        }
    }
}

impl std::error::Error for McpError {}

#[derive(Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request<'a> {
    ListTools,
    CallTool {
        name: &'a str,
        arguments: serde_json::Value,
    },
    Shutdown,
}

#[derive(Deserialize)]
struct Response {
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
}

/// Opaque client for a single service's tool server for the lifetime of one run. The orchestrator
/// only ever needs `list_tools`/`call_tool`/`shutdown`; everything beyond that is the tool
/// server's own business.
#[async_trait::async_trait]
pub trait McpTransport: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<ToolInfo>, McpError>;
    async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolCallResult, McpError>;
    async fn shutdown(&self) -> Result<(), McpError>;
}

/// Speaks line-delimited JSON over a spawned child process's stdio.
pub struct McpStdioTransport {
    child: Mutex<Child>,
    stdin: Mutex<tokio::process::ChildStdin>,
    stdout: Mutex<BufReader<tokio::process::ChildStdout>>,
    timeout: Duration,
    cache_tools: bool,
    cached: Mutex<Option<Vec<ToolInfo>>>,
}

impl McpStdioTransport {
    /// Spawn `command args...` with `env` merged into the child's environment.
    pub async fn spawn(
        command: &str,
        args: &[&str],
        env: &HashMap<String, String>,
        timeout_s: u64,
        cache_tools: bool,
    ) -> Result<Self, McpError> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| McpError::Spawn(e.to_string()))?;
        let stdin = child.stdin.take().expect("stdin was piped");
        let stdout = BufReader::new(child.stdout.take().expect("stdout was piped"));

        Ok(McpStdioTransport {
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            stdout: Mutex::new(stdout),
            timeout: Duration::from_secs(timeout_s),
            cache_tools,
            cached: Mutex::new(None),
        })
    }

    async fn roundtrip(&self, request: &Request<'_>) -> Result<Response, McpError> {
        let line = serde_json::to_string(request).map_err(|e| McpError::Protocol(e.to_string()))?;
        let call = async {
            {
                let mut stdin = self.stdin.lock().await;
                stdin
                    .write_all(line.as_bytes())
                    .await
                    .map_err(|e| McpError::Io(e.to_string()))?;
                stdin
                    .write_all(b"\n")
                    .await
                    .map_err(|e| McpError::Io(e.to_string()))?;
            }
            let mut buf = String::new();
            let mut stdout = self.stdout.lock().await;
            let n = stdout
                .read_line(&mut buf)
                .await
                .map_err(|e| McpError::Io(e.to_string()))?;
            if n == 0 {
                return Err(McpError::Io("tool server closed stdout".to_string()));
            }
            serde_json::from_str::<Response>(&buf).map_err(|e| McpError::Protocol(e.to_string()))
        };

        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| McpError::Timeout)?
    }
}

#[async_trait::async_trait]
impl McpTransport for McpStdioTransport {
    async fn list_tools(&self) -> Result<Vec<ToolInfo>, McpError> {
        if self.cache_tools {
            if let Some(cached) = self.cached.lock().await.clone() {
                return Ok(cached);
            }
        }
        let resp = self.roundtrip(&Request::ListTools).await?;
        let tools: Vec<ToolInfo> = match resp.result {
            Some(value) => {
                serde_json::from_value(value).map_err(|e| McpError::Protocol(e.to_string()))?
            }
            None => return Err(McpError::Protocol(resp.error.unwrap_or_default())),
        };
        if self.cache_tools {
            *self.cached.lock().await = Some(tools.clone());
        }
        Ok(tools)
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolCallResult, McpError> {
        let resp = self.roundtrip(&Request::CallTool { name, arguments }).await?;
        match (resp.result, resp.error) {
            (Some(content), _) => Ok(ToolCallResult {
                content,
                is_error: false,
            }),
            (None, Some(message)) => Ok(ToolCallResult {
                content: serde_json::json!({ "error": message }),
                is_error: true,
            }),
            (None, None) => Ok(ToolCallResult {
                content: serde_json::Value::Null,
                is_error: false,
            }),
        }
    }

    async fn shutdown(&self) -> Result<(), McpError> {
        let _ = self.roundtrip(&Request::Shutdown).await;
        let mut child = self.child.lock().await;
        let _ = child.start_kill();
        let _ = child.wait().await;
        Ok(())
    }
}

/// A light generalisation of an HTTP MCP client: POSTs the same `{op, ...}` envelope used over
/// stdio to a single endpoint and caches the tool list for the life of the run when requested.
pub struct McpHttpTransport {
    client: reqwest::Client,
    url: String,
    headers: HashMap<String, String>,
    timeout: Duration,
    cache_tools: bool,
    cached: Mutex<Option<Vec<ToolInfo>>>,
}

impl McpHttpTransport {
    pub fn new(
        url: String,
        headers: HashMap<String, String>,
        timeout_s: u64,
        cache_tools: bool,
    ) -> Self {
        McpHttpTransport {
            client: reqwest::Client::new(),
            url,
            headers,
            timeout: Duration::from_secs(timeout_s),
            cache_tools,
            cached: Mutex::new(None),
        }
    }

    async fn post(&self, body: &Request<'_>) -> Result<Response, McpError> {
        let mut req = self.client.post(&self.url).json(body);
        for (k, v) in &self.headers {
            req = req.header(k, v);
        }
        let call = async {
            let resp = req
                .send()
                .await
                .map_err(|e| McpError::Io(e.to_string()))?;
            resp.json::<Response>()
                .await
                .map_err(|e| McpError::Protocol(e.to_string()))
        };
        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| McpError::Timeout)?
    }
}

#[async_trait::async_trait]
impl McpTransport for McpHttpTransport {
    async fn list_tools(&self) -> Result<Vec<ToolInfo>, McpError> {
        if self.cache_tools {
            if let Some(cached) = self.cached.lock().await.clone() {
                return Ok(cached);
            }
        }
        let resp = self.post(&Request::ListTools).await?;
        let tools: Vec<ToolInfo> = match resp.result {
            Some(value) => {
                serde_json::from_value(value).map_err(|e| McpError::Protocol(e.to_string()))?
            }
            None => return Err(McpError::Protocol(resp.error.unwrap_or_default())),
        };
        if self.cache_tools {
            *self.cached.lock().await = Some(tools.clone());
        }
        Ok(tools)
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolCallResult, McpError> {
        let resp = self.post(&Request::CallTool { name, arguments }).await?;
        match (resp.result, resp.error) {
            (Some(content), _) => Ok(ToolCallResult {
                content,
                is_error: false,
            }),
            (None, Some(message)) => Ok(ToolCallResult {
                content: serde_json::json!({ "error": message }),
                is_error: true,
            }),
            (None, None) => Ok(ToolCallResult {
                content: serde_json::Value::Null,
                is_error: false,
            }),
        }
    }

    async fn shutdown(&self) -> Result<(), McpError> {
        let _ = self.post(&Request::Shutdown).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    fn write_script(dir: &Path, body: &str) -> std::path::PathBuf {
        let path = dir.join("server.sh");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "#!/bin/sh\n{body}").unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    #[tokio::test]
    async fn stdio_transport_round_trips_list_tools() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            dir.path(),
            r#"while IFS= read -r line; do echo '{"result": [{"name": "echo", "inputSchema": {"type": "object", "properties": {}}}]}'; done"#,
        );
        let transport = McpStdioTransport::spawn(
            script.to_str().unwrap(),
            &[],
            &HashMap::new(),
            5,
            false,
        )
        .await
        .unwrap();

        let tools = transport.list_tools().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "echo");
    }

    #[tokio::test]
    async fn stdio_transport_caches_tool_list_when_requested() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            dir.path(),
            r#"
n=0
while IFS= read -r line; do
  n=$((n+1))
  echo "{\"result\": [{\"name\": \"call-$n\", \"inputSchema\": {\"type\": \"object\", \"properties\": {}}}]}"
done
"#,
        );
        let transport = McpStdioTransport::spawn(
            script.to_str().unwrap(),
            &[],
            &HashMap::new(),
            5,
            true,
        )
        .await
        .unwrap();

        let first = transport.list_tools().await.unwrap();
        let second = transport.list_tools().await.unwrap();
        assert_eq!(first[0].name, second[0].name);
    }

    #[tokio::test]
    async fn stdio_transport_surfaces_tool_error_without_failing_the_call() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            dir.path(),
            r#"while IFS= read -r line; do echo '{"error": "tool exploded"}'; done"#,
        );
        let transport = McpStdioTransport::spawn(
            script.to_str().unwrap(),
            &[],
            &HashMap::new(),
            5,
            false,
        )
        .await
        .unwrap();

        let result = transport
            .call_tool("whatever", serde_json::json!({}))
            .await
            .unwrap();
        assert!(result.is_error);
        assert_eq!(result.content["error"], "tool exploded");
    }

    #[tokio::test]
    async fn stdio_transport_times_out_on_a_silent_server() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "sleep 3");
        let transport = McpStdioTransport::spawn(
            script.to_str().unwrap(),
            &[],
            &HashMap::new(),
            1,
            false,
        )
        .await
        .unwrap();

        let err = transport.list_tools().await.unwrap_err();
        assert!(matches!(err, McpError::Timeout));
    }
}

/// Launch the tool server described by `launch`, substituting `{key}` placeholders in its
/// env/headers against `credentials` (§6.2). `credentials.extra_args` is appended verbatim after
/// `launch`'s own static args, e.g. the filesystem state manager's run-scoped sandbox directory.
pub async fn launch(
    launch: &ToolServerLaunch,
    credentials: &crate::registry::CredentialBundle,
) -> Result<Arc<dyn McpTransport>, McpError> {
    match launch {
        ToolServerLaunch::Stdio {
            command,
            args,
            timeout_s,
            cache_tools,
        } => {
            let mut env = credentials.env.clone();
            for v in env.values_mut() {
                *v = crate::registry::substitute_placeholders(v, &credentials.env);
            }
            let mut all_args: Vec<&str> = args.iter().copied().collect();
            all_args.extend(credentials.extra_args.iter().map(|s| s.as_str()));
            let transport =
                McpStdioTransport::spawn(command, &all_args, &env, *timeout_s, *cache_tools)
                    .await?;
            Ok(Arc::new(transport))
        }
        ToolServerLaunch::Http {
            url,
            timeout_s,
            cache_tools,
        } => {
            let mut headers = credentials.headers.clone();
            for v in headers.values_mut() {
                *v = crate::registry::substitute_placeholders(v, &credentials.headers);
            }
            Ok(Arc::new(McpHttpTransport::new(
                url.to_string(),
                headers,
                *timeout_s,
                *cache_tools,
            )))
        }
    }
}
