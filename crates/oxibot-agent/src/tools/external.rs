//! External protocol-tool manager — lifecycle for out-of-process tool servers.
//!
//! Grounded on nanobot's `agent/tools/mcp.py` (`MCPManager`/`MCPTool`: a
//! per-server task holding a ready future and a stop event, `start()`
//! awaiting the ready future with a 30s timeout and cancelling on failure,
//! `stop()` iterating handles in reverse registration order with a 5s join
//! timeout) and `oxibot-cron/src/service.rs`'s `tokio::select!` timer/
//! shutdown shape for the task-lifecycle structure. No `mcp` crate exists in
//! this ecosystem, so the three transports speak a small newline-delimited
//! JSON-RPC-ish protocol directly over `tokio::process::Command` stdio or
//! `reqwest`, rather than a vendored protocol implementation.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use oxibot_core::config::schema::{ExternalToolServerConfig, ExternalToolTransport};

use super::base::Tool;

const READY_TIMEOUT: Duration = Duration::from_secs(30);
const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

// ─────────────────────────────────────────────
// Wire protocol
// ─────────────────────────────────────────────

#[derive(Clone, Debug, Deserialize)]
struct RemoteToolSpec {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(rename = "inputSchema", default = "default_input_schema")]
    input_schema: Value,
}

fn default_input_schema() -> Value {
    json!({ "type": "object", "properties": {} })
}

/// A live connection to one external tool server, able to issue method calls.
#[async_trait]
trait Transport: Send + Sync {
    async fn call(&self, method: &str, params: Value) -> anyhow::Result<Value>;
}

/// Newline-delimited JSON-RPC-ish transport over a child process's stdio.
struct ChildProcessTransport {
    #[allow(dead_code)]
    child: Mutex<Child>,
    stdin: Mutex<ChildStdin>,
    stdout: Mutex<BufReader<ChildStdout>>,
    next_id: AtomicU64,
}

impl ChildProcessTransport {
    fn spawn(command: &str, args: &[String], env: &HashMap<String, String>) -> anyhow::Result<Self> {
        let mut cmd = Command::new(command);
        cmd.args(args);
        for (k, v) in env {
            cmd.env(k, v);
        }
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::null());
        cmd.kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| anyhow::anyhow!("failed to spawn external tool process '{command}': {e}"))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow::anyhow!("external tool process has no stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("external tool process has no stdout"))?;

        Ok(Self {
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            stdout: Mutex::new(BufReader::new(stdout)),
            next_id: AtomicU64::new(1),
        })
    }
}

#[async_trait]
impl Transport for ChildProcessTransport {
    async fn call(&self, method: &str, params: Value) -> anyhow::Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = json!({ "id": id, "method": method, "params": params });
        let line = format!("{}\n", serde_json::to_string(&request)?);

        {
            let mut stdin = self.stdin.lock().await;
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await?;
        }

        let mut response_line = String::new();
        let n = {
            let mut stdout = self.stdout.lock().await;
            stdout.read_line(&mut response_line).await?
        };
        if n == 0 {
            anyhow::bail!("external tool process closed stdout before responding");
        }

        let response: Value = serde_json::from_str(response_line.trim())?;
        if let Some(err) = response.get("error") {
            anyhow::bail!("external tool error: {err}");
        }
        Ok(response.get("result").cloned().unwrap_or(Value::Null))
    }
}

/// JSON-RPC-ish transport over a single HTTP endpoint, used for both the SSE
/// and streaming-HTTP transports (the spec collapses them to one request
/// shape; neither needs a persistent connection to exercise this protocol).
struct HttpTransport {
    client: reqwest::Client,
    url: String,
    next_id: AtomicU64,
}

#[async_trait]
impl Transport for HttpTransport {
    async fn call(&self, method: &str, params: Value) -> anyhow::Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let body = json!({ "id": id, "method": method, "params": params });

        let resp = self.client.post(&self.url).json(&body).send().await?;
        let status = resp.status();
        let value: Value = resp.json().await?;
        if !status.is_success() {
            anyhow::bail!("external tool server returned {status}: {value}");
        }
        if let Some(err) = value.get("error") {
            anyhow::bail!("external tool error: {err}");
        }
        Ok(value.get("result").cloned().unwrap_or(Value::Null))
    }
}

fn build_transport(transport: &ExternalToolTransport) -> anyhow::Result<Arc<dyn Transport>> {
    match transport {
        ExternalToolTransport::ChildProcess { command, args, env } => {
            Ok(Arc::new(ChildProcessTransport::spawn(command, args, env)?))
        }
        ExternalToolTransport::Sse { url } | ExternalToolTransport::StreamableHttp { url } => {
            Ok(Arc::new(HttpTransport {
                client: reqwest::Client::new(),
                url: url.clone(),
                next_id: AtomicU64::new(1),
            }))
        }
    }
}

async fn discover_tools(server: &str, transport: Arc<dyn Transport>) -> anyhow::Result<Vec<Arc<ExternalTool>>> {
    transport.call("initialize", json!({})).await?;
    let listed = transport.call("tools/list", json!({})).await?;
    let raw = listed.get("tools").cloned().unwrap_or(listed);
    let specs: Vec<RemoteToolSpec> = serde_json::from_value(raw)
        .map_err(|e| anyhow::anyhow!("malformed tools/list response from '{server}': {e}"))?;

    Ok(specs
        .into_iter()
        .map(|spec| {
            Arc::new(ExternalTool {
                qualified_name: format!("external__{server}__{}", spec.name),
                description: spec.description,
                parameters: spec.input_schema,
                remote_name: spec.name,
                transport: transport.clone(),
            })
        })
        .collect())
}

// ─────────────────────────────────────────────
// ExternalTool
// ─────────────────────────────────────────────

/// A tool backed by a live external protocol-tool server connection.
pub struct ExternalTool {
    qualified_name: String,
    description: String,
    parameters: Value,
    remote_name: String,
    transport: Arc<dyn Transport>,
}

#[async_trait]
impl Tool for ExternalTool {
    fn name(&self) -> &str {
        &self.qualified_name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> Value {
        self.parameters.clone()
    }

    async fn execute(&self, params: HashMap<String, Value>) -> anyhow::Result<String> {
        let args = Value::Object(params.into_iter().collect());
        let result = self
            .transport
            .call("tools/call", json!({ "name": self.remote_name, "arguments": args }))
            .await?;
        Ok(match result {
            Value::String(s) => s,
            Value::Null => String::new(),
            other => serde_json::to_string_pretty(&other).unwrap_or_default(),
        })
    }
}

// ─────────────────────────────────────────────
// ExternalToolManager
// ─────────────────────────────────────────────

struct ServerHandle {
    name: String,
    task: JoinHandle<()>,
    stop: Arc<Notify>,
}

/// Manages the lifecycle of configured external protocol-tool servers.
///
/// One long-lived task per server holds the transport and its discovered
/// tools' shared `Arc`s alive until told to stop; the tools themselves are
/// handed out once, at `start()`, for registration into the main
/// `ToolRegistry`.
pub struct ExternalToolManager {
    configs: HashMap<String, ExternalToolServerConfig>,
    handles: Mutex<Vec<ServerHandle>>,
}

impl ExternalToolManager {
    pub fn new(configs: HashMap<String, ExternalToolServerConfig>) -> Self {
        Self {
            configs,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Start every enabled server, returning the tools discovered from the
    /// ones that completed their handshake before the ready timeout.
    ///
    /// A server that fails to spawn, handshake, or list tools within 30s is
    /// skipped (logged as a warning) without blocking the others.
    pub async fn start(&self) -> Vec<Arc<dyn Tool>> {
        let mut handles = self.handles.lock().await;
        let mut tools: Vec<Arc<dyn Tool>> = Vec::new();

        for (name, cfg) in self.configs.iter() {
            if !cfg.enabled {
                debug!(server = %name, "external tool server disabled, skipping");
                continue;
            }

            let (ready_tx, ready_rx) = oneshot::channel::<anyhow::Result<Vec<Arc<ExternalTool>>>>();
            let stop = Arc::new(Notify::new());
            let task_stop = stop.clone();
            let task_name = name.clone();
            let task_transport_cfg = cfg.transport.clone();

            let task = tokio::spawn(async move {
                let transport = match build_transport(&task_transport_cfg) {
                    Ok(t) => t,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let discovered = discover_tools(&task_name, transport).await;
                let ok = discovered.is_ok();
                let _ = ready_tx.send(discovered);
                if ok {
                    task_stop.notified().await;
                }
            });

            match tokio::time::timeout(READY_TIMEOUT, ready_rx).await {
                Ok(Ok(Ok(discovered))) => {
                    info!(server = %name, tools = discovered.len(), "external tool server ready");
                    for t in discovered {
                        tools.push(t as Arc<dyn Tool>);
                    }
                    handles.push(ServerHandle {
                        name: name.clone(),
                        task,
                        stop,
                    });
                }
                Ok(Ok(Err(e))) => {
                    warn!(server = %name, error = %e, "external tool server handshake failed, skipping");
                    task.abort();
                }
                Ok(Err(_)) => {
                    warn!(server = %name, "external tool server task dropped before signalling ready");
                    task.abort();
                }
                Err(_) => {
                    warn!(server = %name, "external tool server handshake timed out, skipping");
                    task.abort();
                }
            }
        }

        tools
    }

    /// Stop all running servers: signal every stop flag in reverse
    /// registration order, then join each task with a 5s timeout, forcing
    /// an abort on any that doesn't exit in time.
    pub async fn stop(&self) {
        let mut handles = self.handles.lock().await;
        for handle in handles.iter().rev() {
            handle.stop.notify_waiters();
        }
        let ordered: Vec<ServerHandle> = handles.drain(..).rev().collect();
        drop(handles);

        for handle in ordered {
            let abort_handle = handle.task.abort_handle();
            match tokio::time::timeout(STOP_JOIN_TIMEOUT, handle.task).await {
                Ok(_) => debug!(server = %handle.name, "external tool server stopped"),
                Err(_) => {
                    warn!(server = %handle.name, "external tool server stop timed out, aborting");
                    abort_handle.abort();
                }
            }
        }
    }

    /// Number of configured servers (enabled or not).
    pub fn configured_count(&self) -> usize {
        self.configs.len()
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
