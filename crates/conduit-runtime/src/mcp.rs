use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, RwLock};

use conduit_types::ToolSchema;

use crate::{now_ms, ToolTransport};

const MCP_PROTOCOL_VERSION: &str = "2025-06-18";
const MCP_CLIENT_NAME: &str = "conduit";
const MCP_CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpToolCacheEntry {
    pub tool_name: String,
    pub description: String,
    #[serde(default)]
    pub input_schema: Value,
    pub fetched_at_ms: u64,
    pub schema_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServer {
    pub name: String,
    pub transport: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub tool_cache: Vec<McpToolCacheEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools_fetched_at_ms: Option<u64>,
}

impl McpServer {
    pub fn cached_tools(&self) -> Vec<ToolSchema> {
        self.tool_cache
            .iter()
            .map(|entry| {
                ToolSchema::new(
                    entry.tool_name.clone(),
                    entry.description.clone(),
                    entry.input_schema.clone(),
                )
            })
            .collect()
    }
}

/// JSON-RPC over a child process's stdin/stdout, one message per line.
struct StdioSession {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    next_id: u64,
}

impl StdioSession {
    async fn spawn(command_text: &str) -> anyhow::Result<Self> {
        if command_text.is_empty() {
            bail!("missing stdio command");
        }
        #[cfg(windows)]
        let mut command = {
            let mut cmd = Command::new("powershell");
            cmd.args(["-NoProfile", "-Command", command_text]);
            cmd
        };
        #[cfg(not(windows))]
        let mut command = {
            let mut cmd = Command::new("sh");
            cmd.args(["-lc", command_text]);
            cmd
        };
        command
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);
        let mut child = command.spawn().context("failed to spawn stdio server")?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdio server has no stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("stdio server has no stdout"))?;
        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            next_id: 1,
        })
    }

    async fn write_message(&mut self, message: &Value) -> anyhow::Result<()> {
        let mut line = serde_json::to_string(message)?;
        line.push('\n');
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.flush().await?;
        Ok(())
    }

    async fn request(&mut self, method: &str, params: Value) -> anyhow::Result<Value> {
        let id = self.next_id;
        self.next_id += 1;
        self.write_message(&json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        }))
        .await?;
        // Responses to abandoned requests and server notifications are skipped.
        loop {
            let Some(line) = self.stdout.next_line().await? else {
                bail!("stdio server closed its output");
            };
            let Ok(message) = serde_json::from_str::<Value>(line.trim()) else {
                continue;
            };
            if message.get("id").and_then(Value::as_u64) == Some(id) {
                return Ok(message);
            }
        }
    }

    async fn notify(&mut self, method: &str) -> anyhow::Result<()> {
        self.write_message(&json!({"jsonrpc": "2.0", "method": method}))
            .await
    }

    async fn shutdown(mut self) {
        let _ = self.child.kill().await;
        let _ = self.child.wait().await;
    }
}

#[derive(Clone)]
pub struct McpRegistry {
    servers: Arc<RwLock<HashMap<String, McpServer>>>,
    sessions: Arc<Mutex<HashMap<String, Arc<Mutex<StdioSession>>>>>,
    state_file: Arc<PathBuf>,
}

impl McpRegistry {
    pub fn new() -> Self {
        Self::new_with_state_file(resolve_state_file())
    }

    pub fn new_with_state_file(state_file: PathBuf) -> Self {
        let loaded = load_state(&state_file)
            .into_iter()
            .map(|(k, mut v)| {
                v.connected = false;
                v.pid = None;
                if v.name.trim().is_empty() {
                    v.name = k.clone();
                }
                (k, v)
            })
            .collect::<HashMap<_, _>>();
        Self {
            servers: Arc::new(RwLock::new(loaded)),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            state_file: Arc::new(state_file),
        }
    }

    pub fn state_file(&self) -> &Path {
        self.state_file.as_path()
    }

    pub async fn list(&self) -> HashMap<String, McpServer> {
        self.servers.read().await.clone()
    }

    pub async fn get(&self, name: &str) -> Option<McpServer> {
        self.servers.read().await.get(name).cloned()
    }

    pub async fn add_or_update(
        &self,
        name: String,
        transport: String,
        headers: HashMap<String, String>,
        enabled: bool,
    ) {
        let mut servers = self.servers.write().await;
        let existing = servers.get(&name).cloned();
        let same_transport = existing
            .as_ref()
            .map(|row| row.transport == transport)
            .unwrap_or(false);
        let server = McpServer {
            name: name.clone(),
            transport,
            enabled,
            connected: false,
            pid: None,
            last_error: None,
            headers,
            tool_cache: existing
                .as_ref()
                .filter(|_| same_transport)
                .map(|row| row.tool_cache.clone())
                .unwrap_or_default(),
            tools_fetched_at_ms: existing
                .as_ref()
                .filter(|_| same_transport)
                .and_then(|row| row.tools_fetched_at_ms),
        };
        servers.insert(name.clone(), server);
        drop(servers);
        self.close_session(&name).await;
        self.persist_state().await;
    }

    pub async fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        let mut servers = self.servers.write().await;
        let Some(server) = servers.get_mut(name) else {
            return false;
        };
        server.enabled = enabled;
        if !enabled {
            server.connected = false;
            server.pid = None;
        }
        drop(servers);
        if !enabled {
            self.close_session(name).await;
        }
        self.persist_state().await;
        true
    }

    pub async fn remove(&self, name: &str) -> bool {
        let removed = self.servers.write().await.remove(name).is_some();
        if removed {
            self.close_session(name).await;
            self.persist_state().await;
        }
        removed
    }

    async fn close_session(&self, name: &str) {
        let session = self.sessions.lock().await.remove(name);
        if let Some(session) = session {
            if let Ok(session) = Arc::try_unwrap(session) {
                session.into_inner().shutdown().await;
            }
        }
    }

    async fn mark(&self, name: &str, connected: bool, pid: Option<u32>, error: Option<String>) {
        let mut servers = self.servers.write().await;
        if let Some(entry) = servers.get_mut(name) {
            entry.connected = connected;
            entry.pid = pid;
            entry.last_error = error;
        }
        drop(servers);
        self.persist_state().await;
    }

    async fn connect_inner(&self, server: &McpServer) -> anyhow::Result<Option<u32>> {
        if let Some(command_text) = parse_stdio_transport(&server.transport) {
            let mut session = StdioSession::spawn(command_text).await?;
            let pid = session.child.id();
            let init = session.request("initialize", initialize_params()).await?;
            rpc_result(init, "initialize")?;
            session.notify("notifications/initialized").await?;
            self.sessions
                .lock()
                .await
                .insert(server.name.clone(), Arc::new(Mutex::new(session)));
            return Ok(pid);
        }
        if let Some(endpoint) = parse_remote_endpoint(&server.transport) {
            let init = post_json_rpc(&endpoint, &server.headers, rpc_request("initialize", initialize_params())).await?;
            rpc_result(init, "initialize")?;
            return Ok(None);
        }
        bail!("unsupported transport `{}`; use stdio:<command> or an http(s) URL", server.transport)
    }

    /// Sends one request to `name` over whichever transport it uses.
    async fn rpc(&self, server: &McpServer, method: &str, params: Value) -> anyhow::Result<Value> {
        if parse_stdio_transport(&server.transport).is_some() {
            let session = self
                .sessions
                .lock()
                .await
                .get(&server.name)
                .cloned()
                .ok_or_else(|| anyhow!("MCP server '{}' is not connected", server.name))?;
            let mut session = session.lock().await;
            let response = session.request(method, params).await?;
            return rpc_result(response, method);
        }
        let endpoint = parse_remote_endpoint(&server.transport)
            .ok_or_else(|| anyhow!("unsupported transport `{}`", server.transport))?;
        let response = post_json_rpc(&endpoint, &server.headers, rpc_request(method, params)).await?;
        rpc_result(response, method)
    }

    async fn connected_server(&self, name: &str) -> anyhow::Result<McpServer> {
        let server = self
            .get(name)
            .await
            .ok_or_else(|| anyhow!("MCP server '{name}' not found"))?;
        if !server.enabled {
            bail!("MCP server '{name}' is disabled");
        }
        if !server.connected {
            bail!("MCP server '{name}' is not connected");
        }
        Ok(server)
    }

    async fn store_tool_cache(&self, name: &str, tools: &[ToolSchema]) {
        let now = now_ms();
        let cache = tools
            .iter()
            .map(|tool| McpToolCacheEntry {
                tool_name: tool.name.clone(),
                description: tool.description.clone(),
                input_schema: tool.input_schema.clone(),
                fetched_at_ms: now,
                schema_hash: schema_hash(&tool.input_schema),
            })
            .collect::<Vec<_>>();
        let mut servers = self.servers.write().await;
        if let Some(entry) = servers.get_mut(name) {
            entry.tool_cache = cache;
            entry.tools_fetched_at_ms = Some(now);
        }
        drop(servers);
        self.persist_state().await;
    }

    async fn persist_state(&self) {
        let snapshot = self.servers.read().await.clone();
        if let Some(parent) = self.state_file.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        if let Ok(payload) = serde_json::to_string_pretty(&snapshot) {
            let _ = tokio::fs::write(self.state_file.as_path(), payload).await;
        }
    }
}

impl Default for McpRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolTransport for McpRegistry {
    async fn server_config(&self, name: &str) -> Option<McpServer> {
        self.get(name).await
    }

    async fn is_connected(&self, name: &str) -> bool {
        self.get(name).await.map(|s| s.connected).unwrap_or(false)
    }

    async fn connect(&self, name: &str) -> anyhow::Result<()> {
        let server = self
            .get(name)
            .await
            .ok_or_else(|| anyhow!("MCP server '{name}' not found"))?;
        if !server.enabled {
            self.mark(name, false, None, Some("MCP server is disabled".to_string()))
                .await;
            bail!("MCP server '{name}' is disabled");
        }
        self.close_session(name).await;
        let attempt = tokio::time::timeout(HANDSHAKE_TIMEOUT, self.connect_inner(&server))
            .await
            .unwrap_or_else(|_| Err(anyhow!("MCP handshake timed out")));
        match attempt {
            Ok(pid) => {
                self.mark(name, true, pid, None).await;
                Ok(())
            }
            Err(err) => {
                self.sessions.lock().await.remove(name);
                self.mark(name, false, None, Some(err.to_string())).await;
                Err(err)
            }
        }
    }

    async fn disconnect(&self, name: &str) -> bool {
        self.close_session(name).await;
        let mut servers = self.servers.write().await;
        if let Some(server) = servers.get_mut(name) {
            server.connected = false;
            server.pid = None;
            drop(servers);
            self.persist_state().await;
            return true;
        }
        false
    }

    async fn list_tools(&self, name: &str) -> anyhow::Result<Vec<ToolSchema>> {
        let server = self.connected_server(name).await?;
        let result = self.rpc(&server, "tools/list", json!({})).await?;
        let rows = result
            .get("tools")
            .and_then(Value::as_array)
            .ok_or_else(|| anyhow!("MCP tools/list result missing tools array"))?;
        let tools = rows
            .iter()
            .filter_map(|row| {
                let tool_name = row.get("name").and_then(Value::as_str)?;
                let description = row
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                let input_schema = row
                    .get("inputSchema")
                    .or_else(|| row.get("input_schema"))
                    .cloned()
                    .unwrap_or_else(|| json!({"type":"object"}));
                Some(ToolSchema::new(tool_name, description, input_schema))
            })
            .collect::<Vec<_>>();
        self.store_tool_cache(name, &tools).await;
        Ok(tools)
    }

    async fn call_tool(
        &self,
        server_name: &str,
        tool_name: &str,
        args: &Map<String, Value>,
    ) -> anyhow::Result<String> {
        let server = self.connected_server(server_name).await?;
        let result = self
            .rpc(
                &server,
                "tools/call",
                json!({"name": tool_name, "arguments": args}),
            )
            .await?;
        let output = result
            .get("content")
            .map(render_mcp_content)
            .or_else(|| result.get("output").map(|v| v.to_string()))
            .unwrap_or_else(|| result.to_string());
        if result.get("isError").and_then(Value::as_bool).unwrap_or(false) {
            bail!(output);
        }
        Ok(output)
    }
}

fn default_enabled() -> bool {
    true
}

fn resolve_state_file() -> PathBuf {
    if let Ok(path) = std::env::var("CONDUIT_MCP_REGISTRY") {
        return PathBuf::from(path);
    }
    crate::state_dir().join("mcp_servers.json")
}

fn load_state(path: &Path) -> HashMap<String, McpServer> {
    let Ok(raw) = std::fs::read_to_string(path) else {
        return HashMap::new();
    };
    serde_json::from_str::<HashMap<String, McpServer>>(&raw).unwrap_or_default()
}

fn parse_stdio_transport(transport: &str) -> Option<&str> {
    transport.strip_prefix("stdio:").map(str::trim)
}

fn parse_remote_endpoint(transport: &str) -> Option<String> {
    let trimmed = transport.trim();
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        return Some(trimmed.to_string());
    }
    for prefix in ["http:", "https:"] {
        if let Some(rest) = trimmed.strip_prefix(prefix) {
            let endpoint = rest.trim();
            if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
                return Some(endpoint.to_string());
            }
        }
    }
    None
}

fn initialize_params() -> Value {
    json!({
        "protocolVersion": MCP_PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": MCP_CLIENT_NAME,
            "version": MCP_CLIENT_VERSION,
        }
    })
}

fn rpc_request(method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": format!("{}-{}", method.replace('/', "-"), now_ms()),
        "method": method,
        "params": params,
    })
}

fn rpc_result(response: Value, method: &str) -> anyhow::Result<Value> {
    if let Some(err) = response.get("error") {
        let message = err
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("MCP {method} failed"));
        bail!(message);
    }
    Ok(response.get("result").cloned().unwrap_or(Value::Null))
}

fn schema_hash(schema: &Value) -> String {
    let payload = serde_json::to_vec(schema).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(payload);
    format!("{:x}", hasher.finalize())
}

fn build_headers(headers: &HashMap<String, String>) -> anyhow::Result<HeaderMap> {
    let mut map = HeaderMap::new();
    map.insert(
        ACCEPT,
        HeaderValue::from_static("application/json, text/event-stream"),
    );
    map.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    for (key, value) in headers {
        let name = HeaderName::from_bytes(key.trim().as_bytes())
            .map_err(|e| anyhow!("invalid header name '{key}': {e}"))?;
        let header = HeaderValue::from_str(value.trim())
            .map_err(|e| anyhow!("invalid header value for '{key}': {e}"))?;
        map.insert(name, header);
    }
    Ok(map)
}

async fn post_json_rpc(
    endpoint: &str,
    headers: &HashMap<String, String>,
    request: Value,
) -> anyhow::Result<Value> {
    let client = reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .context("failed to build HTTP client")?;
    let response = client
        .post(endpoint)
        .headers(build_headers(headers)?)
        .json(&request)
        .send()
        .await
        .context("MCP request failed")?;
    let status = response.status();
    let payload = response
        .text()
        .await
        .context("failed to read MCP response")?;
    if !status.is_success() {
        bail!(
            "MCP endpoint returned HTTP {}: {}",
            status.as_u16(),
            payload.chars().take(400).collect::<String>()
        );
    }
    parse_rpc_payload(&payload)
}

/// Streamable HTTP servers may answer with a single SSE `data:` frame.
fn parse_rpc_payload(payload: &str) -> anyhow::Result<Value> {
    if let Ok(value) = serde_json::from_str::<Value>(payload.trim()) {
        return Ok(value);
    }
    payload
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .find_map(|data| serde_json::from_str::<Value>(data.trim()).ok())
        .ok_or_else(|| anyhow!("invalid MCP JSON response"))
}

fn render_mcp_content(value: &Value) -> String {
    let Some(items) = value.as_array() else {
        return value.to_string();
    };
    let chunks = items
        .iter()
        .map(|item| {
            item.get("text")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| item.to_string())
        })
        .collect::<Vec<_>>();
    if chunks.is_empty() {
        value.to_string()
    } else {
        chunks.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn temp_registry() -> McpRegistry {
        let file = std::env::temp_dir().join(format!("mcp-test-{}.json", Uuid::new_v4()));
        McpRegistry::new_with_state_file(file)
    }

    #[tokio::test]
    async fn add_disable_remove_roundtrip_persists() {
        let registry = temp_registry();
        registry
            .add_or_update(
                "weather".to_string(),
                "https://mcp.example.com/mcp".to_string(),
                HashMap::new(),
                true,
            )
            .await;
        assert!(registry.set_enabled("weather", false).await);
        let reloaded = McpRegistry::new_with_state_file(registry.state_file().to_path_buf());
        let server = reloaded.get("weather").await.expect("persisted");
        assert!(!server.enabled);
        assert!(!server.connected);
        assert!(reloaded.remove("weather").await);
        assert!(!reloaded.remove("weather").await);
    }

    #[tokio::test]
    async fn connect_disabled_server_fails_and_records_error() {
        let registry = temp_registry();
        registry
            .add_or_update("fs".to_string(), "stdio:true".to_string(), HashMap::new(), false)
            .await;
        assert!(registry.connect("fs").await.is_err());
        let server = registry.get("fs").await.expect("server");
        assert_eq!(server.last_error.as_deref(), Some("MCP server is disabled"));
    }

    #[tokio::test]
    async fn unknown_transport_is_rejected() {
        let registry = temp_registry();
        registry
            .add_or_update("odd".to_string(), "carrier-pigeon".to_string(), HashMap::new(), true)
            .await;
        let err = registry.connect("odd").await.expect_err("unsupported");
        assert!(err.to_string().contains("unsupported transport"));
        assert!(!registry.is_connected("odd").await);
    }

    #[tokio::test]
    async fn calls_require_a_connection() {
        let registry = temp_registry();
        registry
            .add_or_update("w".to_string(), "https://x.invalid/mcp".to_string(), HashMap::new(), true)
            .await;
        let err = registry
            .call_tool("w", "get", &Map::new())
            .await
            .expect_err("not connected");
        assert!(err.to_string().contains("is not connected"));
    }

    #[test]
    fn parse_remote_endpoint_supports_http_prefixes() {
        assert_eq!(
            parse_remote_endpoint("https://mcp.example.com/mcp"),
            Some("https://mcp.example.com/mcp".to_string())
        );
        assert_eq!(
            parse_remote_endpoint("http:https://mcp.example.com/mcp"),
            Some("https://mcp.example.com/mcp".to_string())
        );
        assert_eq!(parse_remote_endpoint("stdio:npx server"), None);
    }

    #[test]
    fn content_items_render_as_text_lines() {
        let content = json!([{"type":"text","text":"a"},{"type":"image","data":"x"}]);
        let rendered = render_mcp_content(&content);
        assert!(rendered.starts_with("a\n"));
        assert!(rendered.contains("image"));
    }

    #[test]
    fn sse_framed_rpc_payload_is_accepted() {
        let payload = "event: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{}}\n\n";
        let value = parse_rpc_payload(payload).expect("parsed");
        assert_eq!(value["id"], json!(1));
    }
}
