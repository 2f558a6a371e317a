//! MCP Client Pool: discovers tool servers from a `mcp.json`-shaped config,
//! initializes each over JSON-RPC-2.0-over-HTTP, validates declared
//! required-context parameters, and routes `invoke(tool_name, args)` calls
//! to the server that registered the tool.
//!
//! One [`McpClientPool`] is process-wide and read-only after
//! [`McpClientPool::initialize_all`]; each server gets its own
//! [`reqwest::Client`] (and therefore its own connection pool).

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::time::Duration;

/// Endpoints tried, in order, until one answers. Mirrors the reference
/// client's fallback list exactly.
const ENDPOINTS: &[&str] = &["/mcp", "/message", "/"];

const MCP_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// `mcp.json`'s top-level shape.
#[derive(Debug, Clone, Deserialize)]
pub struct McpConfig {
    #[serde(rename = "mcpServers")]
    pub mcp_servers: HashMap<String, McpServerConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct McpServerConfig {
    pub url: String,
    #[serde(default = "default_transport")]
    pub transport: String,
    #[serde(default)]
    pub context: HashMap<String, Value>,
}

fn default_transport() -> String {
    "streamable-http".to_string()
}

/// A registered tool's descriptor, annotated with the server that owns it.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub server_name: String,
}

/// A server's plugin identity as surfaced by `initialize`.
#[derive(Debug, Clone, Serialize)]
pub struct PluginInfo {
    pub server_name: String,
    pub name: String,
    pub description: String,
    pub tools: Vec<ToolDescriptor>,
}

/// Outcome of a `pool.invoke(tool_name, args)` call.
#[derive(Debug, Clone, Serialize)]
pub struct ToolResult {
    pub success: bool,
    pub content: Option<Value>,
    pub error: Option<String>,
}

impl ToolResult {
    fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            content: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug)]
pub enum McpPoolError {
    Transport(String),
    Protocol(String),
}

impl fmt::Display for McpPoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            McpPoolError::Transport(msg) => write!(f, "MCP transport error: {}", msg),
            McpPoolError::Protocol(msg) => write!(f, "MCP protocol error: {}", msg),
        }
    }
}

impl Error for McpPoolError {}

struct ServerClient {
    http: reqwest::Client,
    base_url: String,
    context: HashMap<String, Value>,
}

impl ServerClient {
    /// POST a JSON-RPC request to each candidate endpoint in order, using
    /// the first one that returns a response at all (not the first one
    /// that returns success — a 404 from `/mcp` still "answers").
    async fn send_request(&self, request: &Value) -> Result<Value, McpPoolError> {
        let mut last_err = None;
        for endpoint in ENDPOINTS {
            let url = format!("{}{}", self.base_url.trim_end_matches('/'), endpoint);
            match self
                .http
                .post(&url)
                .json(request)
                .timeout(MCP_CALL_TIMEOUT)
                .send()
                .await
            {
                Ok(response) => {
                    return response
                        .json::<Value>()
                        .await
                        .map_err(|e| McpPoolError::Protocol(e.to_string()));
                }
                Err(e) => last_err = Some(e.to_string()),
            }
        }
        Err(McpPoolError::Transport(
            last_err.unwrap_or_else(|| "all endpoints failed".to_string()),
        ))
    }
}

/// A server that failed initialization (transport error, or a
/// `requiredContext` parameter the config didn't supply).
#[derive(Debug, Clone)]
pub struct FailedInit {
    pub server_name: String,
    pub reason: String,
    pub missing_context: Vec<String>,
}

/// The MCP Client Pool.
pub struct McpClientPool {
    servers: HashMap<String, ServerClient>,
    tool_to_server: HashMap<String, String>,
    plugins: HashMap<String, PluginInfo>,
    failed: Vec<FailedInit>,
}

impl McpClientPool {
    /// Build a pool (not yet initialized) from a parsed `mcp.json`.
    pub fn from_config(config: McpConfig) -> Self {
        let mut servers = HashMap::new();
        for (name, server_config) in config.mcp_servers {
            if server_config.transport != "streamable-http" {
                log::warn!(
                    "server '{}' uses unsupported transport: {}",
                    name,
                    server_config.transport
                );
                continue;
            }
            let http = reqwest::Client::builder()
                .timeout(MCP_CALL_TIMEOUT)
                .build()
                .expect("failed to build MCP HTTP client");
            servers.insert(
                name,
                ServerClient {
                    http,
                    base_url: server_config.url,
                    context: server_config.context,
                },
            );
        }
        Self {
            servers,
            tool_to_server: HashMap::new(),
            plugins: HashMap::new(),
            failed: Vec::new(),
        }
    }

    /// `initialize` + validate `requiredContext` + `tools/list` against
    /// every configured server. Servers with transport failures or
    /// unsatisfied required context are recorded in [`failed_servers`] and
    /// excluded from the routing table; this never returns an error for an
    /// individual server's failure.
    pub async fn initialize_all(&mut self) {
        let names: Vec<String> = self.servers.keys().cloned().collect();
        for name in names {
            if let Err(failure) = self.initialize_one(&name).await {
                self.failed.push(failure);
            }
        }
    }

    async fn initialize_one(&mut self, name: &str) -> Result<(), FailedInit> {
        let client = self.servers.get(name).expect("server was just listed");
        let mut init_params = json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {},
            "clientInfo": { "name": "conclave-mcp-client", "version": env!("CARGO_PKG_VERSION") },
        });
        if !client.context.is_empty() {
            init_params["context"] = json!(client.context);
        }

        let request = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "initialize",
            "params": init_params,
        });

        let response = client.send_request(&request).await.map_err(|e| FailedInit {
            server_name: name.to_string(),
            reason: e.to_string(),
            missing_context: Vec::new(),
        })?;

        if let Some(error) = response.get("error") {
            return Err(FailedInit {
                server_name: name.to_string(),
                reason: error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
                missing_context: Vec::new(),
            });
        }

        let result = response.get("result").cloned().unwrap_or(Value::Null);
        let server_info = result.get("serverInfo").cloned().unwrap_or(Value::Null);
        let plugin_name = server_info
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or(name)
            .to_string();
        let plugin_description = server_info
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let required_context = result
            .get("requiredContext")
            .cloned()
            .unwrap_or(json!({}));

        let mut missing = Vec::new();
        if let Some(obj) = required_context.as_object() {
            for (param_name, param_def) in obj {
                let required = param_def
                    .get("required")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                if !required {
                    continue;
                }
                let satisfied = client
                    .context
                    .get(param_name)
                    .map(is_truthy)
                    .unwrap_or(false);
                if !satisfied {
                    missing.push(param_name.clone());
                }
            }
        }
        if !missing.is_empty() {
            log::warn!(
                "server '{}' ({}) missing required context params: {:?}",
                name,
                plugin_name,
                missing
            );
            return Err(FailedInit {
                server_name: name.to_string(),
                reason: "missing required context parameters".to_string(),
                missing_context: missing,
            });
        }

        let list_request = json!({
            "jsonrpc": "2.0",
            "id": 2,
            "method": "tools/list",
            "params": {},
        });
        let list_response = client.send_request(&list_request).await.map_err(|e| FailedInit {
            server_name: name.to_string(),
            reason: e.to_string(),
            missing_context: Vec::new(),
        })?;

        let tools_json = list_response
            .get("result")
            .and_then(|r| r.get("tools"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut tools = Vec::new();
        for tool in &tools_json {
            let Some(tool_name) = tool.get("name").and_then(Value::as_str) else {
                continue;
            };
            self.tool_to_server
                .insert(tool_name.to_string(), name.to_string());
            tools.push(ToolDescriptor {
                name: tool_name.to_string(),
                description: tool
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                input_schema: tool.get("inputSchema").cloned().unwrap_or(json!({})),
                server_name: name.to_string(),
            });
        }

        self.plugins.insert(
            name.to_string(),
            PluginInfo {
                server_name: name.to_string(),
                name: plugin_name,
                description: plugin_description,
                tools,
            },
        );

        Ok(())
    }

    /// Servers that failed initialization, for operator-visible reporting.
    pub fn failed_servers(&self) -> &[FailedInit] {
        &self.failed
    }

    /// All tools across every successfully initialized server.
    pub fn list_tools(&self) -> Vec<ToolDescriptor> {
        self.plugins
            .values()
            .flat_map(|p| p.tools.clone())
            .collect()
    }

    /// `"- name: description\n…"` projection used in agent prompts.
    pub fn summarise_plugins(&self) -> String {
        self.plugins
            .values()
            .map(|p| format!("- {}: {}", p.server_name, p.description))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Look up a plugin by name, hyphen/underscore-insensitive and
    /// case-insensitive.
    pub fn find_plugin(&self, name: &str) -> Option<&PluginInfo> {
        let normalized = normalize_name(name);
        self.plugins
            .values()
            .find(|p| normalize_name(&p.server_name) == normalized)
    }

    /// Resolve the server for a tool name: exact match first; if absent and
    /// the name contains a `.`, the prefix is matched against server names
    /// (hyphen/underscore insensitive).
    fn resolve_server(&self, tool_name: &str) -> Option<&ServerClient> {
        if let Some(server_name) = self.tool_to_server.get(tool_name) {
            return self.servers.get(server_name);
        }
        if let Some((prefix, _)) = tool_name.split_once('.') {
            let normalized_prefix = normalize_name(prefix);
            for (server_name, client) in &self.servers {
                if normalize_name(server_name).contains(&normalized_prefix)
                    || normalized_prefix.contains(&normalize_name(server_name))
                {
                    return Some(client);
                }
            }
        }
        None
    }

    /// Invoke `tool_name` with `args` against whichever server owns it.
    /// Per-call transport errors are surfaced as-is; the pool does not
    /// retry (retry policy is the orchestrator's job).
    pub async fn invoke(&self, tool_name: &str, args: Value) -> ToolResult {
        let Some(client) = self.resolve_server(tool_name) else {
            return ToolResult::failure(format!("tool not found: {}", tool_name));
        };

        let request = json!({
            "jsonrpc": "2.0",
            "id": 3,
            "method": "tools/call",
            "params": { "name": tool_name, "arguments": args },
        });

        let response = match client.send_request(&request).await {
            Ok(r) => r,
            Err(e) => return ToolResult::failure(e.to_string()),
        };

        if let Some(error) = response.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string();
            return ToolResult::failure(message);
        }

        let Some(result) = response.get("result") else {
            return ToolResult::failure("malformed MCP response: no result or error");
        };

        let is_error = result
            .get("isError")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let text = result
            .get("content")
            .and_then(Value::as_array)
            .and_then(|items| {
                items
                    .iter()
                    .find(|item| item.get("type").and_then(Value::as_str) == Some("text"))
            })
            .and_then(|item| item.get("text"))
            .and_then(Value::as_str)
            .map(str::to_string);

        let Some(text) = text else {
            return ToolResult {
                success: !is_error,
                content: Some(result.clone()),
                error: if is_error {
                    Some(result.to_string())
                } else {
                    None
                },
            };
        };

        let parsed = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text.clone()));
        if is_error {
            ToolResult {
                success: false,
                content: None,
                error: Some(text),
            }
        } else {
            ToolResult {
                success: true,
                content: Some(parsed),
                error: None,
            }
        }
    }
}

fn normalize_name(name: &str) -> String {
    name.to_lowercase().replace(['-', '_'], "")
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::String(s) => !s.is_empty(),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_ignores_hyphen_underscore_case() {
        assert_eq!(normalize_name("weather-tool"), normalize_name("Weather_Tool"));
    }

    #[test]
    fn config_parses_mcp_json_shape() {
        let raw = r#"{
            "mcpServers": {
                "weather": { "url": "http://127.0.0.1:8003", "transport": "streamable-http", "context": { "token": "abc" } }
            }
        }"#;
        let config: McpConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.mcp_servers.len(), 1);
        assert_eq!(config.mcp_servers["weather"].url, "http://127.0.0.1:8003");
    }

    #[test]
    fn invoke_unknown_tool_reports_not_found() {
        let pool = McpClientPool {
            servers: HashMap::new(),
            tool_to_server: HashMap::new(),
            plugins: HashMap::new(),
            failed: Vec::new(),
        };
        assert!(pool.resolve_server("weather.get").is_none());
    }

    #[test]
    fn truthy_checks_match_required_context_validation_rules() {
        assert!(!is_truthy(&Value::Null));
        assert!(!is_truthy(&Value::String(String::new())));
        assert!(is_truthy(&Value::String("token".to_string())));
    }
}
