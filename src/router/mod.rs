pub mod truncation;

use crate::activity::{ActivityRecorder, InvocationRecord, RecordStatus};
use crate::config::{Config, ServerSpec, TokenizerConfig};
use crate::errors::{ProxyError, ProxyResult};
use crate::index::ToolIndex;
use crate::store::{BUCKET_KV, Store, StoreError};
use crate::upstream::{CallOutcome, UpstreamManager};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use truncation::truncate_response;

/// Hard cap on `topK` regardless of configuration.
const TOP_K_CEILING: i64 = 100;

/// Routing seam: how the router reaches upstreams. The manager is the real
/// implementation; tests plug in fakes.
#[async_trait]
pub trait CallTarget: Send + Sync {
    async fn invoke(
        &self,
        server: &str,
        tool: &str,
        args: Value,
        deadline: Option<Duration>,
    ) -> Result<CallOutcome, ProxyError>;
}

#[async_trait]
impl CallTarget for UpstreamManager {
    async fn invoke(
        &self,
        server: &str,
        tool: &str,
        args: Value,
        deadline: Option<Duration>,
    ) -> Result<CallOutcome, ProxyError> {
        self.invoke_tool(server, tool, args, deadline).await
    }
}

#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub top_k: i64,
    pub tool_response_limit: usize,
    pub call_timeout: Duration,
    pub tokenizer: TokenizerConfig,
    pub read_only_mode: bool,
    pub disable_management: bool,
}

impl RouterSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            top_k: config.top_k,
            tool_response_limit: config.tool_response_limit,
            call_timeout: Duration::from_secs(config.call_tool_timeout),
            tokenizer: config.tokenizer.clone(),
            read_only_mode: config.read_only_mode,
            disable_management: config.disable_management,
        }
    }
}

/// What a façade hands back to its client for one tool call.
#[derive(Debug, Clone)]
pub struct ToolResponse {
    pub text: String,
    pub truncated: bool,
    pub is_error: bool,
}

impl ToolResponse {
    fn ok(text: String) -> Self {
        Self {
            text,
            truncated: false,
            is_error: false,
        }
    }

    fn json(value: &Value) -> Self {
        Self::ok(serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string()))
    }
}

/// Implements the fixed proxy tool surface on top of the index, the
/// manager, the KV bucket, and the activity recorder.
pub struct ProxyRouter {
    manager: Arc<UpstreamManager>,
    call_target: Arc<dyn CallTarget>,
    index: Arc<ToolIndex>,
    store: Arc<Store>,
    recorder: Arc<ActivityRecorder>,
    settings: RouterSettings,
}

impl ProxyRouter {
    pub fn new(
        manager: Arc<UpstreamManager>,
        index: Arc<ToolIndex>,
        store: Arc<Store>,
        recorder: Arc<ActivityRecorder>,
        settings: RouterSettings,
    ) -> Self {
        let call_target: Arc<dyn CallTarget> = manager.clone();
        Self {
            manager,
            call_target,
            index,
            store,
            recorder,
            settings,
        }
    }

    /// Swap the call path for tests.
    pub fn with_call_target(mut self, target: Arc<dyn CallTarget>) -> Self {
        self.call_target = target;
        self
    }

    /// The proxy tool set published to clients. Names are part of the
    /// contract; clients hardcode them.
    pub fn tool_definitions() -> Vec<Value> {
        vec![
            json!({
                "name": "retrieve_tools",
                "description": "Search the indexed tools of every connected upstream server. Returns the best-matching tools with their routed names.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "query": {"type": "string", "description": "Free-text search over tool names, descriptions and parameter schemas. Empty returns the most-used tools."},
                        "topK": {"type": "integer", "description": "Maximum number of results."}
                    },
                    "required": ["query"]
                }
            }),
            json!({
                "name": "call_tool",
                "description": "Invoke an upstream tool by its routed name '<serverName>:<toolName>'.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "name": {"type": "string", "description": "Routed tool name, e.g. 'github:create_issue'."},
                        "args": {"type": "object", "description": "Arguments passed through to the upstream tool."}
                    },
                    "required": ["name"]
                }
            }),
            json!({
                "name": "upstream_servers",
                "description": "List or manage upstream MCP servers.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "action": {"type": "string", "enum": ["list", "add", "update", "remove", "enable", "quarantine"]},
                        "args": {"type": "object", "description": "Action arguments: a server spec for add, {name, patch} for update, {name} for remove, {name, enabled} for enable, {name, quarantined} for quarantine."}
                    },
                    "required": ["action"]
                }
            }),
            json!({
                "name": "quarantine_security",
                "description": "Review quarantined servers. 'inspect' is the only way to look at a quarantined server's tools.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "action": {"type": "string", "enum": ["list", "inspect", "release"]},
                        "serverName": {"type": "string"}
                    },
                    "required": ["action"]
                }
            }),
            json!({
                "name": "read_cache",
                "description": "Read a value from the proxy's small scratch key/value store.",
                "inputSchema": {
                    "type": "object",
                    "properties": {"key": {"type": "string"}},
                    "required": ["key"]
                }
            }),
            json!({
                "name": "write_cache",
                "description": "Write a value into the proxy's small scratch key/value store.",
                "inputSchema": {
                    "type": "object",
                    "properties": {"key": {"type": "string"}, "value": {"type": "string"}},
                    "required": ["key", "value"]
                }
            }),
        ]
    }

    pub async fn dispatch(&self, tool: &str, args: Value) -> ProxyResult<ToolResponse> {
        match tool {
            "retrieve_tools" => self.retrieve_tools(&args),
            "call_tool" => self.call_tool(args).await,
            "upstream_servers" => self.upstream_servers(&args),
            "quarantine_security" => self.quarantine_security(&args),
            "read_cache" => self.read_cache(&args),
            "write_cache" => self.write_cache(&args),
            other => Err(ProxyError::NotFound(format!("tool '{}'", other))),
        }
    }

    fn effective_top_k(&self, requested: Option<i64>) -> usize {
        let configured = self.settings.top_k.clamp(1, TOP_K_CEILING);
        let requested = requested.unwrap_or(configured);
        if requested < 1 {
            configured as usize
        } else {
            requested.min(configured) as usize
        }
    }

    fn retrieve_tools(&self, args: &Value) -> ProxyResult<ToolResponse> {
        let query = args
            .get("query")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let top_k = self.effective_top_k(args.get("topK").and_then(Value::as_i64));

        let hits = if query.trim().is_empty() {
            self.index
                .top_by_invocations(top_k)
                .map_err(ProxyError::Internal)?
        } else {
            self.index
                .search(query, top_k)
                .map_err(ProxyError::Internal)?
        };

        let results: Vec<Value> = hits
            .iter()
            .map(|hit| {
                json!({
                    "name": hit.entry.qualified_name(),
                    "serverName": hit.entry.server_name,
                    "description": hit.entry.description,
                    "score": hit.score,
                })
            })
            .collect();
        Ok(ToolResponse::json(&json!({ "tools": results })))
    }

    async fn call_tool(&self, args: Value) -> ProxyResult<ToolResponse> {
        let name = args
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| ProxyError::Validation("call_tool requires 'name'".to_string()))?
            .to_string();
        let (server, tool) = name.split_once(':').ok_or_else(|| {
            ProxyError::Validation(format!(
                "tool name '{}' must be '<serverName>:<toolName>'",
                name
            ))
        })?;
        let call_args = args.get("args").cloned().unwrap_or(Value::Null);

        if let Err(e) = self.index.record_invocation(server, tool) {
            warn!("failed to bump invocation counter for {}: {:#}", name, e);
        }

        let mut record =
            InvocationRecord::tool_call(server, tool, call_args.to_string());
        let started = Instant::now();
        let outcome = self
            .call_target
            .invoke(server, tool, call_args, Some(self.settings.call_timeout))
            .await;
        record.duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(CallOutcome { text, is_error }) => {
                let (text, truncated) = truncate_response(
                    &text,
                    self.settings.tool_response_limit,
                    &self.settings.tokenizer,
                );
                record.response_text = text.clone();
                record.response_truncated = truncated;
                record.status = if is_error {
                    RecordStatus::Error
                } else {
                    RecordStatus::Ok
                };
                if is_error {
                    record.error_message = Some("upstream reported tool error".to_string());
                }
                self.recorder.record(record);
                Ok(ToolResponse {
                    text,
                    truncated,
                    is_error,
                })
            }
            Err(e) => {
                record.status = RecordStatus::Error;
                record.error_message = Some(e.to_string());
                self.recorder.record(record);
                Err(e)
            }
        }
    }

    fn guard_management(&self, action: &str) -> ProxyResult<()> {
        if self.settings.read_only_mode {
            return Err(ProxyError::Forbidden(format!(
                "'{}' is not available in read-only mode",
                action
            )));
        }
        if self.settings.disable_management {
            return Err(ProxyError::Forbidden(
                "server management is disabled".to_string(),
            ));
        }
        Ok(())
    }

    fn upstream_servers(&self, args: &Value) -> ProxyResult<ToolResponse> {
        let action = args
            .get("action")
            .and_then(Value::as_str)
            .ok_or_else(|| ProxyError::Validation("upstream_servers requires 'action'".into()))?;
        let op_args = args.get("args").cloned().unwrap_or_else(|| json!({}));

        match action {
            "list" => {
                let views = self.manager.fleet();
                Ok(ToolResponse::json(&json!({
                    "servers": views,
                    "health": self.manager.health_summary(),
                })))
            }
            "add" => {
                self.guard_management(action)?;
                let spec: ServerSpec = serde_json::from_value(op_args)
                    .map_err(|e| ProxyError::Validation(format!("invalid server spec: {}", e)))?;
                let name = spec.name.clone();
                self.manager.add_server(spec)?;
                Ok(ToolResponse::json(&json!({"added": name})))
            }
            "update" => {
                self.guard_management(action)?;
                let name = required_str(&op_args, "name")?;
                let patch = op_args
                    .get("patch")
                    .cloned()
                    .ok_or_else(|| ProxyError::Validation("update requires 'patch'".into()))?;
                self.manager.update_server(&name, &patch)?;
                Ok(ToolResponse::json(&json!({"updated": name})))
            }
            "remove" => {
                self.guard_management(action)?;
                let name = required_str(&op_args, "name")?;
                self.manager.delete_server(&name)?;
                Ok(ToolResponse::json(&json!({"removed": name})))
            }
            "enable" => {
                self.guard_management(action)?;
                let name = required_str(&op_args, "name")?;
                let enabled = op_args
                    .get("enabled")
                    .and_then(Value::as_bool)
                    .unwrap_or(true);
                self.manager.set_enabled(&name, enabled)?;
                Ok(ToolResponse::json(&json!({"name": name, "enabled": enabled})))
            }
            "quarantine" => {
                self.guard_management(action)?;
                let name = required_str(&op_args, "name")?;
                let quarantined = op_args
                    .get("quarantined")
                    .and_then(Value::as_bool)
                    .unwrap_or(true);
                self.manager.set_quarantined(&name, quarantined)?;
                Ok(ToolResponse::json(
                    &json!({"name": name, "quarantined": quarantined}),
                ))
            }
            other => Err(ProxyError::Validation(format!(
                "unknown upstream_servers action '{}'",
                other
            ))),
        }
    }

    fn quarantine_security(&self, args: &Value) -> ProxyResult<ToolResponse> {
        let action = args
            .get("action")
            .and_then(Value::as_str)
            .ok_or_else(|| ProxyError::Validation("quarantine_security requires 'action'".into()))?;

        match action {
            "list" => {
                let quarantined: Vec<Value> = self
                    .manager
                    .fleet()
                    .into_iter()
                    .filter(|view| view.spec.quarantined)
                    .map(|view| {
                        json!({
                            "name": view.spec.name,
                            "toolCount": view.state.tool_count,
                            "phase": view.state.phase.as_str(),
                        })
                    })
                    .collect();
                Ok(ToolResponse::json(&json!({"quarantined": quarantined})))
            }
            "inspect" => {
                let server = required_str(args, "serverName")?;
                let tools: Vec<Value> = self
                    .manager
                    .tools_of(&server)?
                    .into_iter()
                    .map(|entry| {
                        json!({
                            "name": entry.tool_name,
                            "description": entry.description,
                            "paramsSchema": serde_json::from_str::<Value>(&entry.params_schema)
                                .unwrap_or(Value::Null),
                            "hash": entry.hash,
                        })
                    })
                    .collect();
                debug!("quarantine inspection of '{}': {} tools", server, tools.len());
                Ok(ToolResponse::json(&json!({"serverName": server, "tools": tools})))
            }
            "release" => {
                self.guard_management("release")?;
                let server = required_str(args, "serverName")?;
                self.manager.set_quarantined(&server, false)?;
                Ok(ToolResponse::json(&json!({"released": server})))
            }
            other => Err(ProxyError::Validation(format!(
                "unknown quarantine_security action '{}'",
                other
            ))),
        }
    }

    fn read_cache(&self, args: &Value) -> ProxyResult<ToolResponse> {
        let key = required_str(args, "key")?;
        match self.store.get(BUCKET_KV, &key) {
            Ok(Some(bytes)) => Ok(ToolResponse::ok(
                String::from_utf8_lossy(&bytes).to_string(),
            )),
            Ok(None) => Err(ProxyError::NotFound(format!("cache key '{}'", key))),
            Err(StoreError::Closed) => Err(ProxyError::Transient("store is shutting down".into())),
            Err(e) => Err(ProxyError::Internal(e.into())),
        }
    }

    fn write_cache(&self, args: &Value) -> ProxyResult<ToolResponse> {
        let key = required_str(args, "key")?;
        let value = required_str(args, "value")?;
        match self.store.put(BUCKET_KV, &key, value.as_bytes()) {
            Ok(()) => Ok(ToolResponse::json(&json!({"written": key}))),
            Err(StoreError::Closed) => Err(ProxyError::Transient("store is shutting down".into())),
            Err(e) => Err(ProxyError::Internal(e.into())),
        }
    }
}

fn required_str(args: &Value, field: &str) -> ProxyResult<String> {
    args.get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .ok_or_else(|| ProxyError::Validation(format!("missing required field '{}'", field)))
}
