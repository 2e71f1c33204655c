use crate::errors::ProxyError;
use crate::router::ProxyRouter;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, error};
use uuid::Uuid;

pub const JSONRPC_VERSION: &str = "2.0";

const PARSE_ERROR: i64 = -32700;
const INVALID_REQUEST: i64 = -32600;

#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
}

/// MCP method dispatch shared by the stdio and HTTP façades.
pub struct McpFacade {
    router: Arc<ProxyRouter>,
    enable_prompts: bool,
}

impl McpFacade {
    pub fn new(router: Arc<ProxyRouter>, enable_prompts: bool) -> Self {
        Self {
            router,
            enable_prompts,
        }
    }

    /// Handle a raw JSON-RPC payload: a single request or a batch. Returns
    /// the response value, or `None` when nothing needs to be sent
    /// (notifications only).
    pub async fn handle_value(&self, payload: Value) -> Option<Value> {
        match payload {
            Value::Array(batch) => {
                if batch.is_empty() {
                    return Some(error_response(
                        Value::Null,
                        INVALID_REQUEST,
                        "empty batch",
                        None,
                    ));
                }
                let mut responses = Vec::new();
                for item in batch {
                    if let Some(response) = self.handle_single(item).await {
                        responses.push(response);
                    }
                }
                if responses.is_empty() {
                    None
                } else {
                    Some(Value::Array(responses))
                }
            }
            other => self.handle_single(other).await,
        }
    }

    /// Parse error path for raw text input (stdio framing).
    pub fn parse_error() -> Value {
        error_response(Value::Null, PARSE_ERROR, "invalid JSON", None)
    }

    async fn handle_single(&self, payload: Value) -> Option<Value> {
        let request: RpcRequest = match serde_json::from_value(payload) {
            Ok(request) => request,
            Err(e) => {
                return Some(error_response(
                    Value::Null,
                    INVALID_REQUEST,
                    &format!("invalid request: {}", e),
                    None,
                ));
            }
        };

        let id = request.id.clone();
        let is_notification = id.is_none();
        let result = self.dispatch(&request).await;

        if is_notification {
            return None;
        }
        let id = id.unwrap_or(Value::Null);
        Some(match result {
            Ok(result) => json!({
                "jsonrpc": JSONRPC_VERSION,
                "id": id,
                "result": result,
            }),
            Err(e) => {
                let (code, message, data) = render_error(&e);
                error_response(id, code, &message, data)
            }
        })
    }

    async fn dispatch(&self, request: &RpcRequest) -> Result<Value, ProxyError> {
        debug!("mcp request: {}", request.method);
        match request.method.as_str() {
            "initialize" => Ok(json!({
                "protocolVersion": crate::PROTOCOL_VERSION,
                "capabilities": {
                    "tools": {"listChanged": true},
                    "prompts": {},
                    "resources": {},
                },
                "serverInfo": {
                    "name": "mcpproxy",
                    "version": crate::VERSION,
                },
            })),
            "ping" => Ok(json!({})),
            "notifications/initialized" | "notifications/cancelled" => Ok(Value::Null),
            "tools/list" => Ok(json!({"tools": ProxyRouter::tool_definitions()})),
            "tools/call" => self.tools_call(request.params.as_ref()).await,
            "prompts/list" => {
                let prompts = if self.enable_prompts {
                    vec![json!({
                        "name": "proxy_usage",
                        "description": "How to discover and call upstream tools through this proxy.",
                    })]
                } else {
                    Vec::new()
                };
                Ok(json!({"prompts": prompts}))
            }
            "prompts/get" => {
                if !self.enable_prompts {
                    return Err(ProxyError::NotFound("prompts are disabled".into()));
                }
                Ok(json!({
                    "description": "How to discover and call upstream tools through this proxy.",
                    "messages": [{
                        "role": "user",
                        "content": {
                            "type": "text",
                            "text": "First call retrieve_tools with a short description of what you need. Then invoke the best match with call_tool using its routed '<serverName>:<toolName>' name.",
                        },
                    }],
                }))
            }
            "resources/list" => Ok(json!({"resources": []})),
            other => Err(ProxyError::NotFound(format!("method '{}'", other))),
        }
    }

    async fn tools_call(&self, params: Option<&Value>) -> Result<Value, ProxyError> {
        let params =
            params.ok_or_else(|| ProxyError::Validation("tools/call requires params".into()))?;
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| ProxyError::Validation("tools/call requires 'name'".into()))?;
        let arguments = params
            .get("arguments")
            .cloned()
            .unwrap_or_else(|| json!({}));

        let response = self.router.dispatch(name, arguments).await?;

        let mut content = json!({
            "type": "text",
            "text": response.text,
        });
        if response.truncated {
            content["responseTruncated"] = Value::Bool(true);
        }
        Ok(json!({
            "content": [content],
            "isError": response.is_error,
        }))
    }
}

/// Map a proxy error to the MCP error envelope. Unknown internals get a
/// correlation id logged server-side and a generic message on the wire.
fn render_error(error: &ProxyError) -> (i64, String, Option<Value>) {
    match error {
        ProxyError::Internal(inner) => {
            let correlation = Uuid::new_v4();
            error!("internal error [{}]: {:#}", correlation, inner);
            (
                -32603,
                "internal error".to_string(),
                Some(json!({"correlationId": correlation.to_string()})),
            )
        }
        other => {
            let data = json!({
                "kind": kind_label(other),
                "httpStatus": other.http_status(),
                "retryable": other.is_retryable(),
            });
            (other.rpc_code(), other.to_string(), Some(data))
        }
    }
}

fn kind_label(error: &ProxyError) -> &'static str {
    match error {
        ProxyError::Validation(_) | ProxyError::ImmutableField { .. } => "validation",
        ProxyError::NotFound(_) => "not_found",
        ProxyError::Unauthorized(_) => "unauthorized",
        ProxyError::Forbidden(_) => "forbidden",
        ProxyError::UpstreamNotReady { .. } => "upstream_not_ready",
        ProxyError::Upstream { .. } => "upstream_error",
        ProxyError::AuthRequired { .. } => "auth_required",
        ProxyError::Transient(_) => "transient",
        ProxyError::Fatal(_) => "fatal",
        ProxyError::Corrupted(_) => "corrupted",
        ProxyError::Internal(_) => "internal",
    }
}

fn error_response(id: Value, code: i64, message: &str, data: Option<Value>) -> Value {
    let mut error = json!({
        "code": code,
        "message": message,
    });
    if let Some(data) = data {
        error["data"] = data;
    }
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "error": error,
    })
}
