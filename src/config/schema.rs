use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// OAuth 2.1 parameters that may never appear in `oauth.extraParams`.
pub const RESERVED_OAUTH_PARAMS: &[&str] = &[
    "client_id",
    "client_secret",
    "redirect_uri",
    "response_type",
    "scope",
    "state",
    "code_challenge",
    "code_challenge_method",
    "grant_type",
    "code",
    "refresh_token",
    "code_verifier",
    "token_type",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Protocol {
    Stdio,
    Http,
    Sse,
    StreamableHttp,
    #[default]
    Auto,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Stdio => "stdio",
            Protocol::Http => "http",
            Protocol::Sse => "sse",
            Protocol::StreamableHttp => "streamable-http",
            Protocol::Auto => "auto",
        }
    }

    pub fn is_network(self) -> bool {
        matches!(
            self,
            Protocol::Http | Protocol::Sse | Protocol::StreamableHttp
        )
    }
}

#[derive(Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct OauthSpec {
    #[serde(default, rename = "clientId")]
    pub client_id: String,
    #[serde(default, rename = "clientSecret")]
    pub client_secret: String,
    #[serde(default, rename = "redirectUri")]
    pub redirect_uri: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default = "default_true", rename = "pkceEnabled")]
    pub pkce_enabled: bool,
    #[serde(default, rename = "extraParams")]
    pub extra_params: HashMap<String, String>,
}

/// Secret fields never reach log output through `Debug`.
fn redact(value: &str) -> &'static str {
    if value.is_empty() { "[empty]" } else { "[REDACTED]" }
}

impl std::fmt::Debug for OauthSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OauthSpec")
            .field("client_id", &self.client_id)
            .field("client_secret", &redact(&self.client_secret))
            .field("redirect_uri", &self.redirect_uri)
            .field("scopes", &self.scopes)
            .field("pkce_enabled", &self.pkce_enabled)
            .field("extra_params", &self.extra_params)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct IsolationSpec {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default, rename = "networkMode")]
    pub network_mode: Option<String>,
    #[serde(default, rename = "extraArgs")]
    pub extra_args: Vec<String>,
    #[serde(default, rename = "workingDir")]
    pub working_dir: Option<String>,
    #[serde(default, rename = "logDriver")]
    pub log_driver: Option<String>,
}

/// Authored configuration of one upstream MCP server.
///
/// `name` and `created` are immutable after creation; updates go through the
/// deep-merge patch path which rejects changes to either.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSpec {
    pub name: String,
    #[serde(default)]
    pub created: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, rename = "workingDir")]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub oauth: Option<OauthSpec>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub quarantined: bool,
    #[serde(default)]
    pub isolation: Option<IsolationSpec>,
}

impl ServerSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            created: Some(Utc::now()),
            updated: Some(Utc::now()),
            protocol: Protocol::Auto,
            command: None,
            args: Vec::new(),
            working_dir: None,
            env: HashMap::new(),
            url: None,
            headers: HashMap::new(),
            oauth: None,
            enabled: true,
            quarantined: false,
            isolation: None,
        }
    }

    /// Concrete protocol to use for connecting. `Auto` resolves to stdio when
    /// a command is present; URL probing picks the network flavor.
    pub fn is_stdio(&self) -> bool {
        self.command.is_some()
    }

    /// Fields whose change requires tearing down and recreating the
    /// connection (as opposed to a cosmetic in-place update).
    pub fn material_fields_differ(&self, other: &ServerSpec) -> bool {
        self.command != other.command
            || self.args != other.args
            || self.working_dir != other.working_dir
            || self.env != other.env
            || self.url != other.url
            || self.headers != other.headers
            || self.oauth != other.oauth
            || self.isolation != other.isolation
            || self.protocol != other.protocol
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, rename = "certsDir")]
    pub certs_dir: Option<String>,
    #[serde(default, rename = "requireClientCert")]
    pub require_client_cert: bool,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            certs_dir: None,
            require_client_cert: false,
        }
    }
}

/// Extra allow/deny rules applied when constructing a child environment
/// for stdio upstreams. Deny patterns are regexes and always win.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct EnvPolicyConfig {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenizerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_token_budget", rename = "maxTokens")]
    pub max_tokens: usize,
}

impl Default for TokenizerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_tokens: default_token_budget(),
        }
    }
}

/// Top-level proxy configuration, persisted as `mcp_config.json`.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: String,
    /// `None` means "generate one"; an explicit empty string disables auth.
    #[serde(default, rename = "apiKey", skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, rename = "socketPath")]
    pub socket_path: Option<String>,
    #[serde(default = "default_log_level", rename = "logLevel")]
    pub log_level: String,
    #[serde(default = "default_top_k", rename = "top_k")]
    pub top_k: i64,
    #[serde(default = "default_tools_limit", rename = "tools_limit")]
    pub tools_limit: i64,
    #[serde(default = "default_tool_response_limit", rename = "tool_response_limit")]
    pub tool_response_limit: usize,
    /// Per-call deadline for upstream tool invocations, in seconds.
    #[serde(default = "default_call_tool_timeout", rename = "callToolTimeout")]
    pub call_tool_timeout: u64,
    #[serde(default)]
    pub tokenizer: TokenizerConfig,
    #[serde(default = "default_true", rename = "enablePrompts")]
    pub enable_prompts: bool,
    #[serde(default, rename = "debugSearch")]
    pub debug_search: bool,
    #[serde(default, rename = "readOnlyMode")]
    pub read_only_mode: bool,
    #[serde(default, rename = "disableManagement")]
    pub disable_management: bool,
    #[serde(default, rename = "disableAutoUpdate")]
    pub disable_auto_update: bool,
    #[serde(default = "default_retention_days", rename = "activity_retention_days")]
    pub activity_retention_days: u32,
    #[serde(default = "default_max_records", rename = "activity_max_records")]
    pub activity_max_records: usize,
    #[serde(
        default = "default_max_response_size",
        rename = "activity_max_response_size"
    )]
    pub activity_max_response_size: usize,
    #[serde(
        default = "default_cleanup_interval",
        rename = "activity_cleanup_interval_min"
    )]
    pub activity_cleanup_interval_min: u64,
    #[serde(default = "default_expiry_warning", rename = "oauth_expiry_warning_hours")]
    pub oauth_expiry_warning_hours: u64,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub environment: EnvPolicyConfig,
    #[serde(default, rename = "mcpServers")]
    pub mcp_servers: Vec<ServerSpec>,
}

impl Default for Config {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty object deserializes to defaults")
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("listen", &self.listen)
            .field(
                "api_key",
                &self.api_key.as_deref().map(redact),
            )
            .field("socket_path", &self.socket_path)
            .field("log_level", &self.log_level)
            .field("top_k", &self.top_k)
            .field("tools_limit", &self.tools_limit)
            .field("tool_response_limit", &self.tool_response_limit)
            .field("call_tool_timeout", &self.call_tool_timeout)
            .field("tokenizer", &self.tokenizer)
            .field("enable_prompts", &self.enable_prompts)
            .field("debug_search", &self.debug_search)
            .field("read_only_mode", &self.read_only_mode)
            .field("disable_management", &self.disable_management)
            .field("disable_auto_update", &self.disable_auto_update)
            .field("activity_retention_days", &self.activity_retention_days)
            .field("activity_max_records", &self.activity_max_records)
            .field("activity_max_response_size", &self.activity_max_response_size)
            .field(
                "activity_cleanup_interval_min",
                &self.activity_cleanup_interval_min,
            )
            .field("oauth_expiry_warning_hours", &self.oauth_expiry_warning_hours)
            .field("tls", &self.tls)
            .field("environment", &self.environment)
            .field("mcp_servers", &self.mcp_servers)
            .finish()
    }
}

impl Config {
    pub fn find_server(&self, name: &str) -> Option<&ServerSpec> {
        self.mcp_servers.iter().find(|s| s.name == name)
    }

    pub fn find_server_mut(&mut self, name: &str) -> Option<&mut ServerSpec> {
        self.mcp_servers.iter_mut().find(|s| s.name == name)
    }

    /// Whether façade auth is enabled (an explicit empty key disables it).
    pub fn auth_enabled(&self) -> bool {
        match &self.api_key {
            Some(key) => !key.is_empty(),
            None => true,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

pub(crate) fn default_top_k() -> i64 {
    5
}

pub(crate) fn default_tools_limit() -> i64 {
    15
}

fn default_tool_response_limit() -> usize {
    20_000
}

fn default_call_tool_timeout() -> u64 {
    120
}

fn default_token_budget() -> usize {
    8_000
}

fn default_retention_days() -> u32 {
    30
}

fn default_max_records() -> usize {
    10_000
}

fn default_max_response_size() -> usize {
    8_192
}

fn default_cleanup_interval() -> u64 {
    60
}

fn default_expiry_warning() -> u64 {
    1
}
