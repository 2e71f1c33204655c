use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Connection lifecycle of one upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Initializing,
    StartingCore,
    Connecting,
    Connected,
    Ready,
    Reconnecting,
    PendingAuth,
    AuthError,
    Disconnected,
    Disabled,
    Failed,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Initializing => "initializing",
            Phase::StartingCore => "starting_core",
            Phase::Connecting => "connecting",
            Phase::Connected => "connected",
            Phase::Ready => "ready",
            Phase::Reconnecting => "reconnecting",
            Phase::PendingAuth => "pending_auth",
            Phase::AuthError => "auth_error",
            Phase::Disconnected => "disconnected",
            Phase::Disabled => "disabled",
            Phase::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    #[default]
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            HealthLevel::Healthy => "healthy",
            HealthLevel::Degraded => "degraded",
            HealthLevel::Unhealthy => "unhealthy",
        }
    }
}

/// Runtime state of one upstream. Owned by the manager; everything else
/// sees read-only snapshots via the event bus or `Fleet()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamState {
    pub phase: Phase,
    #[serde(rename = "lastError", skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(rename = "retryCount")]
    pub retry_count: u32,
    #[serde(rename = "lastRetryTime", skip_serializing_if = "Option::is_none")]
    pub last_retry_time: Option<DateTime<Utc>>,
    #[serde(rename = "shouldRetry")]
    pub should_retry: bool,
    #[serde(rename = "toolCount")]
    pub tool_count: usize,
    pub authenticated: bool,
    #[serde(rename = "healthLevel")]
    pub health_level: HealthLevel,
    /// Remediation hint: `""`, `login`, `set_secret`, `configure`, `restart`.
    #[serde(rename = "healthAction")]
    pub health_action: String,
}

impl Default for UpstreamState {
    fn default() -> Self {
        Self {
            phase: Phase::Initializing,
            last_error: None,
            retry_count: 0,
            last_retry_time: None,
            should_retry: true,
            tool_count: 0,
            // Assumed until an auth failure proves otherwise, so tools
            // indexed in a previous run stay searchable while connecting.
            authenticated: true,
            health_level: HealthLevel::Healthy,
            health_action: String::new(),
        }
    }
}

/// How a connection or call failure should drive the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureClass {
    /// Transport blip (EOF, timeout, refused): retry with backoff.
    Transient,
    /// Executable missing or permanently unresolvable: stop retrying.
    Fatal { action: &'static str },
    /// Authentication needed: park in `PendingAuth` until the user acts.
    AuthRequired,
    /// A `keyring:`/`env:` reference failed to resolve.
    SecretMissing,
    /// Upstream answered but the payload was malformed.
    SchemaMismatch,
}

impl FailureClass {
    pub fn should_retry(&self) -> bool {
        matches!(self, FailureClass::Transient)
    }

    pub fn health_level(&self) -> HealthLevel {
        match self {
            FailureClass::Transient | FailureClass::SchemaMismatch => HealthLevel::Degraded,
            FailureClass::Fatal { .. }
            | FailureClass::AuthRequired
            | FailureClass::SecretMissing => HealthLevel::Unhealthy,
        }
    }

    pub fn health_action(&self) -> &'static str {
        match self {
            FailureClass::Transient | FailureClass::SchemaMismatch => "",
            FailureClass::Fatal { action } => action,
            FailureClass::AuthRequired => "login",
            FailureClass::SecretMissing => "set_secret",
        }
    }
}

/// Classify a connection-path error message.
///
/// Works on the rendered error because the rmcp transport stack erases
/// concrete error types before they reach us.
pub fn classify_failure(message: &str) -> FailureClass {
    let lower = message.to_lowercase();
    if lower.contains("401") || lower.contains("unauthorized") || lower.contains("authentication") {
        return FailureClass::AuthRequired;
    }
    if lower.contains("no such file")
        || lower.contains("not found in path")
        || lower.contains("program not found")
        || lower.contains("executable not found")
        || lower.contains("os error 2")
    {
        return FailureClass::Fatal {
            action: "configure",
        };
    }
    if lower.contains("failed to lookup address")
        || lower.contains("nxdomain")
        || lower.contains("name or service not known")
        || lower.contains("dns error")
    {
        return FailureClass::Fatal {
            action: "configure",
        };
    }
    if lower.contains("could not be resolved") && lower.contains("keyring") {
        return FailureClass::SecretMissing;
    }
    if lower.contains("missing field")
        || lower.contains("invalid type")
        || lower.contains("schema mismatch")
    {
        return FailureClass::SchemaMismatch;
    }
    FailureClass::Transient
}

/// Whether a stdio command can be resolved to an executable. Used ahead of
/// spawning so exec-not-found is classified without a doomed process start.
pub fn command_resolvable(command: &str) -> bool {
    if command.contains(std::path::MAIN_SEPARATOR) {
        return std::path::Path::new(command).exists();
    }
    which::which(command).is_ok()
}
