use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Fleet-level health aggregate, published on every change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetSummary {
    pub total: usize,
    pub enabled: usize,
    pub disabled: usize,
    pub connected: usize,
    pub errors: usize,
    pub quarantined: usize,
}

/// Per-server health shape consumed by SSE subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerHealthEvent {
    #[serde(rename = "serverName")]
    pub server_name: String,
    pub level: String,
    #[serde(rename = "adminState")]
    pub admin_state: String,
    pub action: String,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Broadcast event stream. The `event` tag doubles as the SSE event name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ProxyEvent {
    #[serde(rename = "status.phase")]
    StatusPhase {
        #[serde(rename = "serverName")]
        server_name: String,
        phase: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    #[serde(rename = "fleet.changed")]
    FleetChanged { summary: FleetSummary },
    #[serde(rename = "server.health")]
    ServerHealth(ServerHealthEvent),
    #[serde(rename = "oauth.prompt")]
    OauthPrompt {
        #[serde(rename = "serverName")]
        server_name: String,
        url: String,
    },
    #[serde(rename = "oauth.completed")]
    OauthCompleted {
        #[serde(rename = "serverName")]
        server_name: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename = "activity.recorded")]
    ActivityRecorded { id: String },
    #[serde(rename = "server.progress")]
    Progress {
        #[serde(rename = "serverName")]
        server_name: String,
        progress: serde_json::Value,
    },
    #[serde(rename = "env.warning")]
    EnvWarning {
        #[serde(rename = "serverName")]
        server_name: String,
        variable: String,
        message: String,
    },
}

impl ProxyEvent {
    /// SSE `event:` tag for this event.
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyEvent::StatusPhase { .. } => "status.phase",
            ProxyEvent::FleetChanged { .. } => "fleet.changed",
            ProxyEvent::ServerHealth(_) => "server.health",
            ProxyEvent::OauthPrompt { .. } => "oauth.prompt",
            ProxyEvent::OauthCompleted { .. } => "oauth.completed",
            ProxyEvent::ActivityRecorded { .. } => "activity.recorded",
            ProxyEvent::Progress { .. } => "server.progress",
            ProxyEvent::EnvWarning { .. } => "env.warning",
        }
    }
}

/// Snapshot handed to new subscribers before any deltas.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub fleet: FleetSummary,
    /// Last known phase per server.
    pub phases: BTreeMap<String, String>,
    /// Last known health per server.
    pub health: BTreeMap<String, ServerHealthEvent>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_tag_matches_kind() {
        let ev = ProxyEvent::StatusPhase {
            server_name: "a".into(),
            phase: "ready".into(),
            detail: None,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["event"], "status.phase");
        assert_eq!(ev.kind(), "status.phase");
    }

    #[test]
    fn server_health_shape() {
        let ev = ProxyEvent::ServerHealth(ServerHealthEvent {
            server_name: "gh".into(),
            level: "unhealthy".into(),
            admin_state: "enabled".into(),
            action: "login".into(),
            summary: "authentication required".into(),
            detail: None,
        });
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["data"]["serverName"], "gh");
        assert_eq!(json["data"]["action"], "login");
        let back: ProxyEvent = serde_json::from_value(json).unwrap();
        assert!(matches!(back, ProxyEvent::ServerHealth(_)));
    }
}
