pub mod recorder;

pub use recorder::{ActivityFilter, ActivityRecorder, RecorderSettings};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use ulid::Ulid;

pub const TRUNCATION_SUFFIX: &str = "...[truncated]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordType {
    ToolCall,
    Oauth,
    ServerEvent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Ok,
    Error,
}

/// Immutable log entry for one tool call or auth event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub record_type: RecordType,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "serverName", skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    #[serde(rename = "toolName", skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(rename = "argumentsJSON", default)]
    pub arguments_json: String,
    #[serde(rename = "responseText", default)]
    pub response_text: String,
    #[serde(rename = "responseTruncated", default)]
    pub response_truncated: bool,
    pub status: RecordStatus,
    #[serde(rename = "errorMessage", skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(rename = "durationMs")]
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl InvocationRecord {
    pub fn tool_call(server: &str, tool: &str, arguments_json: String) -> Self {
        Self {
            id: Ulid::new().to_string(),
            record_type: RecordType::ToolCall,
            timestamp: Utc::now(),
            server_name: Some(server.to_string()),
            tool_name: Some(tool.to_string()),
            arguments_json,
            response_text: String::new(),
            response_truncated: false,
            status: RecordStatus::Ok,
            error_message: None,
            duration_ms: 0,
            metadata: BTreeMap::new(),
        }
    }

    pub fn server_event(server: &str, message: String) -> Self {
        Self {
            id: Ulid::new().to_string(),
            record_type: RecordType::ServerEvent,
            timestamp: Utc::now(),
            server_name: Some(server.to_string()),
            tool_name: None,
            arguments_json: String::new(),
            response_text: message,
            response_truncated: false,
            status: RecordStatus::Ok,
            error_message: None,
            duration_ms: 0,
            metadata: BTreeMap::new(),
        }
    }

    pub fn oauth_event(server: &str, status: RecordStatus, message: String) -> Self {
        Self {
            id: Ulid::new().to_string(),
            record_type: RecordType::Oauth,
            timestamp: Utc::now(),
            server_name: Some(server.to_string()),
            tool_name: None,
            arguments_json: String::new(),
            response_text: message,
            response_truncated: false,
            status,
            error_message: None,
            duration_ms: 0,
            metadata: BTreeMap::new(),
        }
    }

    /// Time-ordered storage key: 20-digit zero-padded UnixNano, then the
    /// ULID. Lexicographic key order equals chronological order.
    pub fn storage_key(&self) -> String {
        let nanos = self
            .timestamp
            .timestamp_nanos_opt()
            .unwrap_or_else(|| self.timestamp.timestamp_millis().saturating_mul(1_000_000));
        format!("{:020}_{}", nanos, self.id)
    }
}

/// Storage-key prefix for a cutoff instant; every key below it is older.
pub(crate) fn cutoff_key(at: DateTime<Utc>) -> String {
    let nanos = at
        .timestamp_nanos_opt()
        .unwrap_or_else(|| at.timestamp_millis().saturating_mul(1_000_000));
    format!("{:020}", nanos)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_keys_sort_chronologically() {
        let mut a = InvocationRecord::tool_call("s", "t", String::new());
        let mut b = InvocationRecord::tool_call("s", "t", String::new());
        a.timestamp = Utc::now();
        b.timestamp = a.timestamp + chrono::Duration::nanoseconds(1);
        assert!(a.storage_key() < b.storage_key());
        assert_eq!(a.storage_key().split('_').next().unwrap().len(), 20);
    }

    #[test]
    fn same_instant_sorts_by_id() {
        let ts = Utc::now();
        let mut keys: Vec<String> = (0..5)
            .map(|_| {
                let mut r = InvocationRecord::tool_call("s", "t", String::new());
                r.timestamp = ts;
                r.storage_key()
            })
            .collect();
        let mut sorted = keys.clone();
        sorted.sort();
        keys.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn record_serializes_with_wire_names() {
        let mut record = InvocationRecord::tool_call("gh", "create_issue", "{}".into());
        record.status = RecordStatus::Error;
        record.error_message = Some("boom".into());
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["type"], "tool_call");
        assert_eq!(json["serverName"], "gh");
        assert_eq!(json["status"], "error");
        assert_eq!(json["errorMessage"], "boom");
        assert!(json["durationMs"].is_u64());
    }

    #[test]
    fn cutoff_key_is_prefix_shaped() {
        let key = cutoff_key(Utc::now());
        assert_eq!(key.len(), 20);
        assert!(key.chars().all(|c| c.is_ascii_digit()));
    }
}
