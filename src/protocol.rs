//! Wire types for the browser socket and the leader's HTTP surface.
//!
//! Browser-side messages are JSON text frames tagged by a `type` field.
//! They are parsed exactly once, at the WebSocket boundary, into
//! [`BrowserMessage`] — handlers never probe untyped JSON.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Inbound message from a browser transport.
///
/// Unknown `type` tags and malformed payloads fail deserialization; the
/// socket loop logs and drops them without touching registry state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum BrowserMessage {
    /// First occurrence on a transport establishes the session identity.
    /// Repeats act as metadata updates.
    PageInfo {
        session_id: String,
        payload: PageMetadata,
    },
    /// Periodic liveness signal; refreshes metadata without altering identity.
    Heartbeat {
        session_id: String,
        payload: HeartbeatPayload,
    },
    /// Correlated reply to a previously sent command envelope.
    CommandResponse {
        session_id: String,
        command_id: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// Page metadata carried by `page_info`. All fields optional: only fields
/// present in the payload overwrite existing session state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageMetadata {
    pub url: Option<String>,
    pub title: Option<String>,
    pub user_agent: Option<String>,
}

/// Heartbeat payload. The browser-side timestamp is informational; the
/// registry tracks liveness with its own clock.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPayload {
    pub url: Option<String>,
    pub title: Option<String>,
    pub timestamp: Option<u64>,
}

/// A logical command addressed to one tab. The payload is opaque to the
/// routing layer; only `type` is inspected (to fill the envelope).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    #[serde(rename = "type")]
    pub command_type: String,
    #[serde(default)]
    pub payload: Value,
}

/// Outbound envelope written to the browser transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub session_id: String,
    pub id: String,
    pub command_type: String,
    pub payload: Value,
}

impl CommandEnvelope {
    pub fn new(session_id: &str, command_id: &str, command: Command) -> Self {
        Self {
            kind: "command".to_string(),
            session_id: session_id.to_string(),
            id: command_id.to_string(),
            command_type: command.command_type,
            payload: command.payload,
        }
    }
}

/// One connected session as reported by `GET /api/connections`.
///
/// `last_seen` is unix-epoch milliseconds of the last inbound message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: String,
    pub url: Option<String>,
    pub title: Option<String>,
    pub user_agent: Option<String>,
    pub connected: bool,
    pub last_seen: u64,
}

/// Body of `POST /api/command`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    pub command: Command,
    pub session_id: String,
    /// Optional per-call deadline override in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_page_info() {
        let raw = r#"{
            "type": "page_info",
            "sessionId": "tab-1",
            "payload": {"url": "https://example.com", "title": "Example", "userAgent": "UA/1.0"}
        }"#;
        let msg: BrowserMessage = serde_json::from_str(raw).unwrap();
        match msg {
            BrowserMessage::PageInfo { session_id, payload } => {
                assert_eq!(session_id, "tab-1");
                assert_eq!(payload.url.as_deref(), Some("https://example.com"));
                assert_eq!(payload.title.as_deref(), Some("Example"));
                assert_eq!(payload.user_agent.as_deref(), Some("UA/1.0"));
            }
            other => panic!("expected page_info, got {:?}", other),
        }
    }

    #[test]
    fn parse_page_info_partial_payload() {
        let raw = r#"{"type": "page_info", "sessionId": "tab-1", "payload": {"url": "https://a"}}"#;
        let msg: BrowserMessage = serde_json::from_str(raw).unwrap();
        match msg {
            BrowserMessage::PageInfo { payload, .. } => {
                assert_eq!(payload.url.as_deref(), Some("https://a"));
                assert!(payload.title.is_none());
                assert!(payload.user_agent.is_none());
            }
            other => panic!("expected page_info, got {:?}", other),
        }
    }

    #[test]
    fn parse_heartbeat() {
        let raw = r#"{
            "type": "heartbeat",
            "sessionId": "tab-2",
            "payload": {"url": "https://b", "title": "B", "timestamp": 1700000000000}
        }"#;
        let msg: BrowserMessage = serde_json::from_str(raw).unwrap();
        match msg {
            BrowserMessage::Heartbeat { session_id, payload } => {
                assert_eq!(session_id, "tab-2");
                assert_eq!(payload.timestamp, Some(1_700_000_000_000));
            }
            other => panic!("expected heartbeat, got {:?}", other),
        }
    }

    #[test]
    fn parse_command_response_success() {
        let raw = r#"{
            "type": "command_response",
            "sessionId": "tab-1",
            "commandId": "c-42",
            "success": true,
            "data": {"clicked": true}
        }"#;
        let msg: BrowserMessage = serde_json::from_str(raw).unwrap();
        match msg {
            BrowserMessage::CommandResponse { command_id, success, data, error, .. } => {
                assert_eq!(command_id, "c-42");
                assert!(success);
                assert_eq!(data.unwrap()["clicked"], true);
                assert!(error.is_none());
            }
            other => panic!("expected command_response, got {:?}", other),
        }
    }

    #[test]
    fn parse_command_response_failure() {
        let raw = r#"{
            "type": "command_response",
            "sessionId": "tab-1",
            "commandId": "c-43",
            "success": false,
            "error": "element not found"
        }"#;
        let msg: BrowserMessage = serde_json::from_str(raw).unwrap();
        match msg {
            BrowserMessage::CommandResponse { success, error, data, .. } => {
                assert!(!success);
                assert_eq!(error.as_deref(), Some("element not found"));
                assert!(data.is_none());
            }
            other => panic!("expected command_response, got {:?}", other),
        }
    }

    #[test]
    fn unknown_type_tag_rejected() {
        let raw = r#"{"type": "telemetry", "sessionId": "tab-1"}"#;
        assert!(serde_json::from_str::<BrowserMessage>(raw).is_err());
    }

    #[test]
    fn missing_tag_rejected() {
        let raw = r#"{"sessionId": "tab-1", "payload": {}}"#;
        assert!(serde_json::from_str::<BrowserMessage>(raw).is_err());
    }

    #[test]
    fn malformed_json_rejected() {
        assert!(serde_json::from_str::<BrowserMessage>("{not json").is_err());
    }

    #[test]
    fn command_envelope_wire_shape() {
        let env = CommandEnvelope::new(
            "tab-1",
            "cmd-7",
            Command {
                command_type: "click".into(),
                payload: serde_json::json!({"selector": "#submit"}),
            },
        );
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["type"], "command");
        assert_eq!(value["sessionId"], "tab-1");
        assert_eq!(value["id"], "cmd-7");
        assert_eq!(value["commandType"], "click");
        assert_eq!(value["payload"]["selector"], "#submit");
    }

    #[test]
    fn command_request_defaults() {
        let raw = r#"{"command": {"type": "snapshot"}, "sessionId": "tab-9"}"#;
        let req: CommandRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(req.command.command_type, "snapshot");
        assert_eq!(req.command.payload, Value::Null);
        assert_eq!(req.session_id, "tab-9");
        assert!(req.timeout_ms.is_none());
    }

    #[test]
    fn session_info_round_trip() {
        let info = SessionInfo {
            session_id: "tab-1".into(),
            url: Some("https://example.com".into()),
            title: None,
            user_agent: Some("UA".into()),
            connected: true,
            last_seen: 1_700_000_000_000,
        };
        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains("\"sessionId\""));
        assert!(json.contains("\"lastSeen\""));
        let back: SessionInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back, info);
    }
}
