use crate::models::gpu::GpuMetrics;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// A command received from the Hub over the mTLS channel.
///
/// The payload is left as raw JSON; each command type extracts the fields it
/// needs and supplies defaults for the rest.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct HubCommand {
    pub id: String,
    #[serde(rename = "type")]
    pub command_type: String,
    #[serde(default)]
    pub payload: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Ok,
    Error,
}

impl fmt::Display for AckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AckStatus::Ok => write!(f, "ok"),
            AckStatus::Error => write!(f, "error"),
        }
    }
}

/// Acknowledgment sent back to the Hub for one [`HubCommand`].
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct CommandAck {
    pub command_id: String,
    pub status: AckStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Map<String, Value>>,
}

impl CommandAck {
    pub fn ok(command_id: impl Into<String>) -> Self {
        Self {
            command_id: command_id.into(),
            status: AckStatus::Ok,
            error: None,
            payload: None,
        }
    }

    pub fn ok_with_payload(command_id: impl Into<String>, payload: Map<String, Value>) -> Self {
        Self {
            command_id: command_id.into(),
            status: AckStatus::Ok,
            error: None,
            payload: Some(payload),
        }
    }

    pub fn error(command_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            command_id: command_id.into(),
            status: AckStatus::Error,
            error: Some(error.into()),
            payload: None,
        }
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.error = Some(warning.into());
        self
    }
}

/// Unsolicited node → Hub frame carrying the node mode and current GPU
/// samples. Needs no reply.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct HeartbeatFrame {
    #[serde(rename = "type")]
    pub frame_type: String,
    pub payload: HeartbeatPayload,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct HeartbeatPayload {
    pub mode: String,
    pub gpu_metrics: Vec<GpuMetrics>,
}

impl HeartbeatFrame {
    pub fn new(mode: impl Into<String>, gpu_metrics: Vec<GpuMetrics>) -> Self {
        Self {
            frame_type: "heartbeat".to_string(),
            payload: HeartbeatPayload {
                mode: mode.into(),
                gpu_metrics,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_parses_inbound_frame() {
        let raw = r#"{"id":"c1","type":"start_rental","payload":{"session_id":"s1","cpu_count":4}}"#;
        let cmd: HubCommand = serde_json::from_str(raw).unwrap();

        assert_eq!(cmd.id, "c1");
        assert_eq!(cmd.command_type, "start_rental");
        assert_eq!(cmd.payload["session_id"], "s1");
        assert_eq!(cmd.payload["cpu_count"], 4);
    }

    #[test]
    fn test_command_tolerates_missing_payload() {
        let cmd: HubCommand = serde_json::from_str(r#"{"id":"c2","type":"noop"}"#).unwrap();
        assert!(cmd.payload.is_empty());
    }

    #[test]
    fn test_ack_ok_omits_optional_fields() {
        let ack = CommandAck::ok("c1");
        let value = serde_json::to_value(&ack).unwrap();

        assert_eq!(value["command_id"], "c1");
        assert_eq!(value["status"], "ok");
        assert!(value.get("error").is_none());
        assert!(value.get("payload").is_none());
    }

    #[test]
    fn test_ack_error_carries_message() {
        let ack = CommandAck::error("c9", "unknown command");
        let value = serde_json::to_value(&ack).unwrap();

        assert_eq!(value["status"], "error");
        assert_eq!(value["error"], "unknown command");
    }

    #[test]
    fn test_ack_ok_with_warning_keeps_ok_status() {
        let ack = CommandAck::ok("c3").with_warning("stop warning: container already gone");
        let value = serde_json::to_value(&ack).unwrap();

        assert_eq!(value["status"], "ok");
        assert_eq!(value["error"], "stop warning: container already gone");
    }

    #[test]
    fn test_heartbeat_frame_shape() {
        let frame = HeartbeatFrame::new(
            "master",
            vec![GpuMetrics {
                uuid: "GPU-1".to_string(),
                name: "NVIDIA RTX 4090".to_string(),
                memory_total_mb: 24564,
                memory_used_mb: 512,
                gpu_util_percent: 3,
                memory_util_percent: 1,
                temperature_c: 40,
            }],
        );

        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value, json!({
            "type": "heartbeat",
            "payload": {
                "mode": "master",
                "gpu_metrics": [{
                    "uuid": "GPU-1",
                    "name": "NVIDIA RTX 4090",
                    "memory_total_mb": 24564,
                    "memory_used_mb": 512,
                    "gpu_util_percent": 3,
                    "memory_util_percent": 1,
                    "temperature_c": 40
                }]
            }
        }));
    }
}
