use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json;

pub const DEFAULT_TOPIC_PREFIX: &str = "graylogic";
pub const PROTOCOL: &str = "knx";

/* Error codes used in acks and responses */
pub const ERR_DEVICE_UNREACHABLE: &str = "DEVICE_UNREACHABLE";
pub const ERR_INVALID_COMMAND: &str = "INVALID_COMMAND";
pub const ERR_INVALID_PARAMETERS: &str = "INVALID_PARAMETERS";
pub const ERR_PROTOCOL_ERROR: &str = "PROTOCOL_ERROR";
pub const ERR_TIMEOUT: &str = "TIMEOUT";
pub const ERR_NOT_CONFIGURED: &str = "NOT_CONFIGURED";
pub const ERR_BRIDGE_ERROR: &str = "BRIDGE_ERROR";

/// Current time as RFC-3339 UTC, the timestamp format of every envelope.
pub fn now_rfc3339() -> String {
    return Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
}

/* ------------------------------------------------------------------ */
/* Topic scheme: <prefix>/<kind>/knx[/<addressing>], where a group
   address in the addressing slot has its slashes percent-encoded. */

pub fn encode_ga_for_topic(ga: &str) -> String {
    return ga.replace('/', "%2F");
}

pub fn command_topic_filter(prefix: &str) -> String {
    return format!("{}/command/{}/#", prefix, PROTOCOL);
}

pub fn request_topic_filter(prefix: &str) -> String {
    return format!("{}/request/{}/#", prefix, PROTOCOL);
}

pub fn ack_topic(prefix: &str, ga: &str) -> String {
    return format!("{}/ack/{}/{}", prefix, PROTOCOL, encode_ga_for_topic(ga));
}

pub fn state_topic(prefix: &str, ga: &str) -> String {
    return format!("{}/state/{}/{}", prefix, PROTOCOL, encode_ga_for_topic(ga));
}

pub fn response_topic(prefix: &str, request_id: &str) -> String {
    return format!("{}/response/{}/{}", prefix, PROTOCOL, request_id);
}

pub fn health_topic(prefix: &str) -> String {
    return format!("{}/health/{}", prefix, PROTOCOL);
}

/* ------------------------------------------------------------------ */
/* Envelopes */

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    pub device_id: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Accepted,
    Queued,
    Failed,
    Timeout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorInfo {
    pub fn new(code: &str, message: String) -> Self {
        return ErrorInfo {
            code: code.to_string(),
            message,
            retries: None,
            details: None,
        };
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckMessage {
    pub command_id: String,
    pub timestamp: String,
    pub device_id: String,
    pub status: AckStatus,
    pub protocol: String,
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl AckMessage {
    pub fn accepted(command_id: &str, device_id: &str, address: &str) -> Self {
        return AckMessage {
            command_id: command_id.to_string(),
            timestamp: now_rfc3339(),
            device_id: device_id.to_string(),
            status: AckStatus::Accepted,
            protocol: PROTOCOL.to_string(),
            address: address.to_string(),
            error: None,
        };
    }

    pub fn failed(command_id: &str, device_id: &str, address: &str, code: &str, message: String) -> Self {
        let status = if code == ERR_TIMEOUT { AckStatus::Timeout } else { AckStatus::Failed };
        return AckMessage {
            command_id: command_id.to_string(),
            timestamp: now_rfc3339(),
            device_id: device_id.to_string(),
            status,
            protocol: PROTOCOL.to_string(),
            address: address.to_string(),
            error: Some(ErrorInfo::new(code, message)),
        };
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateMessage {
    pub device_id: String,
    pub timestamp: String,
    pub state: serde_json::Map<String, serde_json::Value>,
    pub protocol: String,
    pub address: String,
}

impl StateMessage {
    pub fn new(device_id: &str, address: &str, state: serde_json::Map<String, serde_json::Value>) -> Self {
        return StateMessage {
            device_id: device_id.to_string(),
            timestamp: now_rfc3339(),
            state,
            protocol: PROTOCOL.to_string(),
            address: address.to_string(),
        };
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMessage {
    pub request_id: String,
    pub timestamp: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl ResponseMessage {
    pub fn success(request_id: &str, data: serde_json::Value) -> Self {
        return ResponseMessage {
            request_id: request_id.to_string(),
            timestamp: now_rfc3339(),
            success: true,
            data: Some(data),
            error: None,
        };
    }

    pub fn failed(request_id: &str, code: &str, message: String) -> Self {
        return ResponseMessage {
            request_id: request_id.to_string(),
            timestamp: now_rfc3339(),
            success: false,
            data: None,
            error: Some(ErrorInfo::new(code, message)),
        };
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionHealth {
    pub status: String,
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connected_since: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatistics {
    pub received: u64,
    pub sent: u64,
    pub errors: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthMessage {
    pub bridge: String,
    pub timestamp: String,
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub connection: ConnectionHealth,
    pub statistics: HealthStatistics,
    pub devices_managed: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LwtMessage {
    pub bridge: String,
    pub timestamp: String,
    pub status: String,
    pub reason: String,
}

impl LwtMessage {
    pub fn new(bridge: &str) -> Self {
        return LwtMessage {
            bridge: bridge.to_string(),
            timestamp: now_rfc3339(),
            status: "offline".to_string(),
            reason: "unexpected_disconnect".to_string(),
        };
    }
}
