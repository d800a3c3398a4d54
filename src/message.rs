use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Library tag injected into every message's properties.
pub const LIB_NAME: &str = "posthog-rust";
/// Library version injected into every message's properties.
pub const LIB_VERSION: &str = env!("CARGO_PKG_VERSION");

/// A schemaless property bag. Values are arbitrary JSON.
pub type Properties = serde_json::Map<String, serde_json::Value>;

/// The kind of a queued message. Serialized as the wire `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Capture,
    Identify,
    Alias,
    GroupIdentify,
    Exception,
}

/// The unit of delivery. Produced by the normalizer and immutable from
/// then on; the worker batches messages as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub event: String,
    pub distinct_id: String,
    /// ISO-8601 UTC timestamp with millisecond precision.
    pub timestamp: String,
    #[serde(rename = "messageId")]
    pub message_id: String,
    pub properties: Properties,
    /// Person properties to set; only present on identify messages.
    #[serde(rename = "$set", default, skip_serializing_if = "Option::is_none")]
    pub set: Option<Properties>,
    pub library: String,
    pub library_version: String,
    /// Caller-supplied event UUID. Only carried when it parses as a
    /// canonical v4 UUID.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
}

/// Current UTC time as `YYYY-MM-DDTHH:MM:SS.sssZ`.
pub(crate) fn utc_timestamp() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// Fresh random message id.
pub(crate) fn new_message_id() -> String {
    Uuid::new_v4().to_string()
}

/// `true` iff `candidate` is a canonical hyphenated v4 UUID.
pub(crate) fn is_valid_uuid(candidate: &str) -> bool {
    candidate.len() == 36
        && Uuid::parse_str(candidate)
            .map(|u| u.get_version_num() == 4)
            .unwrap_or(false)
}
