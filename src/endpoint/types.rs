//! Wire types exchanged with a remote tunnel daemon (design notes §3, §6).

use serde::Deserialize;

/// One decoded SSE event from an endpoint's `/events` stream.
///
/// Events with invalid JSON or a missing `instanceId` are dropped by the
/// caller and counted (`sse.invalid_frames`) rather than surfaced as an
/// error — see design notes §7.
#[derive(Debug, Clone, Deserialize)]
pub struct SseEvent {
    #[serde(rename = "type")]
    pub event_type: SseEventType,
    #[serde(rename = "instanceId")]
    pub instance_id: String,
    #[serde(rename = "instanceType")]
    pub instance_type: Option<String>,
    pub status: Option<String>,
    pub url: Option<String>,
    pub alias: Option<String>,
    pub restart: Option<bool>,
    #[serde(default)]
    pub tcprx: Option<i64>,
    #[serde(default)]
    pub tcptx: Option<i64>,
    #[serde(default)]
    pub udprx: Option<i64>,
    #[serde(default)]
    pub udptx: Option<i64>,
    pub pool: Option<i32>,
    pub ping: Option<i32>,
    pub tcps: Option<i32>,
    pub udps: Option<i32>,
    #[serde(rename = "eventTime")]
    pub event_time: Option<String>,
    /// Present only on `log` events; plain-text log line.
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SseEventType {
    Initial,
    Create,
    Update,
    Delete,
    Shutdown,
    Log,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    Start,
    Stop,
    Restart,
    Reset,
}

impl ControlAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ControlAction::Start => "start",
            ControlAction::Stop => "stop",
            ControlAction::Restart => "restart",
            ControlAction::Reset => "reset",
        }
    }
}
