use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event pushed to the transport bound to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    Start,
    Stdout { data: String },
    Stderr { data: String },
    Close { code: i32 },
    Error { data: String },
}

impl RunEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunEvent::Close { .. } | RunEvent::Error { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Provisioning,
    Compiling,
    Running,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    pub language: String,
    pub code: String,
    pub client_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputRequest {
    pub client_id: String,
    pub input: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KillRequest {
    pub client_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: &'static str,
}

impl StatusResponse {
    pub const STARTED: Self = Self { status: "started" };
    pub const INPUT_SENT: Self = Self {
        status: "input_sent",
    };
    pub const PROCESS_KILLED: Self = Self {
        status: "process_killed",
    };
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub client_id: String,
    pub language: String,
    pub stage: Stage,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
}

/// Frames a client may send over its WebSocket.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Input { data: String },
    Kill,
}
