use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use thiserror::Error;

/// One row of the per-task event log, as returned by history and delta fetches.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventRow {
    pub seq: u64,
    #[serde(default)]
    pub ts: f64,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub step_id: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskSnapshot {
    pub task: TaskRecord,
    #[serde(default)]
    pub steps: Vec<StepRecord>,
    #[serde(default)]
    pub approvals: Vec<ApprovalRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskRecord {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub goal: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub output_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepRecord {
    pub id: String,
    #[serde(default)]
    pub idx: Option<u32>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub tool: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApprovalRecord {
    pub step_id: String,
    pub status: String,
    #[serde(default)]
    pub requested_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CitationChunk {
    #[serde(default)]
    pub chunk_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub snippet: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub tool_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CitationsResponse {
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub chunks: HashMap<String, CitationChunk>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileEntry {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub rel: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub mtime: f64,
    #[serde(default)]
    pub group: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct FilesResponse {
    #[serde(default)]
    pub files: Vec<FileEntry>,
    #[serde(default)]
    pub default_id: Option<String>,
}

/// Named-category frame from the push channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PushFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub ts: f64,
}

impl PushFrame {
    pub fn task_id(&self) -> Option<&str> {
        self.data.get("task_id").and_then(Value::as_str)
    }

    pub fn seq(&self) -> Option<u64> {
        self.data.get("seq").and_then(Value::as_u64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("push frame is not json: {0}")]
    NotJson(String),
    #[error("push frame is not an object")]
    NotObject,
    #[error("push frame has no type")]
    MissingType,
}

/// Decodes the JSON body of one server-sent event into a push frame.
///
/// The body normally carries its own `type`; the SSE event name is the
/// fallback when it does not.
pub fn decode_push_frame(event: &str, data: &str) -> Result<PushFrame, FrameError> {
    let value: Value =
        serde_json::from_str(data).map_err(|err| FrameError::NotJson(err.to_string()))?;
    let Value::Object(mut map) = value else {
        return Err(FrameError::NotObject);
    };
    let kind = match map.remove("type") {
        Some(Value::String(kind)) if !kind.trim().is_empty() => kind,
        _ => {
            let event = event.trim();
            if event.is_empty() || event == "message" {
                return Err(FrameError::MissingType);
            }
            event.to_string()
        }
    };
    let data = map
        .remove("data")
        .unwrap_or_else(|| Value::Object(Map::new()));
    let ts = map.get("ts").and_then(Value::as_f64).unwrap_or(0.0);
    Ok(PushFrame { kind, data, ts })
}
