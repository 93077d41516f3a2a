use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::{Map, Value};
use taskview_core::wire::{EventRow, PushFrame, TaskSnapshot};
use taskview_core::{ApprovalDecision, ChatRole, StepStatus, TaskStatus};
use thiserror::Error;
use tracing::warn;

const MAX_LINE_CHARS: usize = 160;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    #[error("{kind}: missing field {field}")]
    MissingField { kind: String, field: &'static str },
    #[error("{kind}: invalid {field} value {value:?}")]
    InvalidValue {
        kind: String,
        field: &'static str,
        value: String,
    },
}

/// Advisory telemetry families surfaced as step detail lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubEventCategory {
    Run,
    Tool,
    Llm,
    Guardrail,
    /// Approval and interrupt notices.
    Approval,
}

impl SubEventCategory {
    pub fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "run" => Some(SubEventCategory::Run),
            "tool" => Some(SubEventCategory::Tool),
            "llm" => Some(SubEventCategory::Llm),
            "guardrail" => Some(SubEventCategory::Guardrail),
            "approval" | "interrupt" => Some(SubEventCategory::Approval),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SubEventCategory::Run => "run",
            SubEventCategory::Tool => "tool",
            SubEventCategory::Llm => "llm",
            SubEventCategory::Guardrail => "guardrail",
            SubEventCategory::Approval => "approval",
        }
    }
}

/// Presence-tagged task fields; `None` means "not supplied".
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TaskFields {
    pub status: Option<TaskStatus>,
    pub updated_at: Option<DateTime<Utc>>,
    pub goal: Option<String>,
    /// `Some(None)` clears a previously reported error.
    pub error: Option<Option<String>>,
    pub output_path: Option<String>,
}

impl TaskFields {
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.updated_at.is_none()
            && self.goal.is_none()
            && self.error.is_none()
            && self.output_path.is_none()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepUpsert {
    pub step_id: String,
    pub name: Option<String>,
    pub index: Option<u32>,
    pub status: Option<StepStatus>,
    pub tool: Option<String>,
}

impl StepUpsert {
    pub fn bare(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            name: None,
            index: None,
            status: None,
            tool: None,
        }
    }
}

/// Transport-agnostic mutation applied by the reconciler.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    TaskFieldsChanged(TaskFields),
    StepUpserted(StepUpsert),
    ChatAppended {
        role: ChatRole,
        content: String,
    },
    ApprovalRequested {
        step_id: String,
        tool: Option<String>,
        scope: Option<String>,
    },
    ApprovalDecided {
        step_id: String,
        tool: Option<String>,
        scope: Option<String>,
        decision: ApprovalDecision,
        reason: Option<String>,
    },
    SubEvent {
        category: SubEventCategory,
        step_id: Option<String>,
        line: String,
    },
}

impl Command {
    pub fn kind(&self) -> &'static str {
        match self {
            Command::TaskFieldsChanged(_) => "task_fields_changed",
            Command::StepUpserted(_) => "step_upserted",
            Command::ChatAppended { .. } => "chat_appended",
            Command::ApprovalRequested { .. } => "approval_requested",
            Command::ApprovalDecided { .. } => "approval_decided",
            Command::SubEvent { .. } => "sub_event",
        }
    }
}

/// A push frame reduced to a command plus the seq it carried, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct PushCommand {
    pub command: Command,
    pub seq: Option<u64>,
}

/// Maps one event-log row to a command. `Ok(None)` means the row kind is
/// unknown or carries nothing the view tracks.
pub fn normalize_row(row: &EventRow) -> Result<Option<Command>, NormalizeError> {
    let kind = row.kind.as_str();
    match kind {
        "task_update" => {
            let fields = fields_object(kind, &row.payload)?;
            let fields = task_fields(kind, fields)?;
            if fields.is_empty() {
                return Ok(None);
            }
            Ok(Some(Command::TaskFieldsChanged(fields)))
        }
        "step_update" => {
            let step_id = required_step_id(kind, row.step_id.as_deref(), &row.payload)?;
            let fields = fields_object(kind, &row.payload)?;
            Ok(Some(Command::StepUpserted(step_upsert(kind, step_id, fields)?)))
        }
        "chat_message" => chat_command(kind, &row.payload).map(Some),
        "approval_requested" => {
            let step_id = required_step_id(kind, row.step_id.as_deref(), &row.payload)?;
            Ok(Some(Command::ApprovalRequested {
                step_id,
                tool: opt_string(&row.payload, "tool"),
                scope: opt_string(&row.payload, "scope"),
            }))
        }
        "approval_decided" => {
            let step_id = required_step_id(kind, row.step_id.as_deref(), &row.payload)?;
            decided_command(kind, step_id, &row.payload).map(Some)
        }
        "uak_event" => uak_command(row.step_id.as_deref(), &row.payload),
        _ => Ok(None),
    }
}

/// Maps one push frame to a command. Frames for unknown categories yield
/// `Ok(None)`.
pub fn normalize_push(frame: &PushFrame) -> Result<Option<PushCommand>, NormalizeError> {
    let kind = frame.kind.as_str();
    let data = &frame.data;
    let command = match kind {
        "task_update" => {
            let fields = task_fields(kind, fields_object(kind, data)?)?;
            if fields.is_empty() {
                return Ok(None);
            }
            Command::TaskFieldsChanged(fields)
        }
        "step_update" => {
            let step_id = required_step_id(kind, None, data)?;
            Command::StepUpserted(step_upsert(kind, step_id, fields_object(kind, data)?)?)
        }
        "approval_requested" => Command::ApprovalRequested {
            step_id: required_step_id(kind, None, data)?,
            tool: opt_string(data, "tool"),
            scope: opt_string(data, "scope"),
        },
        "approval_decided" => {
            let step_id = required_step_id(kind, None, data)?;
            decided_command(kind, step_id, data)?
        }
        "event_log" => {
            let inner_kind = opt_string(data, "type").ok_or_else(|| NormalizeError::MissingField {
                kind: kind.to_string(),
                field: "type",
            })?;
            let seq = data.get("seq").and_then(Value::as_u64).filter(|seq| *seq > 0);
            let row = EventRow {
                seq: seq.unwrap_or(0),
                ts: frame.ts,
                kind: inner_kind,
                task_id: opt_string(data, "task_id"),
                step_id: opt_string(data, "step_id"),
                payload: data.get("payload").cloned().unwrap_or(Value::Null),
            };
            return Ok(normalize_row(&row)?.map(|command| PushCommand { command, seq }));
        }
        _ => return Ok(None),
    };
    Ok(Some(PushCommand { command, seq: None }))
}

/// Expands a task snapshot into the commands that would recreate it.
pub fn normalize_snapshot(snapshot: &TaskSnapshot) -> Vec<Command> {
    let mut commands = Vec::with_capacity(snapshot.steps.len() + 2);
    let task = &snapshot.task;
    let status = match task.status.parse::<TaskStatus>() {
        Ok(status) => Some(status),
        Err(err) => {
            warn!("snapshot_status_unknown: task_id={} err={err}", task.id);
            None
        }
    };
    let fields = TaskFields {
        status,
        updated_at: task.updated_at.as_deref().and_then(parse_timestamp),
        goal: task.goal.clone(),
        error: Some(task.error.clone().filter(|err| !err.trim().is_empty())),
        output_path: task.output_path.clone(),
    };
    commands.push(Command::TaskFieldsChanged(fields));

    for step in &snapshot.steps {
        let status = step.status.as_deref().and_then(|raw| match raw.parse() {
            Ok(status) => Some(status),
            Err(err) => {
                warn!("snapshot_step_status_unknown: step_id={} err={err}", step.id);
                None
            }
        });
        commands.push(Command::StepUpserted(StepUpsert {
            step_id: step.id.clone(),
            name: step.name.clone().filter(|name| !name.trim().is_empty()),
            index: step.idx,
            status,
            tool: step.tool.clone().filter(|tool| !tool.trim().is_empty()),
        }));
    }

    // Approvals arrive newest first.
    if status == Some(TaskStatus::WaitingApproval) {
        let pending = snapshot
            .approvals
            .iter()
            .find(|approval| approval.status.eq_ignore_ascii_case("pending"));
        if let Some(approval) = pending {
            let tool = snapshot
                .steps
                .iter()
                .find(|step| step.id == approval.step_id)
                .and_then(|step| step.tool.clone());
            commands.push(Command::ApprovalRequested {
                step_id: approval.step_id.clone(),
                tool,
                scope: None,
            });
        }
    }
    commands
}

fn uak_command(
    row_step_id: Option<&str>,
    payload: &Value,
) -> Result<Option<Command>, NormalizeError> {
    let kind = "uak_event";
    let event = payload.get("event").ok_or_else(|| NormalizeError::MissingField {
        kind: kind.to_string(),
        field: "event",
    })?;
    let event_type = opt_string(event, "type").ok_or_else(|| NormalizeError::MissingField {
        kind: kind.to_string(),
        field: "event.type",
    })?;
    let step_id = opt_string(event, "step_id").or_else(|| non_empty(row_step_id));
    let inner = event.get("payload").cloned().unwrap_or(Value::Null);
    let (prefix, subtype) = event_type.split_once('.').unwrap_or((event_type.as_str(), ""));

    if prefix == "step" {
        let status = match subtype {
            "scheduled" => StepStatus::Queued,
            "started" => StepStatus::Running,
            "completed" => StepStatus::Succeeded,
            "failed" => StepStatus::Failed,
            _ => return Ok(None),
        };
        let Some(step_id) = step_id else {
            return Err(NormalizeError::MissingField {
                kind: event_type.clone(),
                field: "step_id",
            });
        };
        return Ok(Some(Command::StepUpserted(StepUpsert {
            step_id,
            name: opt_string(&inner, "node"),
            index: None,
            status: Some(status),
            tool: None,
        })));
    }

    let Some(category) = SubEventCategory::from_prefix(prefix) else {
        return Ok(None);
    };
    let line = humanize(category, prefix, subtype, &inner);
    Ok(Some(Command::SubEvent {
        category,
        step_id,
        line,
    }))
}

fn humanize(category: SubEventCategory, prefix: &str, subtype: &str, payload: &Value) -> String {
    let detail = match category {
        SubEventCategory::Run => first_string(payload, &["error", "message", "status"]),
        SubEventCategory::Tool => first_string(payload, &["tool_name", "tool", "name"]),
        SubEventCategory::Llm => first_string(payload, &["model", "provider"]),
        SubEventCategory::Guardrail => first_string(payload, &["reason", "message", "rule"]),
        SubEventCategory::Approval => first_string(payload, &["tool", "reason", "message"]),
    };
    let head = if subtype.is_empty() {
        prefix.to_string()
    } else {
        format!("{prefix} {}", subtype.replace(&['_', '.'][..], " "))
    };
    let line = match detail {
        Some(detail) => format!("{head}: {}", collapse_whitespace(&detail)),
        None => head,
    };
    ellipsize(&line, MAX_LINE_CHARS)
}

fn chat_command(kind: &str, payload: &Value) -> Result<Command, NormalizeError> {
    let raw_role = opt_string(payload, "role").ok_or_else(|| NormalizeError::MissingField {
        kind: kind.to_string(),
        field: "role",
    })?;
    let role = raw_role
        .parse::<ChatRole>()
        .map_err(|_| NormalizeError::InvalidValue {
            kind: kind.to_string(),
            field: "role",
            value: raw_role.clone(),
        })?;
    let content = payload
        .get("content")
        .and_then(Value::as_str)
        .filter(|content| !content.trim().is_empty())
        .ok_or_else(|| NormalizeError::MissingField {
            kind: kind.to_string(),
            field: "content",
        })?;
    Ok(Command::ChatAppended {
        role,
        content: content.to_string(),
    })
}

fn decided_command(kind: &str, step_id: String, payload: &Value) -> Result<Command, NormalizeError> {
    let raw = opt_string(payload, "decision").ok_or_else(|| NormalizeError::MissingField {
        kind: kind.to_string(),
        field: "decision",
    })?;
    let decision = raw
        .parse::<ApprovalDecision>()
        .map_err(|_| NormalizeError::InvalidValue {
            kind: kind.to_string(),
            field: "decision",
            value: raw.clone(),
        })?;
    Ok(Command::ApprovalDecided {
        step_id,
        tool: opt_string(payload, "tool"),
        scope: opt_string(payload, "scope"),
        decision,
        reason: opt_string(payload, "reason"),
    })
}

fn task_fields(kind: &str, fields: &Map<String, Value>) -> Result<TaskFields, NormalizeError> {
    let mut out = TaskFields::default();
    if let Some(raw) = fields.get("status").and_then(Value::as_str) {
        out.status = Some(raw.parse().map_err(|_| NormalizeError::InvalidValue {
            kind: kind.to_string(),
            field: "status",
            value: raw.to_string(),
        })?);
    }
    out.updated_at = fields
        .get("updated_at")
        .and_then(Value::as_str)
        .and_then(parse_timestamp);
    out.goal = fields.get("goal").and_then(Value::as_str).map(str::to_string);
    if let Some(error) = fields.get("error") {
        out.error = Some(
            error
                .as_str()
                .map(str::trim)
                .filter(|error| !error.is_empty())
                .map(str::to_string),
        );
    }
    out.output_path = fields
        .get("output_path")
        .and_then(Value::as_str)
        .map(str::to_string);
    Ok(out)
}

fn step_upsert(
    kind: &str,
    step_id: String,
    fields: &Map<String, Value>,
) -> Result<StepUpsert, NormalizeError> {
    let mut upsert = StepUpsert::bare(step_id);
    if let Some(raw) = fields.get("status").and_then(Value::as_str) {
        upsert.status = Some(raw.parse().map_err(|_| NormalizeError::InvalidValue {
            kind: kind.to_string(),
            field: "status",
            value: raw.to_string(),
        })?);
    }
    upsert.name = fields
        .get("name")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string);
    upsert.index = fields
        .get("idx")
        .and_then(Value::as_u64)
        .and_then(|idx| u32::try_from(idx).ok());
    upsert.tool = fields
        .get("tool")
        .and_then(Value::as_str)
        .filter(|tool| !tool.trim().is_empty())
        .map(str::to_string);
    Ok(upsert)
}

fn fields_object<'a>(kind: &str, payload: &'a Value) -> Result<&'a Map<String, Value>, NormalizeError> {
    payload
        .get("fields")
        .and_then(Value::as_object)
        .ok_or_else(|| NormalizeError::MissingField {
            kind: kind.to_string(),
            field: "fields",
        })
}

fn required_step_id(
    kind: &str,
    row_step_id: Option<&str>,
    payload: &Value,
) -> Result<String, NormalizeError> {
    non_empty(row_step_id)
        .or_else(|| opt_string(payload, "step_id"))
        .ok_or_else(|| NormalizeError::MissingField {
            kind: kind.to_string(),
            field: "step_id",
        })
}

fn opt_string(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}

fn first_string(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| opt_string(value, key))
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}

fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn ellipsize(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    let mut out: String = input.chars().take(max_chars.saturating_sub(1)).collect();
    out.push('…');
    out
}

/// Parses server timestamps, which are RFC3339 or naive UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}
