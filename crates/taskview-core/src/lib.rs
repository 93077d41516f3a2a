pub mod wire;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle stage of a task as reported by the server.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Queued,
    Planning,
    Running,
    WaitingApproval,
    Succeeded,
    Failed,
    #[serde(alias = "cancelled")]
    Canceled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Planning => "planning",
            TaskStatus::Running => "running",
            TaskStatus::WaitingApproval => "waiting_approval",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Canceled => "canceled",
        }
    }

    /// Busy states keep polling cadence up and allow cancel.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            TaskStatus::Queued
                | TaskStatus::Planning
                | TaskStatus::Running
                | TaskStatus::WaitingApproval
        )
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_busy()
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "queued" | "pending" => Ok(TaskStatus::Queued),
            "planning" => Ok(TaskStatus::Planning),
            "running" | "in_progress" | "in-progress" => Ok(TaskStatus::Running),
            "waiting_approval" | "waiting-approval" => Ok(TaskStatus::WaitingApproval),
            "succeeded" | "completed" | "done" => Ok(TaskStatus::Succeeded),
            "failed" => Ok(TaskStatus::Failed),
            "canceled" | "cancelled" => Ok(TaskStatus::Canceled),
            other => Err(format!("Unknown task status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Queued,
    Running,
    WaitingApproval,
    Succeeded,
    Failed,
    Canceled,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Queued => "queued",
            StepStatus::Running => "running",
            StepStatus::WaitingApproval => "waiting_approval",
            StepStatus::Succeeded => "succeeded",
            StepStatus::Failed => "failed",
            StepStatus::Canceled => "canceled",
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(
            self,
            StepStatus::Succeeded | StepStatus::Failed | StepStatus::Canceled
        )
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "queued" | "pending" | "scheduled" => Ok(StepStatus::Queued),
            "running" | "started" | "in_progress" => Ok(StepStatus::Running),
            "waiting_approval" | "waiting-approval" => Ok(StepStatus::WaitingApproval),
            "succeeded" | "completed" | "done" => Ok(StepStatus::Succeeded),
            "failed" => Ok(StepStatus::Failed),
            "canceled" | "cancelled" | "skipped" => Ok(StepStatus::Canceled),
            other => Err(format!("Unknown step status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
    System,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
            ChatRole::System => "system",
        }
    }
}

impl fmt::Display for ChatRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChatRole {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "user" => Ok(ChatRole::User),
            "assistant" => Ok(ChatRole::Assistant),
            // Tool transcripts render as system notes.
            "system" | "tool" => Ok(ChatRole::System),
            other => Err(format!("Unknown chat role: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalDecision {
    Approve,
    Reject,
}

impl ApprovalDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalDecision::Approve => "approve",
            ApprovalDecision::Reject => "reject",
        }
    }

    pub fn past_tense(&self) -> &'static str {
        match self {
            ApprovalDecision::Approve => "approved",
            ApprovalDecision::Reject => "rejected",
        }
    }
}

impl fmt::Display for ApprovalDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApprovalDecision {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "approve" | "approved" | "allow" | "yes" | "y" | "ok" => Ok(ApprovalDecision::Approve),
            "reject" | "rejected" | "deny" | "denied" | "no" | "n" => Ok(ApprovalDecision::Reject),
            other => Err(format!("Unknown approval decision: {other}")),
        }
    }
}

/// Converts an epoch-seconds event timestamp into a UTC datetime.
pub fn ts_to_datetime(ts: f64) -> Option<DateTime<Utc>> {
    if !ts.is_finite() || ts < 0.0 {
        return None;
    }
    let millis = (ts * 1000.0).round() as i64;
    Utc.timestamp_millis_opt(millis).single()
}
