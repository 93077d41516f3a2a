use crate::config::SyncConfig;
use crate::transport::{with_deadline, ApiError, TaskApi};
use std::time::Duration;
use taskview_core::ApprovalDecision;
use tracing::{info, warn};

/// Outbound command, reflected back only through later poll or push data.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Approve {
        step_id: String,
        decision: ApprovalDecision,
        reason: Option<String>,
    },
    Cancel,
    Continue {
        message: String,
    },
    Delete,
    OpenFile {
        file_id: String,
    },
}

impl Outbound {
    /// Health source label for acknowledgements.
    pub fn label(&self) -> &'static str {
        match self {
            Outbound::Approve { .. } => "approve",
            Outbound::Cancel => "cancel",
            Outbound::Continue { .. } => "continue",
            Outbound::Delete => "delete",
            Outbound::OpenFile { .. } => "open_file",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DispatchPolicy {
    pub command_timeout: Duration,
    pub delete_timeout: Duration,
    pub delete_attempts: u32,
    pub delete_backoff_base: Duration,
}

impl From<&SyncConfig> for DispatchPolicy {
    fn from(config: &SyncConfig) -> Self {
        Self {
            command_timeout: Duration::from_millis(config.command_timeout_ms),
            delete_timeout: Duration::from_millis(config.delete_timeout_ms),
            delete_attempts: config.delete_attempts,
            delete_backoff_base: config.delete_backoff_base(),
        }
    }
}

pub async fn dispatch(
    api: &dyn TaskApi,
    task_id: &str,
    outbound: &Outbound,
    policy: DispatchPolicy,
) -> Result<(), ApiError> {
    let limit = policy.command_timeout;
    let result = match outbound {
        Outbound::Approve {
            step_id,
            decision,
            reason,
        } => {
            with_deadline(
                limit,
                api.approve(task_id, step_id, *decision, reason.as_deref()),
            )
            .await
        }
        Outbound::Cancel => with_deadline(limit, api.cancel(task_id)).await,
        Outbound::Continue { message } => {
            with_deadline(limit, api.continue_task(task_id, message)).await
        }
        Outbound::Delete => delete_with_backoff(api, task_id, policy).await,
        Outbound::OpenFile { file_id } => with_deadline(limit, api.open_file(task_id, file_id)).await,
    };
    match &result {
        Ok(()) => info!("command_sent: kind={} task_id={task_id}", outbound.label()),
        Err(err) => warn!("command_failed: kind={} task_id={task_id} err={err}", outbound.label()),
    }
    result
}

/// Delay before retry number `attempt` (1-based): `base * attempt²`.
pub fn delete_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(attempt.saturating_mul(attempt))
}

/// Deletes a task, retrying only while the server reports it busy.
pub async fn delete_with_backoff(
    api: &dyn TaskApi,
    task_id: &str,
    policy: DispatchPolicy,
) -> Result<(), ApiError> {
    let attempts = policy.delete_attempts.max(1);
    let mut attempt = 1;
    loop {
        match with_deadline(policy.delete_timeout, api.delete_task(task_id)).await {
            Ok(()) => return Ok(()),
            Err(err) if err.is_busy() && attempt < attempts => {
                let delay = delete_delay(policy.delete_backoff_base, attempt);
                warn!(
                    "delete_busy_retry: task_id={task_id} attempt={attempt} delay_ms={}",
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
