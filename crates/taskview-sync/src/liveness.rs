use taskview_core::TaskStatus;
use tracing::{info, warn};

/// Shape of an observed liveness transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    Unchanged,
    Forward,
    /// waiting_approval back to running after a decision.
    ApprovalReturn,
    /// A terminal task picked up again by `continue`.
    Reopened,
    Backward,
}

fn rank(status: TaskStatus) -> u8 {
    match status {
        TaskStatus::Queued => 0,
        TaskStatus::Planning => 1,
        TaskStatus::Running => 2,
        TaskStatus::WaitingApproval => 3,
        TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Canceled => 4,
    }
}

pub fn classify(from: TaskStatus, to: TaskStatus) -> Edge {
    if from == to {
        return Edge::Unchanged;
    }
    if from == TaskStatus::WaitingApproval && to == TaskStatus::Running {
        return Edge::ApprovalReturn;
    }
    if from.is_terminal() && to.is_busy() {
        return Edge::Reopened;
    }
    if rank(to) > rank(from) {
        Edge::Forward
    } else {
        Edge::Backward
    }
}

/// Task lifecycle plus the cancel gate that rides on it.
///
/// The machine always adopts what the server reports; it only classifies the
/// edge so unexpected regressions show up in the logs.
#[derive(Debug, Clone, Default)]
pub struct Liveness {
    status: Option<TaskStatus>,
    cancel_issued: bool,
}

impl Liveness {
    pub fn status(&self) -> Option<TaskStatus> {
        self.status
    }

    pub fn is_busy(&self) -> bool {
        self.status.is_some_and(|status| status.is_busy())
    }

    pub fn transition(&mut self, to: TaskStatus) -> Edge {
        let edge = match self.status {
            Some(from) => classify(from, to),
            None => Edge::Forward,
        };
        match edge {
            Edge::Unchanged => return edge,
            Edge::Backward => {
                warn!(
                    "liveness_backward: from={} to={to}",
                    self.status.map(|status| status.as_str()).unwrap_or("unknown")
                );
            }
            Edge::Reopened => info!("liveness_reopened: to={to}"),
            Edge::Forward | Edge::ApprovalReturn => {}
        }
        self.status = Some(to);
        if !to.is_busy() {
            self.cancel_issued = false;
        }
        edge
    }

    pub fn can_cancel(&self) -> bool {
        self.is_busy() && !self.cancel_issued
    }

    pub fn cancel_issued(&self) -> bool {
        self.cancel_issued
    }

    /// Closes the gate. Returns false when a cancel is not currently allowed.
    pub fn issue_cancel(&mut self) -> bool {
        if !self.can_cancel() {
            return false;
        }
        self.cancel_issued = true;
        true
    }

    /// Reopens the gate after the server rejected or never received a cancel.
    pub fn cancel_failed(&mut self) {
        self.cancel_issued = false;
    }

    /// `continue` is refused locally while the task is actively working.
    pub fn can_continue(&self) -> bool {
        matches!(
            self.status,
            Some(
                TaskStatus::WaitingApproval
                    | TaskStatus::Succeeded
                    | TaskStatus::Failed
                    | TaskStatus::Canceled
            )
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waiting_approval_is_the_only_return_edge() {
        assert_eq!(
            classify(TaskStatus::WaitingApproval, TaskStatus::Running),
            Edge::ApprovalReturn
        );
        assert_eq!(
            classify(TaskStatus::Running, TaskStatus::WaitingApproval),
            Edge::Forward
        );
        assert_eq!(classify(TaskStatus::Running, TaskStatus::Planning), Edge::Backward);
        assert_eq!(classify(TaskStatus::Succeeded, TaskStatus::Running), Edge::Reopened);
        assert_eq!(classify(TaskStatus::Failed, TaskStatus::Failed), Edge::Unchanged);
    }

    #[test]
    fn cancel_gate_stays_closed_until_task_leaves_busy_set() {
        let mut liveness = Liveness::default();
        assert!(!liveness.can_cancel());
        liveness.transition(TaskStatus::Running);
        assert!(liveness.issue_cancel());
        assert!(!liveness.issue_cancel());
        liveness.transition(TaskStatus::WaitingApproval);
        assert!(!liveness.can_cancel());
        liveness.transition(TaskStatus::Canceled);
        assert!(!liveness.cancel_issued());
        liveness.transition(TaskStatus::Running);
        assert!(liveness.can_cancel());
    }

    #[test]
    fn failed_cancel_reopens_gate() {
        let mut liveness = Liveness::default();
        liveness.transition(TaskStatus::Queued);
        assert!(liveness.issue_cancel());
        liveness.cancel_failed();
        assert!(liveness.can_cancel());
    }

    #[test]
    fn continue_is_blocked_while_working() {
        let mut liveness = Liveness::default();
        assert!(!liveness.can_continue());
        liveness.transition(TaskStatus::Planning);
        assert!(!liveness.can_continue());
        liveness.transition(TaskStatus::WaitingApproval);
        assert!(liveness.can_continue());
        liveness.transition(TaskStatus::Succeeded);
        assert!(liveness.can_continue());
    }
}
