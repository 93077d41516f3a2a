use crate::lazy_cache::FetchTicket;
use crate::normalizer::{Command, StepUpsert, SubEventCategory, TaskFields};
use crate::store::{ChangeKind, ChatMessage, PendingApproval, StateStore};
use std::collections::{BTreeSet, HashMap};
use std::time::Instant;
use taskview_core::wire::{CitationChunk, FilesResponse};
use taskview_core::{ApprovalDecision, ChatRole, TaskStatus};
use tracing::debug;

/// Ordering stamp attached to a command before it is applied.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stamp {
    pub seq: u64,
    pub ts: f64,
    /// True when `seq` came from the event itself rather than the ledger's
    /// high-water mark at observation time.
    pub sequenced: bool,
}

impl Stamp {
    pub fn sequenced(seq: u64, ts: f64) -> Self {
        Self {
            seq,
            ts,
            sequenced: true,
        }
    }

    pub fn observed(last_seq: u64, ts: f64) -> Self {
        Self {
            seq: last_seq,
            ts,
            sequenced: false,
        }
    }
}

/// Sole writer of the [`StateStore`]. Every apply is idempotent for a given
/// stamp, so replays are harmless.
#[derive(Debug)]
pub struct Reconciler {
    store: StateStore,
}

impl Reconciler {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn take_changes(&mut self) -> BTreeSet<ChangeKind> {
        std::mem::take(&mut self.store.changes)
    }

    /// Applies one command and reports whether anything visible changed.
    pub fn apply(&mut self, command: &Command, stamp: Stamp) -> bool {
        match command {
            Command::TaskFieldsChanged(fields) => self.apply_task_fields(fields, stamp),
            Command::StepUpserted(upsert) => self.apply_step(upsert, stamp),
            Command::ChatAppended { role, content } => self.apply_chat(*role, content, stamp),
            Command::ApprovalRequested {
                step_id,
                tool,
                scope,
            } => {
                let pending = PendingApproval {
                    step_id: step_id.clone(),
                    tool: tool.clone(),
                    scope: scope.clone(),
                };
                let changed = self.store.approval.offer(Some(pending), stamp.seq);
                if changed {
                    self.store.mark(ChangeKind::Approval);
                }
                changed
            }
            Command::ApprovalDecided {
                step_id,
                tool,
                decision,
                reason,
                ..
            } => self.apply_decision(step_id, tool.as_deref(), *decision, reason.as_deref(), stamp),
            Command::SubEvent {
                category,
                step_id,
                line,
            } => self.apply_sub_event(*category, step_id.as_deref(), line, stamp),
        }
    }

    /// Appends an optimistic copy of a message the user just sent.
    pub fn echo_local_chat(&mut self, role: ChatRole, content: &str, ts: f64) -> bool {
        let chat = &mut self.store.chat;
        if chat.last().is_some_and(|last| last.same_text(role, content)) {
            return false;
        }
        chat.push(ChatMessage {
            role,
            content: content.to_string(),
            ts,
            seq: None,
        });
        self.store.mark(ChangeKind::Chat);
        true
    }

    pub fn issue_cancel(&mut self) -> bool {
        let issued = self.store.liveness.issue_cancel();
        if issued {
            self.store.mark(ChangeKind::Task);
        }
        issued
    }

    pub fn cancel_failed(&mut self) {
        if self.store.liveness.cancel_issued() {
            self.store.liveness.cancel_failed();
            self.store.mark(ChangeKind::Task);
        }
    }

    pub fn begin_citations(&mut self, now: Instant) -> Option<FetchTicket> {
        self.store.citations.begin(now)
    }

    pub fn complete_citations(
        &mut self,
        ticket: FetchTicket,
        chunks: HashMap<String, CitationChunk>,
    ) -> bool {
        let applied = self.store.citations.complete(ticket, chunks);
        if applied {
            self.store.mark(ChangeKind::Citations);
        }
        applied
    }

    pub fn fail_citations(&mut self, ticket: FetchTicket) {
        self.store.citations.fail(ticket);
    }

    pub fn begin_files(&mut self, now: Instant) -> Option<FetchTicket> {
        self.store.files.begin(now)
    }

    pub fn complete_files(&mut self, ticket: FetchTicket, files: FilesResponse) -> bool {
        let changed = self.store.files.value() != Some(&files);
        let applied = self.store.files.complete(ticket, files);
        if applied && changed {
            self.store.mark(ChangeKind::Files);
        }
        applied
    }

    pub fn fail_files(&mut self, ticket: FetchTicket) {
        self.store.files.fail(ticket);
    }

    fn apply_task_fields(&mut self, fields: &TaskFields, stamp: Stamp) -> bool {
        let seq = stamp.seq;
        let task = &mut self.store.task;
        let mut changed = false;
        let mut left_waiting = false;

        if let Some(status) = fields.status {
            let previous = *task.status.value();
            if task.status.offer(Some(status), seq) {
                changed = true;
                self.store.liveness.transition(status);
                left_waiting = previous == Some(TaskStatus::WaitingApproval)
                    && status != TaskStatus::WaitingApproval;
            }
        }
        if let Some(updated_at) = fields.updated_at {
            changed |= task.updated_at.offer(Some(updated_at), seq);
        }
        if let Some(goal) = &fields.goal {
            changed |= task.goal.offer(Some(goal.clone()), seq);
        }
        if let Some(error) = &fields.error {
            changed |= task.error.offer(error.clone(), seq);
        }
        if let Some(output_path) = &fields.output_path {
            changed |= task.output_path.offer(Some(output_path.clone()), seq);
        }

        if left_waiting && self.store.approval.force(None, seq) {
            debug!("approval_cleared_by_liveness: seq={seq}");
            self.store.mark(ChangeKind::Approval);
        }
        if changed {
            self.store.mark(ChangeKind::Task);
        }
        changed
    }

    fn apply_step(&mut self, upsert: &StepUpsert, stamp: Stamp) -> bool {
        let seq = stamp.seq;
        let (step, created) = self.store.ensure_step(&upsert.step_id);
        let mut changed = created;
        if let Some(name) = &upsert.name {
            changed |= step.name.offer(Some(name.clone()), seq);
        }
        if let Some(index) = upsert.index {
            changed |= step.index.offer(Some(index), seq);
        }
        if let Some(status) = upsert.status {
            changed |= step.status.offer(status, seq);
        }
        if let Some(tool) = &upsert.tool {
            changed |= step.tool.offer(Some(tool.clone()), seq);
        }
        if changed {
            self.store.mark(ChangeKind::Step);
        }
        changed
    }

    fn apply_chat(&mut self, role: ChatRole, content: &str, stamp: Stamp) -> bool {
        if !stamp.sequenced {
            let chat = &mut self.store.chat;
            if chat.last().is_some_and(|last| last.same_text(role, content)) {
                return false;
            }
            chat.push(ChatMessage {
                role,
                content: content.to_string(),
                ts: stamp.ts,
                seq: None,
            });
            self.store.mark(ChangeKind::Chat);
            return true;
        }

        let chat = &mut self.store.chat;
        // The server copy of a local echo takes over the echo's slot.
        let confirmed = match chat
            .iter()
            .position(|message| message.seq.is_none() && message.same_text(role, content))
        {
            Some(pos) => {
                chat.remove(pos);
                true
            }
            None => false,
        };

        let pos = chat
            .iter()
            .position(|message| message.seq.map_or(true, |seq| seq > stamp.seq))
            .unwrap_or(chat.len());
        let duplicate_before = pos > 0 && chat[pos - 1].same_text(role, content);
        // A later copy of the same text is the one a seq-ordered replay
        // would have suppressed; it takes the earlier seq instead.
        let merge_next = chat
            .get(pos)
            .is_some_and(|next| next.seq.is_some() && next.same_text(role, content));
        let changed = if duplicate_before {
            confirmed
        } else if merge_next {
            if let Some(next) = chat.get_mut(pos) {
                next.seq = Some(stamp.seq);
                next.ts = stamp.ts;
            }
            true
        } else {
            chat.insert(
                pos,
                ChatMessage {
                    role,
                    content: content.to_string(),
                    ts: stamp.ts,
                    seq: Some(stamp.seq),
                },
            );
            true
        };
        if changed {
            self.store.mark(ChangeKind::Chat);
        }
        changed
    }

    fn apply_decision(
        &mut self,
        step_id: &str,
        tool: Option<&str>,
        decision: ApprovalDecision,
        reason: Option<&str>,
        stamp: Stamp,
    ) -> bool {
        let seq = stamp.seq;
        let mut line = format!("approval {}", decision.past_tense());
        if let Some(tool) = tool {
            line.push_str(&format!(" for {tool}"));
        }
        if let Some(reason) = reason {
            line.push_str(&format!(": {reason}"));
        }
        // The server echoes each decision as a row and as a seq-less push.
        let (step, created) = self.store.ensure_step(step_id);
        let mut changed = created;
        if step.last_decision.as_deref() != Some(line.as_str()) {
            changed |= step.detail.push(line.clone(), stamp.ts);
            step.last_decision = Some(line);
        }
        if changed {
            self.store.mark(ChangeKind::Step);
        }

        let is_current = self
            .store
            .pending_approval()
            .is_some_and(|pending| pending.step_id == step_id);
        if !is_current {
            debug!("approval_decided_not_current: step_id={step_id} seq={seq}");
            return changed;
        }
        if self.store.approval.offer(None, seq) {
            changed = true;
            self.store.mark(ChangeKind::Approval);
            if self.store.liveness.status() == Some(TaskStatus::WaitingApproval)
                && self.store.task.status.offer(Some(TaskStatus::Running), seq)
            {
                self.store.liveness.transition(TaskStatus::Running);
                self.store.mark(ChangeKind::Task);
            }
        }
        changed
    }

    fn apply_sub_event(
        &mut self,
        category: SubEventCategory,
        step_id: Option<&str>,
        line: &str,
        stamp: Stamp,
    ) -> bool {
        match step_id {
            Some(step_id) => {
                let (step, created) = self.store.ensure_step(step_id);
                let pushed = step.detail.push(line.to_string(), stamp.ts);
                if !pushed {
                    debug!(
                        "detail_line_out_of_order: step_id={step_id} category={} ts={}",
                        category.as_str(),
                        stamp.ts
                    );
                }
                if pushed || created {
                    self.store.mark(ChangeKind::Step);
                }
                pushed || created
            }
            None => {
                let pushed = self.store.task.activity.push(line.to_string(), stamp.ts);
                if pushed {
                    self.store.mark(ChangeKind::Task);
                }
                pushed
            }
        }
    }
}
