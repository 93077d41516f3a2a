use crate::config::SyncConfig;
use crate::dispatch::Outbound;
use crate::health::{HealthMonitor, HealthSignal};
use crate::lazy_cache::FetchTicket;
use crate::ledger::SeqLedger;
use crate::normalizer::{normalize_push, normalize_row, normalize_snapshot};
use crate::reconciler::{Reconciler, Stamp};
use crate::scheduler::{PollGate, PollKind, PollScheduler};
use crate::store::{ChangeKind, StateStore, ViewSnapshot};
use crate::transport::ApiError;
use std::collections::BTreeSet;
use std::time::Instant;
use taskview_core::wire::{CitationsResponse, EventRow, FilesResponse, PushFrame, TaskSnapshot};
use taskview_core::{ApprovalDecision, ChatRole};
use thiserror::Error;
use tracing::{debug, info, warn};

/// A pull the runtime should perform on the session's behalf.
#[derive(Debug, Clone, PartialEq)]
pub enum Fetch {
    History { limit: u32 },
    Delta { after: u64, limit: u32 },
    /// `as_of_seq` is the ledger position when the request was issued.
    Snapshot { as_of_seq: u64 },
    Citations { ticket: FetchTicket },
    Files { ticket: FetchTicket },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Fetch(Fetch),
    Send(Outbound),
    /// The task is gone; the runtime should stop.
    Teardown,
}

/// Completion or frame delivered back to the session.
#[derive(Debug, Clone)]
pub enum Inbound {
    History(Result<Vec<EventRow>, ApiError>),
    Delta {
        after: u64,
        result: Result<Vec<EventRow>, ApiError>,
    },
    Snapshot {
        as_of_seq: u64,
        result: Result<TaskSnapshot, ApiError>,
    },
    Citations {
        ticket: FetchTicket,
        result: Result<CitationsResponse, ApiError>,
    },
    Files {
        ticket: FetchTicket,
        result: Result<FilesResponse, ApiError>,
    },
    Push(PushFrame),
    PushStatus {
        connected: bool,
    },
    CommandDone {
        command: Outbound,
        result: Result<(), ApiError>,
    },
}

/// Inbound item scoped to the task it was requested for.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub task_id: String,
    pub inbound: Inbound,
}

impl Envelope {
    pub fn new(task_id: impl Into<String>, inbound: Inbound) -> Self {
        Self {
            task_id: task_id.into(),
            inbound,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UserCommand {
    /// Decide the approval currently pending.
    Decide {
        decision: ApprovalDecision,
        reason: Option<String>,
    },
    DecideStep {
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
    RequestCitations,
    RequestFiles,
    SetEditing(bool),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandRejected {
    #[error("view is closed")]
    Closed,
    #[error("no approval is pending")]
    NoPendingApproval,
    #[error("cancel is not available right now")]
    CancelUnavailable,
    #[error("task is still working; wait for it to finish or cancel it")]
    TaskBusy,
    #[error("message is empty")]
    EmptyMessage,
    #[error("unknown file id {0}")]
    UnknownFile(String),
}

/// Everything one open task view owns. Created on open, dropped on close.
#[derive(Debug)]
pub struct ViewSession {
    task_id: String,
    config: SyncConfig,
    ledger: SeqLedger,
    reconciler: Reconciler,
    scheduler: PollScheduler,
    health: HealthMonitor,
    poll_cursor: u64,
    delta_pages: u32,
    editing: bool,
    push_connected: bool,
    closed: bool,
    changes: BTreeSet<ChangeKind>,
}

impl ViewSession {
    pub fn new(task_id: impl Into<String>, config: SyncConfig) -> Self {
        let task_id = task_id.into();
        let store = StateStore::new(
            task_id.clone(),
            config.detail_log_cap,
            config.citations_min_interval(),
            config.files_min_interval(),
        );
        Self {
            ledger: SeqLedger::new(config.late_fill_window),
            reconciler: Reconciler::new(store),
            scheduler: PollScheduler::new(
                config.snapshot_interval(),
                config.delta_interval(),
                config.files_poll(),
            ),
            health: HealthMonitor::new(config.health_throttle()),
            task_id,
            config,
            poll_cursor: 0,
            delta_pages: 0,
            editing: false,
            push_connected: false,
            closed: false,
            changes: BTreeSet::new(),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn store(&self) -> &StateStore {
        self.reconciler.store()
    }

    pub fn last_seq(&self) -> u64 {
        self.ledger.last_seq()
    }

    /// Highest seq seen through the pull transports; deltas resume from here.
    pub fn poll_cursor(&self) -> u64 {
        self.poll_cursor
    }

    pub fn push_connected(&self) -> bool {
        self.push_connected
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn open(&mut self, now: Instant) -> Vec<Effect> {
        info!("view_open: task_id={}", self.task_id);
        self.tick(now)
    }

    pub fn tick(&mut self, now: Instant) -> Vec<Effect> {
        if self.closed {
            return Vec::new();
        }
        self.delta_pages = 0;
        let store = self.reconciler.store();
        let gate = PollGate {
            busy: store.liveness().is_busy(),
            editing: self.editing,
            suspended: self.health.auth_blocked(),
        };
        let mut effects = Vec::new();
        for kind in self.scheduler.due(now, gate) {
            match kind {
                PollKind::History => effects.push(Effect::Fetch(Fetch::History {
                    limit: self.config.history_limit,
                })),
                PollKind::Snapshot => effects.push(Effect::Fetch(Fetch::Snapshot {
                    as_of_seq: self.ledger.last_seq(),
                })),
                PollKind::Delta => {
                    self.delta_pages += 1;
                    effects.push(Effect::Fetch(self.delta_fetch()));
                }
                PollKind::Files => match self.reconciler.begin_files(now) {
                    Some(ticket) => effects.push(Effect::Fetch(Fetch::Files { ticket })),
                    None => self.scheduler.finished(PollKind::Files),
                },
            }
        }
        effects
    }

    pub fn handle(&mut self, envelope: Envelope, now: Instant) -> Vec<Effect> {
        if self.closed {
            return Vec::new();
        }
        if envelope.task_id != self.task_id {
            debug!(
                "inbound_other_task: task_id={} open={}",
                envelope.task_id, self.task_id
            );
            return Vec::new();
        }
        match envelope.inbound {
            Inbound::History(result) => {
                self.scheduler.finished(PollKind::History);
                match result {
                    Ok(rows) => {
                        self.note_success(PollKind::History.as_str());
                        let applied = self.apply_rows(&rows);
                        self.advance_poll_cursor(&rows);
                        self.scheduler.mark_backfilled(now);
                        info!(
                            "history_backfilled: rows={} applied={applied} cursor={}",
                            rows.len(),
                            self.poll_cursor
                        );
                    }
                    Err(err) => self.note_failure(PollKind::History.as_str(), &err, now),
                }
                Vec::new()
            }
            Inbound::Delta { after, result } => {
                self.scheduler.finished(PollKind::Delta);
                match result {
                    Ok(rows) => {
                        self.note_success(PollKind::Delta.as_str());
                        self.apply_rows(&rows);
                        self.advance_poll_cursor(&rows);
                        let full = rows.len() >= self.config.delta_limit as usize;
                        if full
                            && self.delta_pages < self.config.max_delta_pages_per_tick
                            && self.scheduler.claim(PollKind::Delta)
                        {
                            debug!("delta_page_full: after={after} cursor={}", self.poll_cursor);
                            self.delta_pages += 1;
                            return vec![Effect::Fetch(self.delta_fetch())];
                        }
                    }
                    Err(err) => self.note_failure(PollKind::Delta.as_str(), &err, now),
                }
                Vec::new()
            }
            Inbound::Snapshot { as_of_seq, result } => {
                self.scheduler.finished(PollKind::Snapshot);
                match result {
                    Ok(snapshot) => {
                        self.note_success(PollKind::Snapshot.as_str());
                        let stamp = Stamp::observed(as_of_seq, self.ledger.last_ts());
                        for command in normalize_snapshot(&snapshot) {
                            self.reconciler.apply(&command, stamp);
                        }
                    }
                    Err(err) => self.note_failure(PollKind::Snapshot.as_str(), &err, now),
                }
                Vec::new()
            }
            Inbound::Citations { ticket, result } => {
                match result {
                    Ok(response) => {
                        self.note_success("citations");
                        self.reconciler.complete_citations(ticket, response.chunks);
                    }
                    Err(err) => {
                        self.reconciler.fail_citations(ticket);
                        self.note_failure("citations", &err, now);
                    }
                }
                Vec::new()
            }
            Inbound::Files { ticket, result } => {
                self.scheduler.finished(PollKind::Files);
                match result {
                    Ok(files) => {
                        self.note_success(PollKind::Files.as_str());
                        self.reconciler.complete_files(ticket, files);
                    }
                    Err(err) => {
                        self.reconciler.fail_files(ticket);
                        self.note_failure(PollKind::Files.as_str(), &err, now);
                    }
                }
                Vec::new()
            }
            Inbound::Push(frame) => {
                self.apply_push(&frame);
                Vec::new()
            }
            Inbound::PushStatus { connected } => {
                if connected != self.push_connected {
                    info!("push_status: connected={connected}");
                }
                self.push_connected = connected;
                Vec::new()
            }
            Inbound::CommandDone { command, result } => self.command_done(command, result, now),
        }
    }

    pub fn command(
        &mut self,
        command: UserCommand,
        now: Instant,
    ) -> Result<Vec<Effect>, CommandRejected> {
        if self.closed {
            return Err(CommandRejected::Closed);
        }
        match command {
            UserCommand::Decide { decision, reason } => {
                let step_id = self
                    .reconciler
                    .store()
                    .pending_approval()
                    .map(|pending| pending.step_id.clone())
                    .ok_or(CommandRejected::NoPendingApproval)?;
                Ok(vec![Effect::Send(Outbound::Approve {
                    step_id,
                    decision,
                    reason,
                })])
            }
            UserCommand::DecideStep {
                step_id,
                decision,
                reason,
            } => Ok(vec![Effect::Send(Outbound::Approve {
                step_id,
                decision,
                reason,
            })]),
            UserCommand::Cancel => {
                if !self.reconciler.issue_cancel() {
                    return Err(CommandRejected::CancelUnavailable);
                }
                Ok(vec![Effect::Send(Outbound::Cancel)])
            }
            UserCommand::Continue { message } => {
                let message = message.trim().to_string();
                if message.is_empty() {
                    return Err(CommandRejected::EmptyMessage);
                }
                if !self.reconciler.store().liveness().can_continue() {
                    return Err(CommandRejected::TaskBusy);
                }
                self.reconciler
                    .echo_local_chat(ChatRole::User, &message, wall_clock_ts());
                Ok(vec![Effect::Send(Outbound::Continue { message })])
            }
            UserCommand::Delete => Ok(vec![Effect::Send(Outbound::Delete)]),
            UserCommand::OpenFile { file_id } => {
                if let Some(files) = self.reconciler.store().files().value() {
                    if !files.files.iter().any(|file| file.id == file_id) {
                        return Err(CommandRejected::UnknownFile(file_id));
                    }
                }
                Ok(vec![Effect::Send(Outbound::OpenFile { file_id })])
            }
            UserCommand::RequestCitations => Ok(self
                .reconciler
                .begin_citations(now)
                .map(|ticket| vec![Effect::Fetch(Fetch::Citations { ticket })])
                .unwrap_or_default()),
            UserCommand::RequestFiles => {
                if !self.scheduler.claim(PollKind::Files) {
                    return Ok(Vec::new());
                }
                match self.reconciler.begin_files(now) {
                    Some(ticket) => Ok(vec![Effect::Fetch(Fetch::Files { ticket })]),
                    None => {
                        self.scheduler.finished(PollKind::Files);
                        Ok(Vec::new())
                    }
                }
            }
            UserCommand::SetEditing(editing) => {
                self.editing = editing;
                Ok(Vec::new())
            }
        }
    }

    pub fn take_changes(&mut self) -> BTreeSet<ChangeKind> {
        let mut changes = self.reconciler.take_changes();
        changes.append(&mut self.changes);
        changes
    }

    pub fn snapshot(&self) -> ViewSnapshot {
        let mut snapshot = self.reconciler.store().snapshot();
        snapshot.health = self
            .health
            .visible()
            .map(|warning| warning.message.clone());
        snapshot
    }

    fn delta_fetch(&self) -> Fetch {
        Fetch::Delta {
            after: self.poll_cursor,
            limit: self.config.delta_limit,
        }
    }

    fn apply_rows(&mut self, rows: &[EventRow]) -> usize {
        let mut applied = 0;
        for row in rows {
            if row
                .task_id
                .as_deref()
                .is_some_and(|task_id| task_id != self.task_id)
            {
                continue;
            }
            if !self.ledger.accept(row.seq, row.ts) {
                continue;
            }
            match normalize_row(row) {
                Ok(Some(command)) => {
                    self.reconciler
                        .apply(&command, Stamp::sequenced(row.seq, row.ts));
                    applied += 1;
                }
                Ok(None) => debug!("event_ignored: seq={} type={}", row.seq, row.kind),
                Err(err) => warn!("event_malformed: seq={} err={err}", row.seq),
            }
        }
        applied
    }

    fn apply_push(&mut self, frame: &PushFrame) {
        if frame.task_id() != Some(self.task_id.as_str()) {
            return;
        }
        let push = match normalize_push(frame) {
            Ok(Some(push)) => push,
            Ok(None) => {
                debug!("push_ignored: type={}", frame.kind);
                return;
            }
            Err(err) => {
                warn!("push_malformed: type={} err={err}", frame.kind);
                return;
            }
        };
        let stamp = match push.seq {
            Some(seq) => {
                if !self.ledger.accept(seq, frame.ts) {
                    return;
                }
                Stamp::sequenced(seq, frame.ts)
            }
            None => Stamp::observed(self.ledger.last_seq(), frame.ts),
        };
        self.reconciler.apply(&push.command, stamp);
    }

    fn advance_poll_cursor(&mut self, rows: &[EventRow]) {
        if let Some(max) = rows.iter().map(|row| row.seq).max() {
            self.poll_cursor = self.poll_cursor.max(max);
        }
    }

    fn command_done(
        &mut self,
        command: Outbound,
        result: Result<(), ApiError>,
        now: Instant,
    ) -> Vec<Effect> {
        let label = command.label();
        match result {
            Ok(()) => {
                self.note_success(label);
                if command == Outbound::Delete {
                    info!("view_teardown: task_id={} reason=deleted", self.task_id);
                    self.closed = true;
                    return vec![Effect::Teardown];
                }
            }
            Err(err) => {
                if command == Outbound::Cancel {
                    self.reconciler.cancel_failed();
                }
                self.note_failure(label, &err, now);
            }
        }
        Vec::new()
    }

    fn note_success(&mut self, source: &'static str) {
        if self.health.record_success(source) == HealthSignal::Cleared {
            self.changes.insert(ChangeKind::Health);
        }
    }

    fn note_failure(&mut self, source: &'static str, err: &ApiError, now: Instant) {
        let signal = self
            .health
            .record_failure(source, err.tier(), &err.to_string(), now);
        if let HealthSignal::Show(message) = signal {
            debug!("health_warning: {message}");
            self.changes.insert(ChangeKind::Health);
        }
    }
}

fn wall_clock_ts() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use taskview_core::TaskStatus;

    fn row(seq: u64, kind: &str, payload: serde_json::Value) -> EventRow {
        EventRow {
            seq,
            ts: seq as f64,
            kind: kind.to_string(),
            task_id: Some("t1".to_string()),
            step_id: None,
            payload,
        }
    }

    fn status_row(seq: u64, status: &str) -> EventRow {
        row(seq, "task_update", json!({"fields": {"status": status}}))
    }

    #[test]
    fn open_requests_history_and_snapshot() {
        let mut session = ViewSession::new("t1", SyncConfig::default());
        let effects = session.open(Instant::now());
        assert_eq!(
            effects,
            vec![
                Effect::Fetch(Fetch::History { limit: 200 }),
                Effect::Fetch(Fetch::Snapshot { as_of_seq: 0 }),
            ]
        );
    }

    #[test]
    fn responses_for_other_tasks_are_discarded() {
        let mut session = ViewSession::new("t1", SyncConfig::default());
        let now = Instant::now();
        session.open(now);
        session.handle(
            Envelope::new("t2", Inbound::History(Ok(vec![status_row(3, "running")]))),
            now,
        );
        assert_eq!(session.last_seq(), 0);
        assert!(session.store().liveness().status().is_none());
    }

    #[test]
    fn full_delta_page_requests_next_page() {
        let config = SyncConfig {
            delta_limit: 2,
            ..SyncConfig::default()
        };
        let mut session = ViewSession::new("t1", config);
        let now = Instant::now();
        session.open(now);
        session.handle(Envelope::new("t1", Inbound::History(Ok(Vec::new()))), now);
        let effects = session.handle(
            Envelope::new(
                "t1",
                Inbound::Delta {
                    after: 0,
                    result: Ok(vec![status_row(1, "planning"), status_row(2, "running")]),
                },
            ),
            now,
        );
        assert_eq!(
            effects,
            vec![Effect::Fetch(Fetch::Delta { after: 2, limit: 2 })]
        );
    }

    #[test]
    fn cancel_gate_and_failed_ack() {
        let mut session = ViewSession::new("t1", SyncConfig::default());
        let now = Instant::now();
        session.open(now);
        session.handle(
            Envelope::new("t1", Inbound::History(Ok(vec![status_row(1, "running")]))),
            now,
        );
        assert_eq!(
            session.command(UserCommand::Cancel, now),
            Ok(vec![Effect::Send(Outbound::Cancel)])
        );
        assert_eq!(
            session.command(UserCommand::Cancel, now),
            Err(CommandRejected::CancelUnavailable)
        );
        session.handle(
            Envelope::new(
                "t1",
                Inbound::CommandDone {
                    command: Outbound::Cancel,
                    result: Err(ApiError::Timeout),
                },
            ),
            now,
        );
        assert!(session.snapshot().can_cancel);
    }

    #[test]
    fn continue_is_refused_while_running_and_echoed_otherwise() {
        let mut session = ViewSession::new("t1", SyncConfig::default());
        let now = Instant::now();
        session.open(now);
        session.handle(
            Envelope::new("t1", Inbound::History(Ok(vec![status_row(1, "running")]))),
            now,
        );
        let message = UserCommand::Continue {
            message: "add a summary".to_string(),
        };
        assert_eq!(
            session.command(message.clone(), now),
            Err(CommandRejected::TaskBusy)
        );
        session.handle(
            Envelope::new("t1", Inbound::Delta {
                after: 1,
                result: Ok(vec![status_row(2, "succeeded")]),
            }),
            now,
        );
        assert_eq!(
            session.store().liveness().status(),
            Some(TaskStatus::Succeeded)
        );
        let effects = session.command(message, now).expect("continue accepted");
        assert_eq!(
            effects,
            vec![Effect::Send(Outbound::Continue {
                message: "add a summary".to_string()
            })]
        );
        let chat = session.store().chat();
        assert_eq!(chat.len(), 1);
        assert_eq!(chat[0].seq, None);
    }

    #[test]
    fn successful_delete_tears_down() {
        let mut session = ViewSession::new("t1", SyncConfig::default());
        let now = Instant::now();
        let effects = session.handle(
            Envelope::new(
                "t1",
                Inbound::CommandDone {
                    command: Outbound::Delete,
                    result: Ok(()),
                },
            ),
            now,
        );
        assert_eq!(effects, vec![Effect::Teardown]);
        assert!(session.is_closed());
        assert!(session.tick(now).is_empty());
        assert_eq!(
            session.command(UserCommand::Delete, now),
            Err(CommandRejected::Closed)
        );
    }

    #[test]
    fn citations_are_single_flight() {
        let mut session = ViewSession::new("t1", SyncConfig::default());
        let now = Instant::now();
        let first = session
            .command(UserCommand::RequestCitations, now)
            .expect("request");
        assert_eq!(first.len(), 1);
        assert!(session
            .command(UserCommand::RequestCitations, now)
            .expect("request")
            .is_empty());
        assert!(session.snapshot().citations.is_none());
    }
}
