use crate::lazy_cache::LazyCache;
use crate::liveness::Liveness;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::Duration;
use taskview_core::wire::{CitationChunk, FilesResponse};
use taskview_core::{ChatRole, StepStatus, TaskStatus};

/// Entity kinds a renderer can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Task,
    Step,
    Chat,
    Approval,
    Citations,
    Files,
    Health,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Task => "task",
            ChangeKind::Step => "step",
            ChangeKind::Chat => "chat",
            ChangeKind::Approval => "approval",
            ChangeKind::Citations => "citations",
            ChangeKind::Files => "files",
            ChangeKind::Health => "health",
        }
    }
}

/// A field paired with the seq of the command that last wrote it.
#[derive(Debug, Clone, PartialEq)]
pub struct Clocked<T> {
    value: T,
    clock: u64,
}

impl<T: PartialEq> Clocked<T> {
    pub fn new(value: T) -> Self {
        Self { value, clock: 0 }
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn clock(&self) -> u64 {
        self.clock
    }

    /// Writes unless the field was already set by a newer seq. Returns true
    /// when the stored value changed.
    pub fn offer(&mut self, value: T, seq: u64) -> bool {
        if seq < self.clock {
            return false;
        }
        self.clock = seq;
        if self.value == value {
            return false;
        }
        self.value = value;
        true
    }

    /// Unconditional write that still advances the clock.
    pub(crate) fn force(&mut self, value: T, seq: u64) -> bool {
        self.clock = self.clock.max(seq);
        if self.value == value {
            return false;
        }
        self.value = value;
        true
    }
}

/// Bounded ring of advisory lines; the oldest line is evicted first.
#[derive(Debug, Clone, PartialEq)]
pub struct DetailLog {
    cap: usize,
    lines: VecDeque<String>,
    last_ts: f64,
    appended: u64,
}

impl DetailLog {
    pub fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            lines: VecDeque::new(),
            last_ts: 0.0,
            appended: 0,
        }
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn last_ts(&self) -> f64 {
        self.last_ts
    }

    /// Lines ever accepted, including ones since evicted.
    pub fn appended(&self) -> u64 {
        self.appended
    }

    /// Appends unless `ts` precedes the newest line already recorded.
    pub(crate) fn push(&mut self, line: String, ts: f64) -> bool {
        if ts < self.last_ts {
            return false;
        }
        self.last_ts = ts;
        if self.lines.len() == self.cap {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
        self.appended += 1;
        true
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    pub ts: f64,
    /// `None` for local echoes and seq-less push copies.
    pub seq: Option<u64>,
}

impl ChatMessage {
    pub fn same_text(&self, role: ChatRole, content: &str) -> bool {
        self.role == role && self.content == content
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingApproval {
    pub step_id: String,
    pub tool: Option<String>,
    pub scope: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TaskState {
    pub id: String,
    pub status: Clocked<Option<TaskStatus>>,
    pub updated_at: Clocked<Option<DateTime<Utc>>>,
    pub goal: Clocked<Option<String>>,
    pub error: Clocked<Option<String>>,
    pub output_path: Clocked<Option<String>>,
    pub activity: DetailLog,
}

#[derive(Debug, Clone)]
pub struct Step {
    pub id: String,
    pub name: Clocked<Option<String>>,
    pub index: Clocked<Option<u32>>,
    pub status: Clocked<StepStatus>,
    pub tool: Clocked<Option<String>>,
    pub detail: DetailLog,
    pub(crate) last_decision: Option<String>,
    first_seen: u64,
}

impl Step {
    fn new(id: String, first_seen: u64, detail_cap: usize) -> Self {
        Self {
            id,
            name: Clocked::new(None),
            index: Clocked::new(None),
            status: Clocked::new(StepStatus::Queued),
            tool: Clocked::new(None),
            detail: DetailLog::new(detail_cap),
            last_decision: None,
            first_seen,
        }
    }
}

/// Canonical model of one open task. Written only through the reconciler.
#[derive(Debug)]
pub struct StateStore {
    pub(crate) task: TaskState,
    pub(crate) steps: HashMap<String, Step>,
    pub(crate) chat: Vec<ChatMessage>,
    pub(crate) approval: Clocked<Option<PendingApproval>>,
    pub(crate) liveness: Liveness,
    pub(crate) citations: LazyCache<HashMap<String, CitationChunk>>,
    pub(crate) files: LazyCache<FilesResponse>,
    pub(crate) changes: BTreeSet<ChangeKind>,
    detail_cap: usize,
    next_step_ordinal: u64,
}

impl StateStore {
    pub fn new(
        task_id: impl Into<String>,
        detail_cap: usize,
        citations_min_interval: Duration,
        files_min_interval: Duration,
    ) -> Self {
        Self {
            task: TaskState {
                id: task_id.into(),
                status: Clocked::new(None),
                updated_at: Clocked::new(None),
                goal: Clocked::new(None),
                error: Clocked::new(None),
                output_path: Clocked::new(None),
                activity: DetailLog::new(detail_cap),
            },
            steps: HashMap::new(),
            chat: Vec::new(),
            approval: Clocked::new(None),
            liveness: Liveness::default(),
            citations: LazyCache::new(citations_min_interval),
            files: LazyCache::new(files_min_interval),
            changes: BTreeSet::new(),
            detail_cap,
            next_step_ordinal: 0,
        }
    }

    pub fn task(&self) -> &TaskState {
        &self.task
    }

    pub fn task_id(&self) -> &str {
        &self.task.id
    }

    pub fn step(&self, step_id: &str) -> Option<&Step> {
        self.steps.get(step_id)
    }

    /// Steps in server index order; unindexed steps follow in first-seen order.
    pub fn ordered_steps(&self) -> Vec<&Step> {
        let mut steps: Vec<&Step> = self.steps.values().collect();
        steps.sort_by_key(|step| (step.index.value().unwrap_or(u32::MAX), step.first_seen));
        steps
    }

    pub fn chat(&self) -> &[ChatMessage] {
        &self.chat
    }

    pub fn pending_approval(&self) -> Option<&PendingApproval> {
        self.approval.value().as_ref()
    }

    pub fn liveness(&self) -> &Liveness {
        &self.liveness
    }

    pub fn citations(&self) -> &LazyCache<HashMap<String, CitationChunk>> {
        &self.citations
    }

    pub fn files(&self) -> &LazyCache<FilesResponse> {
        &self.files
    }

    pub(crate) fn mark(&mut self, kind: ChangeKind) {
        self.changes.insert(kind);
    }

    pub(crate) fn ensure_step(&mut self, step_id: &str) -> (&mut Step, bool) {
        let ordinal = self.next_step_ordinal;
        let detail_cap = self.detail_cap;
        let mut created = false;
        let step = self.steps.entry(step_id.to_string()).or_insert_with(|| {
            created = true;
            Step::new(step_id.to_string(), ordinal, detail_cap)
        });
        if created {
            self.next_step_ordinal += 1;
            self.changes.insert(ChangeKind::Step);
        }
        (step, created)
    }

    pub fn snapshot(&self) -> ViewSnapshot {
        let task = &self.task;
        ViewSnapshot {
            task: TaskView {
                id: task.id.clone(),
                status: *task.status.value(),
                updated_at: *task.updated_at.value(),
                goal: task.goal.value().clone(),
                error: task.error.value().clone(),
                output_path: task.output_path.value().clone(),
                activity: task.activity.lines().map(str::to_string).collect(),
                activity_appended: task.activity.appended(),
            },
            steps: self
                .ordered_steps()
                .into_iter()
                .map(|step| StepView {
                    id: step.id.clone(),
                    name: step.name.value().clone(),
                    index: *step.index.value(),
                    status: *step.status.value(),
                    tool: step.tool.value().clone(),
                    detail: step.detail.lines().map(str::to_string).collect(),
                    detail_appended: step.detail.appended(),
                })
                .collect(),
            chat: self.chat.clone(),
            pending_approval: self.approval.value().clone(),
            citations: self.citations.value().map(|chunks| {
                let mut ids: Vec<String> = chunks.keys().cloned().collect();
                ids.sort();
                ids
            }),
            files: self.files.value().cloned(),
            can_cancel: self.liveness.can_cancel(),
            can_continue: self.liveness.can_continue(),
            health: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskView {
    pub id: String,
    pub status: Option<TaskStatus>,
    pub updated_at: Option<DateTime<Utc>>,
    pub goal: Option<String>,
    pub error: Option<String>,
    pub output_path: Option<String>,
    pub activity: Vec<String>,
    pub activity_appended: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepView {
    pub id: String,
    pub name: Option<String>,
    pub index: Option<u32>,
    pub status: StepStatus,
    pub tool: Option<String>,
    pub detail: Vec<String>,
    pub detail_appended: u64,
}

/// Read-only copy of the store handed to renderers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ViewSnapshot {
    pub task: TaskView,
    pub steps: Vec<StepView>,
    pub chat: Vec<ChatMessage>,
    pub pending_approval: Option<PendingApproval>,
    /// Sorted chunk ids; `None` while the index is still loading.
    pub citations: Option<Vec<String>>,
    pub files: Option<FilesResponse>,
    pub can_cancel: bool,
    pub can_continue: bool,
    pub health: Option<String>,
}
