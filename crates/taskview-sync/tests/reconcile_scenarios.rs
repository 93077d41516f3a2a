use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use taskview_core::wire::{
    CitationsResponse, EventRow, FilesResponse, PushFrame, StepRecord, TaskRecord, TaskSnapshot,
};
use taskview_core::{ApprovalDecision, ChatRole, StepStatus, TaskStatus};
use taskview_sync::dispatch::{delete_with_backoff, DispatchPolicy};
use taskview_sync::push::{run_push_listener, PushBackoff, PushEvent};
use taskview_sync::session::{Envelope, Inbound};
use taskview_sync::transport::ByteStream;
use taskview_sync::{
    spawn_view, ApiError, SyncConfig, TaskApi, UserCommand, ViewSession, ViewSnapshot, ViewUpdate,
};

const TASK: &str = "task-1";

fn row(seq: u64, kind: &str, step_id: Option<&str>, payload: Value) -> EventRow {
    EventRow {
        seq,
        ts: 1_700_000_000.0 + seq as f64,
        kind: kind.to_string(),
        task_id: Some(TASK.to_string()),
        step_id: step_id.map(str::to_string),
        payload,
    }
}

fn task_status(seq: u64, status: &str) -> EventRow {
    row(seq, "task_update", None, json!({"fields": {"status": status}}))
}

fn step_status(seq: u64, step_id: &str, idx: u32, status: &str) -> EventRow {
    row(
        seq,
        "step_update",
        Some(step_id),
        json!({"fields": {"status": status, "idx": idx, "name": step_id}}),
    )
}

fn chat(seq: u64, role: &str, content: &str) -> EventRow {
    row(seq, "chat_message", None, json!({"role": role, "content": content}))
}

fn event_log_push(source: &EventRow) -> PushFrame {
    PushFrame {
        kind: "event_log".to_string(),
        data: json!({
            "task_id": TASK,
            "type": source.kind,
            "step_id": source.step_id,
            "payload": source.payload,
            "seq": source.seq,
        }),
        ts: source.ts,
    }
}

fn history(session: &mut ViewSession, rows: Vec<EventRow>) {
    session.handle(Envelope::new(TASK, Inbound::History(Ok(rows))), Instant::now());
}

fn delta(session: &mut ViewSession, after: u64, rows: Vec<EventRow>) {
    session.handle(
        Envelope::new(
            TASK,
            Inbound::Delta {
                after,
                result: Ok(rows),
            },
        ),
        Instant::now(),
    );
}

fn push(session: &mut ViewSession, frame: PushFrame) {
    session.handle(Envelope::new(TASK, Inbound::Push(frame)), Instant::now());
}

fn open_session() -> ViewSession {
    let mut session = ViewSession::new(TASK, SyncConfig::default());
    session.open(Instant::now());
    session
}

fn chat_count(snapshot: &ViewSnapshot, content: &str) -> usize {
    snapshot
        .chat
        .iter()
        .filter(|message| message.content == content)
        .count()
}

#[test]
fn duplicate_delta_after_history_applies_once() {
    let mut session = open_session();
    history(
        &mut session,
        vec![
            task_status(1, "queued"),
            step_status(2, "A", 0, "queued"),
            step_status(3, "A", 0, "running"),
            chat(4, "user", "hello"),
            step_status(5, "A", 0, "succeeded"),
        ],
    );
    delta(
        &mut session,
        5,
        vec![step_status(3, "A", 0, "running"), task_status(6, "succeeded")],
    );

    let snapshot = session.snapshot();
    assert_eq!(snapshot.steps.len(), 1);
    assert_eq!(snapshot.steps[0].status, StepStatus::Succeeded);
    assert_eq!(chat_count(&snapshot, "hello"), 1);
    assert_eq!(snapshot.task.status, Some(TaskStatus::Succeeded));
    assert_eq!(session.last_seq(), 6);
}

#[test]
fn push_ahead_of_poll_fills_the_gap_exactly_once() {
    let mut session = open_session();
    history(&mut session, vec![task_status(7, "running")]);

    let rows = vec![
        chat(8, "assistant", "working on it"),
        chat(9, "assistant", "halfway there"),
        chat(10, "assistant", "done"),
    ];
    push(&mut session, event_log_push(&rows[2]));
    assert_eq!(session.last_seq(), 10);
    assert_eq!(session.poll_cursor(), 7);

    delta(&mut session, 7, rows);
    assert_eq!(session.last_seq(), 10);
    assert_eq!(session.poll_cursor(), 10);

    let contents: Vec<&str> = session
        .store()
        .chat()
        .iter()
        .map(|message| message.content.as_str())
        .collect();
    assert_eq!(contents, vec!["working on it", "halfway there", "done"]);
}

#[test]
fn decision_for_another_step_leaves_pending_approval() {
    let mut session = open_session();
    history(
        &mut session,
        vec![
            task_status(1, "waiting_approval"),
            row(
                2,
                "approval_requested",
                Some("X"),
                json!({"tool": "shell", "scope": "workspace"}),
            ),
            row(
                3,
                "approval_decided",
                Some("Y"),
                json!({"decision": "approve", "tool": "browser"}),
            ),
        ],
    );

    let snapshot = session.snapshot();
    let pending = snapshot.pending_approval.expect("approval still pending");
    assert_eq!(pending.step_id, "X");
    assert_eq!(snapshot.task.status, Some(TaskStatus::WaitingApproval));

    let y = snapshot.steps.iter().find(|step| step.id == "Y").expect("step Y");
    assert_eq!(y.detail, vec!["approval approved for browser".to_string()]);
    let x_detail = snapshot
        .steps
        .iter()
        .find(|step| step.id == "X")
        .map(|step| step.detail.clone())
        .unwrap_or_default();
    assert!(x_detail.is_empty());
}

#[test]
fn snapshot_not_found_warns_then_clears() {
    let mut session = open_session();
    let now = Instant::now();
    session.handle(
        Envelope::new(
            TASK,
            Inbound::Snapshot {
                as_of_seq: 0,
                result: Err(ApiError::Http {
                    status: 404,
                    body: "task not found".to_string(),
                }),
            },
        ),
        now,
    );
    let warning = session.snapshot().health.expect("warning shown");
    assert!(warning.contains("not found"), "{warning}");

    session.handle(
        Envelope::new(
            TASK,
            Inbound::Snapshot {
                as_of_seq: 0,
                result: Ok(task_snapshot("running")),
            },
        ),
        now,
    );
    assert_eq!(session.snapshot().health, None);
}

#[test]
fn transient_failure_needs_a_second_strike() {
    let mut session = open_session();
    let now = Instant::now();
    let failure = || {
        Envelope::new(
            TASK,
            Inbound::Delta {
                after: 0,
                result: Err(ApiError::Unreachable {
                    message: "connection refused".to_string(),
                }),
            },
        )
    };
    session.handle(failure(), now);
    assert_eq!(session.snapshot().health, None);
    session.handle(failure(), now + Duration::from_millis(10));
    assert!(session.snapshot().health.is_some());
}

#[test]
fn decision_seen_by_poll_and_push_is_recorded_once() {
    let requested = vec![
        task_status(1, "waiting_approval"),
        row(2, "approval_requested", Some("X"), json!({"tool": "shell"})),
    ];
    let decided = row(
        3,
        "approval_decided",
        Some("X"),
        json!({"decision": "approve", "tool": "shell"}),
    );
    let echo = PushFrame {
        kind: "approval_decided".to_string(),
        data: json!({"task_id": TASK, "step_id": "X", "decision": "approve", "tool": "shell"}),
        ts: decided.ts + 0.01,
    };

    let mut poll_first = open_session();
    history(&mut poll_first, requested.clone());
    delta(&mut poll_first, 2, vec![decided.clone()]);
    push(&mut poll_first, echo.clone());

    let mut push_first = open_session();
    history(&mut push_first, requested);
    push(&mut push_first, echo);
    delta(&mut push_first, 2, vec![decided]);

    let snapshot = poll_first.snapshot();
    assert_eq!(snapshot, push_first.snapshot());
    assert!(snapshot.pending_approval.is_none());
    assert_eq!(snapshot.task.status, Some(TaskStatus::Running));
    let x = snapshot.steps.iter().find(|step| step.id == "X").expect("step X");
    assert_eq!(x.detail, vec!["approval approved for shell".to_string()]);
}

#[test]
fn transient_failures_on_different_polls_add_up() {
    let mut session = open_session();
    let now = Instant::now();
    let unreachable = || ApiError::Unreachable {
        message: "connection refused".to_string(),
    };
    session.handle(
        Envelope::new(
            TASK,
            Inbound::Snapshot {
                as_of_seq: 0,
                result: Err(unreachable()),
            },
        ),
        now,
    );
    assert_eq!(session.snapshot().health, None);
    session.handle(
        Envelope::new(
            TASK,
            Inbound::Delta {
                after: 0,
                result: Err(unreachable()),
            },
        ),
        now + Duration::from_millis(10),
    );
    assert!(session.snapshot().health.is_some());
}

#[test]
fn successful_delta_clears_a_snapshot_warning() {
    let mut session = open_session();
    let now = Instant::now();
    session.handle(
        Envelope::new(
            TASK,
            Inbound::Snapshot {
                as_of_seq: 0,
                result: Err(ApiError::Http {
                    status: 404,
                    body: "task not found".to_string(),
                }),
            },
        ),
        now,
    );
    assert!(session.snapshot().health.is_some());
    delta(&mut session, 0, Vec::new());
    assert_eq!(session.snapshot().health, None);
}

#[test]
fn delivery_order_does_not_change_the_result() {
    let rows = vec![
        task_status(1, "running"),
        step_status(2, "plan", 0, "running"),
        chat(3, "user", "summarize the report"),
        step_status(4, "plan", 0, "succeeded"),
        chat(5, "assistant", "summary attached"),
        task_status(6, "succeeded"),
    ];

    let mut reference = open_session();
    history(&mut reference, rows.clone());
    let expected = reference.snapshot();

    for order in permutations(&[0usize, 1, 2, 3, 4, 5]) {
        let mut session = open_session();
        for (n, index) in order.iter().enumerate() {
            let source = rows[*index].clone();
            if n % 2 == 0 {
                push(&mut session, event_log_push(&source));
            } else {
                delta(&mut session, 0, vec![source]);
            }
        }
        assert_eq!(session.snapshot(), expected, "order {order:?}");
    }
}

#[test]
fn replaying_history_is_a_no_op() {
    let rows = vec![
        task_status(1, "running"),
        step_status(2, "fetch", 0, "running"),
        chat(3, "assistant", "fetching sources"),
    ];
    let mut session = open_session();
    history(&mut session, rows.clone());
    let first = session.snapshot();
    session.take_changes();

    history(&mut session, rows);
    assert_eq!(session.snapshot(), first);
    assert!(session.take_changes().is_empty());
}

#[test]
fn stale_snapshot_does_not_roll_back_newer_events() {
    let mut session = open_session();
    history(&mut session, vec![task_status(4, "succeeded")]);
    session.handle(
        Envelope::new(
            TASK,
            Inbound::Snapshot {
                as_of_seq: 3,
                result: Ok(task_snapshot("running")),
            },
        ),
        Instant::now(),
    );
    assert_eq!(session.snapshot().task.status, Some(TaskStatus::Succeeded));
}

#[test]
fn local_echo_is_confirmed_by_the_server_copy() {
    let mut session = open_session();
    history(&mut session, vec![task_status(1, "succeeded")]);
    session
        .command(
            UserCommand::Continue {
                message: "one more pass".to_string(),
            },
            Instant::now(),
        )
        .expect("continue accepted");
    delta(&mut session, 1, vec![chat(2, "user", "one more pass")]);

    let messages = session.store().chat();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].seq, Some(2));
    assert_eq!(messages[0].role, ChatRole::User);
}

fn task_snapshot(status: &str) -> TaskSnapshot {
    TaskSnapshot {
        task: TaskRecord {
            id: TASK.to_string(),
            status: status.to_string(),
            updated_at: None,
            goal: Some("write the report".to_string()),
            error: None,
            output_path: None,
        },
        steps: vec![StepRecord {
            id: "plan".to_string(),
            idx: Some(0),
            name: Some("plan".to_string()),
            status: Some("running".to_string()),
            tool: None,
        }],
        approvals: Vec::new(),
    }
}

fn permutations(items: &[usize]) -> Vec<Vec<usize>> {
    if items.len() <= 1 {
        return vec![items.to_vec()];
    }
    let mut out = Vec::new();
    for (i, first) in items.iter().enumerate() {
        let mut rest = items.to_vec();
        rest.remove(i);
        for mut tail in permutations(&rest) {
            tail.insert(0, *first);
            out.push(tail);
        }
    }
    out
}

#[derive(Default)]
struct ScriptedApi {
    history: Vec<EventRow>,
    snapshot: Option<TaskSnapshot>,
    busy_deletes: Mutex<u32>,
    calls: Mutex<Vec<String>>,
    push_chunks: Vec<&'static str>,
}

impl ScriptedApi {
    fn record(&self, call: impl Into<String>) {
        self.calls.lock().expect("calls lock").push(call.into());
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }
}

#[async_trait]
impl TaskApi for ScriptedApi {
    async fn history(&self, _task_id: &str, _limit: u32) -> Result<Vec<EventRow>, ApiError> {
        self.record("history");
        Ok(self.history.clone())
    }

    async fn delta(&self, _task_id: &str, _after: u64, _limit: u32) -> Result<Vec<EventRow>, ApiError> {
        Ok(Vec::new())
    }

    async fn snapshot(&self, _task_id: &str) -> Result<TaskSnapshot, ApiError> {
        self.snapshot.clone().ok_or(ApiError::Http {
            status: 404,
            body: "task not found".to_string(),
        })
    }

    async fn citations(&self, _task_id: &str) -> Result<CitationsResponse, ApiError> {
        Ok(CitationsResponse::default())
    }

    async fn files(&self, _task_id: &str) -> Result<FilesResponse, ApiError> {
        Ok(FilesResponse::default())
    }

    async fn approve(
        &self,
        _task_id: &str,
        step_id: &str,
        decision: ApprovalDecision,
        _reason: Option<&str>,
    ) -> Result<(), ApiError> {
        self.record(format!("approve {step_id} {decision}"));
        Ok(())
    }

    async fn cancel(&self, _task_id: &str) -> Result<(), ApiError> {
        self.record("cancel");
        Ok(())
    }

    async fn continue_task(&self, _task_id: &str, message: &str) -> Result<(), ApiError> {
        self.record(format!("continue {message}"));
        Ok(())
    }

    async fn delete_task(&self, _task_id: &str) -> Result<(), ApiError> {
        self.record("delete");
        let mut busy = self.busy_deletes.lock().expect("busy lock");
        if *busy > 0 {
            *busy -= 1;
            return Err(ApiError::Http {
                status: 409,
                body: "database is locked".to_string(),
            });
        }
        Ok(())
    }

    async fn open_file(&self, _task_id: &str, file_id: &str) -> Result<(), ApiError> {
        self.record(format!("open {file_id}"));
        Ok(())
    }

    async fn open_push(&self) -> Result<ByteStream, ApiError> {
        if self.push_chunks.is_empty() {
            return Err(ApiError::Unreachable {
                message: "no push stream scripted".to_string(),
            });
        }
        let chunks: Vec<Result<Vec<u8>, ApiError>> = self
            .push_chunks
            .iter()
            .map(|chunk| Ok(chunk.as_bytes().to_vec()))
            .collect();
        Ok(Box::pin(stream::iter(chunks).chain(stream::pending())))
    }
}

#[tokio::test(start_paused = true)]
async fn delete_retries_while_busy() {
    let api = ScriptedApi {
        busy_deletes: Mutex::new(2),
        ..ScriptedApi::default()
    };
    let policy = DispatchPolicy::from(&SyncConfig::default());
    let started = tokio::time::Instant::now();
    delete_with_backoff(&api, TASK, policy)
        .await
        .expect("delete eventually succeeds");
    assert_eq!(api.calls(), vec!["delete", "delete", "delete"]);
    assert!(started.elapsed() >= Duration::from_millis(2_500));
}

#[tokio::test(start_paused = true)]
async fn delete_gives_up_after_the_attempt_budget() {
    let api = ScriptedApi {
        busy_deletes: Mutex::new(10),
        ..ScriptedApi::default()
    };
    let policy = DispatchPolicy::from(&SyncConfig::default());
    let err = delete_with_backoff(&api, TASK, policy)
        .await
        .expect_err("still busy");
    assert!(err.is_busy());
    assert_eq!(api.calls().len(), 4);
}

async fn next_update(updates: &mut tokio::sync::mpsc::Receiver<ViewUpdate>) -> ViewUpdate {
    tokio::time::timeout(Duration::from_secs(5), updates.recv())
        .await
        .expect("update before timeout")
        .expect("view still running")
}

#[tokio::test]
async fn running_view_reflects_history_and_tears_down_on_delete() {
    let api = Arc::new(ScriptedApi {
        history: vec![task_status(1, "running"), chat(2, "user", "draft the memo")],
        snapshot: Some(task_snapshot("running")),
        ..ScriptedApi::default()
    });
    let config = SyncConfig {
        push_enabled: false,
        tick_ms: 10,
        ..SyncConfig::default()
    };
    let mut handle = spawn_view(api.clone(), TASK, config);

    loop {
        match next_update(&mut handle.updates).await {
            ViewUpdate::Changed { snapshot, .. }
                if snapshot.task.status == Some(TaskStatus::Running)
                    && chat_count(&snapshot, "draft the memo") == 1 =>
            {
                assert!(snapshot.can_cancel);
                break;
            }
            _ => {}
        }
    }

    handle
        .commands
        .send(UserCommand::Continue {
            message: "more detail".to_string(),
        })
        .await
        .expect("command sent");
    loop {
        if let ViewUpdate::Rejected { reason } = next_update(&mut handle.updates).await {
            assert_eq!(reason.to_string(), "task is still working; wait for it to finish or cancel it");
            break;
        }
    }

    handle.commands.send(UserCommand::Delete).await.expect("command sent");
    loop {
        if let ViewUpdate::Closed = next_update(&mut handle.updates).await {
            break;
        }
    }
    handle.join.await.expect("view task joins");
    assert!(api.calls().contains(&"delete".to_string()));
}

const PUSHED_CHAT: [&str; 4] = [
    ": keepalive\n\n",
    "event: event_log\ndata: {\"type\": \"event_log\", \"ts\": 1700000002.5, \"data\": {\"task_id\": \"task-1\", ",
    "\"type\": \"chat_message\", \"seq\": 2, \"payload\": {\"role\": \"assistant\", \"content\": \"pushed over the wire\"}}}\n",
    "\n",
];

async fn next_push(rx: &mut tokio::sync::mpsc::Receiver<PushEvent>) -> PushEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("event before timeout")
        .expect("listener running")
}

#[tokio::test]
async fn push_listener_reassembles_split_frames() {
    let api = Arc::new(ScriptedApi {
        push_chunks: PUSHED_CHAT.to_vec(),
        ..ScriptedApi::default()
    });
    let (tx, mut rx) = tokio::sync::mpsc::channel(8);
    let backoff = PushBackoff {
        initial: Duration::from_millis(10),
        max: Duration::from_millis(100),
    };
    let listener = tokio::spawn(run_push_listener(api, tx, backoff));

    assert_eq!(next_push(&mut rx).await, PushEvent::Connected);
    let PushEvent::Frame(frame) = next_push(&mut rx).await else {
        panic!("expected a frame");
    };
    assert_eq!(frame.kind, "event_log");
    assert_eq!(frame.task_id(), Some(TASK));
    assert_eq!(frame.data["seq"], json!(2));

    drop(rx);
    listener.abort();
}

#[tokio::test]
async fn running_view_applies_pushed_events() {
    let api = Arc::new(ScriptedApi {
        history: vec![task_status(1, "running")],
        snapshot: Some(task_snapshot("running")),
        push_chunks: PUSHED_CHAT.to_vec(),
        ..ScriptedApi::default()
    });
    let config = SyncConfig {
        push_enabled: true,
        tick_ms: 10,
        ..SyncConfig::default()
    };
    let mut handle = spawn_view(api, TASK, config);

    loop {
        if let ViewUpdate::Changed { snapshot, .. } = next_update(&mut handle.updates).await {
            if chat_count(&snapshot, "pushed over the wire") == 1 {
                break;
            }
        }
    }

    drop(handle.commands);
    let _ = handle.join.await;
}
