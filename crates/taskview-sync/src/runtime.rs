use crate::config::SyncConfig;
use crate::dispatch::{dispatch, DispatchPolicy};
use crate::push::{run_push_listener, PushBackoff, PushEvent};
use crate::session::{CommandRejected, Effect, Envelope, Fetch, Inbound, UserCommand, ViewSession};
use crate::store::{ChangeKind, ViewSnapshot};
use crate::transport::{with_deadline, TaskApi};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

const CHANNEL_DEPTH: usize = 256;

#[derive(Debug, Clone)]
pub enum ViewUpdate {
    Changed {
        changes: BTreeSet<ChangeKind>,
        snapshot: ViewSnapshot,
    },
    Rejected {
        reason: CommandRejected,
    },
    Closed,
}

/// Channels to a running view. Dropping `commands` closes the view.
pub struct ViewHandle {
    pub commands: mpsc::Sender<UserCommand>,
    pub updates: mpsc::Receiver<ViewUpdate>,
    pub join: JoinHandle<()>,
}

pub fn spawn_view(api: Arc<dyn TaskApi>, task_id: impl Into<String>, config: SyncConfig) -> ViewHandle {
    let (commands_tx, commands_rx) = mpsc::channel(CHANNEL_DEPTH);
    let (updates_tx, updates_rx) = mpsc::channel(CHANNEL_DEPTH);
    let task_id = task_id.into();
    let join = tokio::spawn(run_view(api, task_id, config, commands_rx, updates_tx));
    ViewHandle {
        commands: commands_tx,
        updates: updates_rx,
        join,
    }
}

/// Drives one [`ViewSession`] until the command channel closes, the
/// update receiver goes away, or the task is deleted.
pub async fn run_view(
    api: Arc<dyn TaskApi>,
    task_id: String,
    config: SyncConfig,
    mut commands: mpsc::Receiver<UserCommand>,
    updates: mpsc::Sender<ViewUpdate>,
) {
    let (inbound_tx, mut inbound_rx) = mpsc::channel::<Envelope>(CHANNEL_DEPTH);
    let (push_tx, mut push_rx) = mpsc::channel::<PushEvent>(CHANNEL_DEPTH);
    let push_task = if config.push_enabled {
        let backoff = PushBackoff {
            initial: config.push_backoff_initial(),
            max: config.push_backoff_max(),
        };
        Some(tokio::spawn(run_push_listener(api.clone(), push_tx, backoff)))
    } else {
        drop(push_tx);
        None
    };

    let mut session = ViewSession::new(task_id.clone(), config.clone());
    let policy = DispatchPolicy::from(&config);
    let mut ticker = tokio::time::interval(config.tick());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let effects = session.open(now());
    let mut teardown = perform(&api, &task_id, &config, policy, effects, &inbound_tx);

    while !teardown {
        let effects = tokio::select! {
            _ = ticker.tick() => session.tick(now()),
            Some(envelope) = inbound_rx.recv() => session.handle(envelope, now()),
            Some(event) = push_rx.recv() => {
                let inbound = match event {
                    PushEvent::Connected => Inbound::PushStatus { connected: true },
                    PushEvent::Disconnected { .. } => Inbound::PushStatus { connected: false },
                    PushEvent::Frame(frame) => Inbound::Push(frame),
                };
                session.handle(Envelope::new(task_id.clone(), inbound), now())
            }
            command = commands.recv() => match command {
                Some(command) => match session.command(command, now()) {
                    Ok(effects) => effects,
                    Err(reason) => {
                        debug!("command_rejected: {reason}");
                        if updates.send(ViewUpdate::Rejected { reason }).await.is_err() {
                            break;
                        }
                        Vec::new()
                    }
                },
                None => break,
            },
        };
        teardown = perform(&api, &task_id, &config, policy, effects, &inbound_tx);

        let changes = session.take_changes();
        if !changes.is_empty() {
            let snapshot = session.snapshot();
            if updates
                .send(ViewUpdate::Changed { changes, snapshot })
                .await
                .is_err()
            {
                break;
            }
        }
    }

    if teardown {
        let _ = updates.send(ViewUpdate::Closed).await;
    }
    if let Some(task) = push_task {
        task.abort();
    }
    info!("view_closed: task_id={task_id}");
}

fn now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}

/// Starts every effect in the background. Returns true on teardown.
fn perform(
    api: &Arc<dyn TaskApi>,
    task_id: &str,
    config: &SyncConfig,
    policy: DispatchPolicy,
    effects: Vec<Effect>,
    inbound_tx: &mpsc::Sender<Envelope>,
) -> bool {
    let mut teardown = false;
    for effect in effects {
        match effect {
            Effect::Fetch(fetch) => {
                let api = api.clone();
                let task_id = task_id.to_string();
                let tx = inbound_tx.clone();
                let limit = fetch_timeout(config, &fetch);
                tokio::spawn(async move {
                    let inbound = run_fetch(api.as_ref(), &task_id, fetch, limit).await;
                    let _ = tx.send(Envelope::new(task_id, inbound)).await;
                });
            }
            Effect::Send(command) => {
                let api = api.clone();
                let task_id = task_id.to_string();
                let tx = inbound_tx.clone();
                tokio::spawn(async move {
                    let result = dispatch(api.as_ref(), &task_id, &command, policy).await;
                    let _ = tx
                        .send(Envelope::new(task_id, Inbound::CommandDone { command, result }))
                        .await;
                });
            }
            Effect::Teardown => teardown = true,
        }
    }
    teardown
}

fn fetch_timeout(config: &SyncConfig, fetch: &Fetch) -> Duration {
    let ms = match fetch {
        Fetch::History { .. } => config.history_timeout_ms,
        Fetch::Delta { .. } => config.delta_timeout_ms,
        Fetch::Snapshot { .. } => config.snapshot_timeout_ms,
        Fetch::Citations { .. } => config.citations_timeout_ms,
        Fetch::Files { .. } => config.files_timeout_ms,
    };
    Duration::from_millis(ms)
}

async fn run_fetch(api: &dyn TaskApi, task_id: &str, fetch: Fetch, limit: Duration) -> Inbound {
    match fetch {
        Fetch::History { limit: rows } => {
            Inbound::History(with_deadline(limit, api.history(task_id, rows)).await)
        }
        Fetch::Delta { after, limit: rows } => Inbound::Delta {
            after,
            result: with_deadline(limit, api.delta(task_id, after, rows)).await,
        },
        Fetch::Snapshot { as_of_seq } => Inbound::Snapshot {
            as_of_seq,
            result: with_deadline(limit, api.snapshot(task_id)).await,
        },
        Fetch::Citations { ticket } => Inbound::Citations {
            ticket,
            result: with_deadline(limit, api.citations(task_id)).await,
        },
        Fetch::Files { ticket } => {
            let result = with_deadline(limit, api.files(task_id)).await;
            if let Err(err) = &result {
                warn!("files_fetch_failed: task_id={task_id} err={err}");
            }
            Inbound::Files { ticket, result }
        }
    }
}
