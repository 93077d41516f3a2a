use std::collections::{BTreeSet, HashMap};
use taskview_core::{ts_to_datetime, ChatRole};
use taskview_sync::{ChangeKind, ViewSnapshot};

/// Turns change notifications into plain output lines.
#[derive(Debug, Default)]
pub struct LineRenderer {
    /// Copies of each (role, text) already printed.
    chat_printed: HashMap<(ChatRole, String), usize>,
    step_detail_seen: HashMap<String, u64>,
    activity_seen: u64,
}

/// The newest `appended - seen` lines of a ring, bounded by what it still holds.
fn unseen(lines: &[String], appended: u64, seen: u64) -> &[String] {
    let fresh = usize::try_from(appended.saturating_sub(seen)).unwrap_or(usize::MAX);
    &lines[lines.len() - fresh.min(lines.len())..]
}

impl LineRenderer {
    pub fn render(&mut self, changes: &BTreeSet<ChangeKind>, snapshot: &ViewSnapshot) -> Vec<String> {
        let mut lines = Vec::new();
        for change in changes {
            match change {
                ChangeKind::Task => self.render_task(snapshot, &mut lines),
                ChangeKind::Step => self.render_steps(snapshot, &mut lines),
                ChangeKind::Chat => self.render_chat(snapshot, &mut lines),
                ChangeKind::Approval => lines.push(match &snapshot.pending_approval {
                    Some(pending) => {
                        let mut line = format!("approval needed: step {}", pending.step_id);
                        if let Some(tool) = &pending.tool {
                            line.push_str(&format!(" tool={tool}"));
                        }
                        if let Some(scope) = &pending.scope {
                            line.push_str(&format!(" scope={scope}"));
                        }
                        line.push_str(" (approve/reject)");
                        line
                    }
                    None => "approval: none pending".to_string(),
                }),
                ChangeKind::Citations => {
                    let count = snapshot.citations.as_ref().map_or(0, Vec::len);
                    lines.push(format!("citations: {count} sources"));
                }
                ChangeKind::Files => {
                    let Some(files) = &snapshot.files else {
                        continue;
                    };
                    lines.push(format!("files: {}", files.files.len()));
                    for file in &files.files {
                        lines.push(format!("  {} {} ({} bytes)", file.id, file.name, file.size));
                    }
                }
                ChangeKind::Health => lines.push(match &snapshot.health {
                    Some(message) => format!("warning: {message}"),
                    None => "connection ok".to_string(),
                }),
            }
        }
        lines
    }

    fn render_task(&mut self, snapshot: &ViewSnapshot, lines: &mut Vec<String>) {
        let task = &snapshot.task;
        let status = task.status.map_or("unknown", |status| status.as_str());
        let mut line = format!("task {} {status}", task.id);
        if snapshot.can_cancel {
            line.push_str(" [cancel]");
        }
        if snapshot.can_continue {
            line.push_str(" [say]");
        }
        lines.push(line);
        if let Some(error) = &task.error {
            lines.push(format!("  error: {error}"));
        }
        if let Some(path) = &task.output_path {
            lines.push(format!("  output: {path}"));
        }
        for entry in unseen(&task.activity, task.activity_appended, self.activity_seen) {
            lines.push(format!("  · {entry}"));
        }
        self.activity_seen = task.activity_appended;
    }

    fn render_steps(&mut self, snapshot: &ViewSnapshot, lines: &mut Vec<String>) {
        let done = snapshot
            .steps
            .iter()
            .filter(|step| step.status.is_done())
            .count();
        lines.push(format!("steps: {done}/{} done", snapshot.steps.len()));
        for step in &snapshot.steps {
            let name = step.name.as_deref().unwrap_or(&step.id);
            lines.push(format!("  {:<10} {name}", step.status.as_str()));
            let seen = self.step_detail_seen.entry(step.id.clone()).or_insert(0);
            for entry in unseen(&step.detail, step.detail_appended, *seen) {
                lines.push(format!("      · {entry}"));
            }
            *seen = step.detail_appended;
        }
    }

    /// Late fills land mid-transcript, so messages are matched by content
    /// rather than by position.
    fn render_chat(&mut self, snapshot: &ViewSnapshot, lines: &mut Vec<String>) {
        let mut occurrences: HashMap<(ChatRole, &str), usize> = HashMap::new();
        for message in &snapshot.chat {
            let nth = occurrences
                .entry((message.role, message.content.as_str()))
                .or_insert(0);
            *nth += 1;
            let printed = self
                .chat_printed
                .entry((message.role, message.content.clone()))
                .or_insert(0);
            if *nth <= *printed {
                continue;
            }
            *printed = *nth;
            let at = ts_to_datetime(message.ts)
                .map(|at| at.format("%H:%M:%S").to_string())
                .unwrap_or_default();
            lines.push(format!("{at} {}> {}", message.role, message.content));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskview_core::{StepStatus, TaskStatus};
    use taskview_sync::store::{ChatMessage, StepView, TaskView};

    fn snapshot() -> ViewSnapshot {
        ViewSnapshot {
            task: TaskView {
                id: "t1".to_string(),
                status: Some(TaskStatus::Running),
                updated_at: None,
                goal: None,
                error: None,
                output_path: None,
                activity: Vec::new(),
                activity_appended: 0,
            },
            steps: Vec::new(),
            chat: Vec::new(),
            pending_approval: None,
            citations: None,
            files: None,
            can_cancel: true,
            can_continue: false,
            health: None,
        }
    }

    #[test]
    fn chat_lines_print_once() {
        let mut renderer = LineRenderer::default();
        let mut view = snapshot();
        view.chat.push(ChatMessage {
            role: ChatRole::User,
            content: "hello".to_string(),
            ts: 0.0,
            seq: Some(1),
        });
        let changes = BTreeSet::from([ChangeKind::Chat]);
        assert_eq!(renderer.render(&changes, &view), vec!["00:00:00 user> hello"]);
        assert!(renderer.render(&changes, &view).is_empty());
    }

    #[test]
    fn task_line_shows_affordances() {
        let mut renderer = LineRenderer::default();
        let changes = BTreeSet::from([ChangeKind::Task]);
        assert_eq!(
            renderer.render(&changes, &snapshot()),
            vec!["task t1 running [cancel]"]
        );
    }

    fn message(content: &str, seq: u64) -> ChatMessage {
        ChatMessage {
            role: ChatRole::Assistant,
            content: content.to_string(),
            ts: seq as f64,
            seq: Some(seq),
        }
    }

    #[test]
    fn late_filled_chat_still_prints() {
        let mut renderer = LineRenderer::default();
        let changes = BTreeSet::from([ChangeKind::Chat]);
        let mut view = snapshot();
        view.chat = vec![message("one", 1), message("three", 3)];
        assert_eq!(renderer.render(&changes, &view).len(), 2);

        view.chat.insert(1, message("two", 2));
        assert_eq!(renderer.render(&changes, &view), vec!["00:00:02 assistant> two"]);
        assert!(renderer.render(&changes, &view).is_empty());
    }

    #[test]
    fn detail_ring_at_capacity_keeps_printing() {
        let mut renderer = LineRenderer::default();
        let changes = BTreeSet::from([ChangeKind::Step]);
        let mut view = snapshot();
        view.steps.push(StepView {
            id: "s1".to_string(),
            name: Some("Fetch".to_string()),
            index: Some(0),
            status: StepStatus::Running,
            tool: None,
            detail: vec!["read a".to_string(), "read b".to_string()],
            detail_appended: 2,
        });
        let first = renderer.render(&changes, &view);
        assert_eq!(first.len(), 4);

        view.steps[0].detail = vec!["read b".to_string(), "read c".to_string()];
        view.steps[0].detail_appended = 3;
        assert_eq!(
            renderer.render(&changes, &view),
            vec![
                "steps: 0/1 done".to_string(),
                "  running    Fetch".to_string(),
                "      · read c".to_string(),
            ]
        );
    }
}
