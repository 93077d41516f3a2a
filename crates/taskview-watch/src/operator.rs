use taskview_core::ApprovalDecision;
use taskview_sync::UserCommand;

pub const HELP: &str = "commands: approve [reason] | reject [reason] | cancel | say <message> \
| delete | citations | files | open <file-id> | edit on|off | quit";

#[derive(Debug, Clone, PartialEq)]
pub enum OperatorLine {
    Command(UserCommand),
    Help,
    Quit,
    Empty,
}

/// Parses one line typed at the prompt.
pub fn parse_operator_line(line: &str) -> Result<OperatorLine, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(OperatorLine::Empty);
    }
    let (verb, rest) = match line.split_once(char::is_whitespace) {
        Some((verb, rest)) => (verb, rest.trim()),
        None => (line, ""),
    };
    let reason = || (!rest.is_empty()).then(|| rest.to_string());
    let command = match verb.to_ascii_lowercase().as_str() {
        "approve" | "a" => UserCommand::Decide {
            decision: ApprovalDecision::Approve,
            reason: reason(),
        },
        "reject" | "r" => UserCommand::Decide {
            decision: ApprovalDecision::Reject,
            reason: reason(),
        },
        "cancel" => UserCommand::Cancel,
        "say" | "continue" => {
            if rest.is_empty() {
                return Err(format!("{verb} needs a message"));
            }
            UserCommand::Continue {
                message: rest.to_string(),
            }
        }
        "delete" => UserCommand::Delete,
        "citations" => UserCommand::RequestCitations,
        "files" => UserCommand::RequestFiles,
        "open" => {
            if rest.is_empty() {
                return Err("open needs a file id".to_string());
            }
            UserCommand::OpenFile {
                file_id: rest.to_string(),
            }
        }
        "edit" => match rest {
            "on" => UserCommand::SetEditing(true),
            "off" => UserCommand::SetEditing(false),
            _ => return Err("edit takes on or off".to_string()),
        },
        "help" | "?" => return Ok(OperatorLine::Help),
        "quit" | "exit" | "q" => return Ok(OperatorLine::Quit),
        other => return Err(format!("unknown command: {other}")),
    };
    Ok(OperatorLine::Command(command))
}
