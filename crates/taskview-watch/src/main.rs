mod operator;
mod render;
mod settings;

use anyhow::Result;
use clap::Parser;
use operator::{parse_operator_line, OperatorLine, HELP};
use render::LineRenderer;
use settings::{load_file_config, resolve, Overrides};
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use taskview_sync::{spawn_view, HttpTaskApi, HttpTaskApiConfig, ViewUpdate};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "taskview-watch", about = "Follow one agent task live")]
struct Args {
    /// Server root, e.g. http://127.0.0.1:8000
    #[arg(long, env = "TASKVIEW_BASE_URL")]
    base_url: Option<String>,
    #[arg(long, env = "TASKVIEW_TASK_ID")]
    task_id: String,
    #[arg(long, env = "TASKVIEW_ADMIN_TOKEN", hide_env_values = true)]
    token: Option<String>,
    #[arg(long, env = "TASKVIEW_CONFIG_PATH")]
    config: Option<PathBuf>,
    #[arg(long, env = "TASKVIEW_PUSH_ENABLED")]
    push_enabled: Option<bool>,
    #[arg(long, default_value_t = false)]
    no_push: bool,
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.log_file.as_deref())?;

    let file = load_file_config(args.config.as_deref())?;
    let push_enabled = if args.no_push {
        Some(false)
    } else {
        args.push_enabled
    };
    let settings = resolve(
        file,
        Overrides {
            base_url: args.base_url,
            admin_token: args.token,
            push_enabled,
        },
    )?;

    let mut api_config = HttpTaskApiConfig::new(settings.base_url.clone());
    api_config.admin_token = settings.admin_token.clone();
    let api = Arc::new(HttpTaskApi::new(api_config)?);
    info!(
        "watch_start: base_url={} task_id={} push={}",
        api.base_url(),
        args.task_id,
        settings.sync.push_enabled
    );

    let mut handle = spawn_view(api, args.task_id.clone(), settings.sync);
    let mut renderer = LineRenderer::default();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut stdout = io::stdout();
    writeln!(stdout, "watching task {} ({HELP})", args.task_id)?;

    loop {
        tokio::select! {
            update = handle.updates.recv() => match update {
                Some(ViewUpdate::Changed { changes, snapshot }) => {
                    for line in renderer.render(&changes, &snapshot) {
                        writeln!(stdout, "{line}")?;
                    }
                }
                Some(ViewUpdate::Rejected { reason }) => writeln!(stdout, "refused: {reason}")?,
                Some(ViewUpdate::Closed) => {
                    writeln!(stdout, "task deleted")?;
                    break;
                }
                None => break,
            },
            line = stdin.next_line(), if stdin_open => match line {
                Ok(Some(line)) => match parse_operator_line(&line) {
                    Ok(OperatorLine::Command(command)) => {
                        if handle.commands.send(command).await.is_err() {
                            break;
                        }
                    }
                    Ok(OperatorLine::Help) => writeln!(stdout, "{HELP}")?,
                    Ok(OperatorLine::Quit) => break,
                    Ok(OperatorLine::Empty) => {}
                    Err(err) => writeln!(stdout, "{err}")?,
                },
                Ok(None) => stdin_open = false,
                Err(err) => {
                    warn!("stdin_read_error: {err}");
                    stdin_open = false;
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        }
        stdout.flush()?;
    }

    drop(handle.commands);
    let _ = handle.join.await;
    Ok(())
}

fn init_logging(log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if let Some(path) = log_file {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let file = Arc::new(Mutex::new(file));
        let writer = BoxMakeWriter::new(move || LogFileWriter { file: file.clone() });
        let _ = builder.with_ansi(false).with_writer(writer).try_init();
    } else if env_true("TASKVIEW_LOG_STDOUT") {
        let _ = builder.try_init();
    } else {
        let _ = builder.with_writer(io::sink).try_init();
    }
    Ok(())
}

struct LogFileWriter {
    file: Arc<Mutex<std::fs::File>>,
}

impl Write for LogFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Ok(mut file) = self.file.lock() {
            let _ = file.write_all(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Ok(mut file) = self.file.lock() {
            let _ = file.flush();
        }
        Ok(())
    }
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}
