//! Operator console.
//!
//! Commands arrive one per line on stdin, are parsed into a [`Command`] and
//! dispatched to the [`Supervisor`]. Every command produces a plain-text
//! reply; unrecognized input only prints a usage hint.

use chrono::Utc;
use stagehand_core::types::{ProjectCode, SlotId, Stage, WorkerKind};
use stagehand_core::StagehandError;
use stagehand_queue::{QueueSummary, Task};
use stagehand_worker::{SlotSnapshot, Supervisor};
use std::fmt::Write as _;
use std::time::Duration;
use tracing::{info, warn};

pub const USAGE: &str = "\
Commands:
  status                     show workers and queue
  restart                    restart every worker
  restart <kind> [n]         restart one worker (parallel|chrome <n>, sequential|excel)
  kill                       kill the shared browser processes
  scale <n>                  set the number of parallel workers
  add <code>                 queue a project for the document stage
  queue                      list queued tasks
  help                       show this help
  quit | exit | q            stop every worker and exit";

/// A parsed console line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Status,
    RestartAll,
    Restart(SlotId),
    Kill,
    Scale(u32),
    Add(ProjectCode),
    Queue,
    Help,
    Quit,
    /// Blank line
    Empty,
    /// Unrecognized or malformed input, with the reason
    Invalid(String),
}

impl Command {
    /// Parse one line. Keywords are case-insensitive.
    pub fn parse(line: &str) -> Self {
        let mut words = line.split_whitespace();
        let Some(keyword) = words.next() else {
            return Self::Empty;
        };
        let args: Vec<&str> = words.collect();

        match (keyword.to_ascii_lowercase().as_str(), args.as_slice()) {
            ("status", []) => Self::Status,
            ("restart", []) => Self::RestartAll,
            ("restart", [kind, rest @ ..]) => parse_restart(kind, rest),
            ("kill", []) => Self::Kill,
            ("scale", [n]) => match n.parse() {
                Ok(n) => Self::Scale(n),
                Err(_) => Self::Invalid(format!("'{n}' is not a worker count")),
            },
            ("add", [code]) => Self::Add(code.to_ascii_uppercase()),
            ("queue", []) => Self::Queue,
            ("help" | "?", _) => Self::Help,
            ("quit" | "exit" | "q", []) => Self::Quit,
            ("scale", _) => Self::Invalid("usage: scale <n>".to_string()),
            ("add", _) => Self::Invalid("usage: add <code>".to_string()),
            ("status" | "kill" | "queue" | "quit" | "exit" | "q", _) => {
                Self::Invalid(format!("'{keyword}' takes no arguments"))
            }
            (other, _) => Self::Invalid(format!("unknown command '{other}'")),
        }
    }
}

fn parse_restart(kind: &str, rest: &[&str]) -> Command {
    let kind: WorkerKind = match kind.parse() {
        Ok(kind) => kind,
        Err(e) => return Command::Invalid(e),
    };
    match (kind, rest) {
        (WorkerKind::Sequential, []) => Command::Restart(kind.slot_id(None)),
        (WorkerKind::Parallel, [n]) => match n.parse::<u32>() {
            Ok(n) if n > 0 => Command::Restart(kind.slot_id(Some(n))),
            _ => Command::Invalid(format!("'{n}' is not a worker number")),
        },
        (WorkerKind::Parallel, []) => {
            Command::Invalid("restart parallel needs a worker number".to_string())
        }
        (WorkerKind::Sequential, _) => {
            Command::Invalid("restart sequential takes no worker number".to_string())
        }
        (WorkerKind::Parallel, _) => Command::Invalid("too many arguments".to_string()),
    }
}

/// Result of dispatching one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub text: String,
    /// The console should stop reading
    pub quit: bool,
}

impl Reply {
    fn message(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            quit: false,
        }
    }
}

/// Execute `command` against the supervisor.
pub async fn dispatch(supervisor: &Supervisor, command: Command) -> Reply {
    match command {
        Command::Empty => Reply::message(""),
        Command::Help => Reply::message(USAGE),
        Command::Invalid(reason) => {
            Reply::message(format!("{reason}\nType 'help' for the list of commands."))
        }
        Command::Status => {
            let slots = supervisor.status().await;
            let summary = supervisor.queue_summary().await;
            Reply::message(render_status(&slots, &summary))
        }
        Command::Queue => Reply::message(render_queue(&supervisor.tasks().await)),
        Command::RestartAll => {
            info!("operator requested restart of all workers");
            result_reply(supervisor.restart_all().await, "All workers restarted")
        }
        Command::Restart(slot_id) => {
            info!(slot = %slot_id, "operator requested restart");
            result_reply(
                supervisor.restart_slot(&slot_id).await,
                format!("{slot_id} restarted"),
            )
        }
        Command::Kill => {
            supervisor.kill_all().await;
            Reply::message("Browser processes killed")
        }
        Command::Scale(n) => result_reply(
            supervisor.scale_to(n).await,
            format!("Scaled to {n} parallel workers"),
        ),
        Command::Add(code) => {
            if supervisor.enqueue(code.clone(), Stage::Document).await {
                Reply::message(format!("Queued {code} [{}]", Stage::Document))
            } else {
                Reply::message(format!("{code} is already queued or past {}", Stage::Document))
            }
        }
        Command::Quit => {
            supervisor.shutdown().await;
            Reply {
                text: "Stopped".to_string(),
                quit: true,
            }
        }
    }
}

fn result_reply(result: stagehand_core::Result<()>, ok: impl Into<String>) -> Reply {
    match result {
        Ok(()) => Reply::message(ok),
        Err(e) => {
            warn!(error = %e, "console command failed");
            Reply::message(describe_error(&e))
        }
    }
}

/// Error text with the operator hint, if there is one.
pub fn describe_error(e: &StagehandError) -> String {
    match e.guidance() {
        Some(hint) => format!("Error: {e}\n  hint: {hint}"),
        None => format!("Error: {e}"),
    }
}

pub fn render_status(slots: &[SlotSnapshot], summary: &QueueSummary) -> String {
    let now = Utc::now();
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<14} {:<14} {:>8} {:>7} {:>9} {:>6}  {}",
        "WORKER", "STATUS", "PID", "ERRORS", "RESTARTS", "DONE", "UPTIME"
    );
    for slot in slots {
        let pid = slot.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".into());
        let uptime = slot
            .uptime(now)
            .map(format_uptime)
            .unwrap_or_else(|| "-".into());
        let _ = writeln!(
            out,
            "{:<14} {} {:<12} {:>8} {:>7} {:>9} {:>6}  {}",
            slot.id,
            slot.status.indicator(),
            slot.status.to_string(),
            pid,
            slot.consecutive_errors,
            slot.restart_count,
            slot.completed_tasks,
            uptime
        );
    }
    let _ = write!(
        out,
        "Queue: {} pending, {} running, {} failed, {} completed",
        summary.pending, summary.running, summary.failed, summary.completed
    );
    out
}

pub fn render_queue(tasks: &[Task]) -> String {
    if tasks.is_empty() {
        return "Queue is empty".to_string();
    }
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:>4}  {:<12} {:<13} {:<10} {:<12} {:>7}",
        "ID", "PROJECT", "STAGE", "STATUS", "WORKER", "RETRIES"
    );
    for task in tasks {
        let _ = writeln!(
            out,
            "{:>4}  {:<12} {:<13} {:<10} {:<12} {:>7}",
            task.id,
            task.project_code,
            task.stage.to_string(),
            task.status.to_string(),
            task.assigned_slot.as_deref().unwrap_or("-"),
            task.retry_count
        );
    }
    out.truncate(out.trim_end().len());
    out
}

/// Uptime rounded down to whole seconds.
fn format_uptime(uptime: Duration) -> String {
    humantime::format_duration(Duration::from_secs(uptime.as_secs())).to_string()
}
