//! Launch specifications for worker slots.
//!
//! A [`LaunchSpec`] is everything needed to spawn one worker process: the
//! launch target on disk, the full command line, working directory,
//! environment and execution mode. It is rebuilt from configuration on every
//! start, so a scale change is reflected in the environment of the next
//! relaunch.
//!
//! Environment passed to workers:
//! - `STAGEHAND_SLOT_ID`: slot identity, e.g. `parallel-2`
//! - `STAGEHAND_WORKER_KIND`: `sequential` or `parallel`
//! - `STAGEHAND_WORKER_INDEX` / `STAGEHAND_TOTAL_WORKERS`: shard of a parallel worker
//! - `PARALLEL_CHROME`: the same shard as `k/N`, read by existing render workers
//! - `STAGEHAND_LOOP=1`: set for the sequential worker
//! - every `launch.env` pair from configuration

use stagehand_core::config::{ExecutionMode, StagehandConfig};
use stagehand_core::types::{SlotId, WorkerKind};
use std::path::PathBuf;

/// Placeholder replaced by the slot ordinal in `launch.parallel_script`.
pub const ORDINAL_PLACEHOLDER: &str = "{ordinal}";

/// How to launch one worker process.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    /// Slot this spec launches
    pub slot_id: SlotId,
    /// Script or executable that must exist before spawning
    pub target: PathBuf,
    /// Interpreter to run `target` with; `None` runs it directly
    pub interpreter: Option<String>,
    /// Arguments after the target
    pub args: Vec<String>,
    /// Working directory
    pub cwd: PathBuf,
    /// Environment variables
    pub env: Vec<(String, String)>,
    /// Attached or detached
    pub mode: ExecutionMode,
    /// Terminal launcher prepended in detached mode
    pub terminal_prefix: Vec<String>,
}

impl LaunchSpec {
    /// Build the spec for a slot.
    ///
    /// `ordinal` is required for parallel slots; `total` is the current
    /// number of parallel slots.
    pub fn for_slot(
        config: &StagehandConfig,
        kind: WorkerKind,
        ordinal: Option<u32>,
        total: u32,
    ) -> Self {
        let slot_id = kind.slot_id(ordinal);
        let launch = &config.launch;

        let mut env = vec![
            ("STAGEHAND_SLOT_ID".to_string(), slot_id.clone()),
            ("STAGEHAND_WORKER_KIND".to_string(), kind.to_string()),
        ];

        let (script, args) = match kind {
            WorkerKind::Sequential => {
                env.push(("STAGEHAND_LOOP".to_string(), "1".to_string()));
                (launch.sequential_script.clone(), launch.sequential_args.clone())
            }
            WorkerKind::Parallel => {
                let k = ordinal.unwrap_or(1);
                env.push(("STAGEHAND_WORKER_INDEX".to_string(), k.to_string()));
                env.push(("STAGEHAND_TOTAL_WORKERS".to_string(), total.to_string()));
                env.push(("PARALLEL_CHROME".to_string(), format!("{k}/{total}")));
                (
                    launch.parallel_script.replace(ORDINAL_PLACEHOLDER, &k.to_string()),
                    launch.parallel_args.clone(),
                )
            }
        };

        env.extend(launch.env.iter().map(|(k, v)| (k.clone(), v.clone())));

        let interpreter = match config.interpreter.trim() {
            "" => None,
            other => Some(other.to_string()),
        };

        Self {
            slot_id,
            target: config.tool_dir.join(script),
            interpreter,
            args,
            cwd: config.tool_dir.clone(),
            env,
            mode: config.execution_mode,
            terminal_prefix: config.terminal_prefix.clone(),
        }
    }

    /// Full command line, program first.
    pub fn command_line(&self) -> Vec<String> {
        let mut line = Vec::new();
        if self.mode == ExecutionMode::Detached {
            line.extend(self.terminal_prefix.iter().cloned());
        }
        if let Some(interpreter) = &self.interpreter {
            line.push(interpreter.clone());
        }
        line.push(self.target.display().to_string());
        line.extend(self.args.iter().cloned());
        line
    }

    /// Value of an environment variable in this spec.
    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}
