use crate::{RunConfiguration, RunResult};
use anyhow::Result;
use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;

pub const DEFAULT_HARNESS_PROGRAM: &str = "inspect";

/// Index files the harness keeps next to per-run logs.
const LOG_INDEX_FILES: [&str; 2] = ["logs.json", "eval-set.json"];

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("harness command is empty")]
    EmptyCommand,
    #[error("failed to launch harness '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("task discovery for '{group}' failed: {message}")]
    Discovery { group: String, message: String },
    #[error("no tasks found for '{0}'")]
    NoTasks(String),
}

/// The external evaluation harness, as seen from the launcher.
pub trait EvalHarness {
    fn discover_tasks(&self, task_group: &str) -> Result<Vec<TaskHandle>>;

    fn run_evaluation(&self, tasks: &[TaskHandle], config: &RunConfiguration)
        -> Result<RunResult>;
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct TaskHandle {
    name: String,
    #[serde(default)]
    file: Option<String>,
}

impl TaskHandle {
    pub fn new(name: impl Into<String>, file: Option<String>) -> Self {
        Self {
            name: name.into(),
            file,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Task reference in the form the harness command line accepts.
    pub fn spec(&self) -> String {
        match &self.file {
            Some(file) => format!("{}@{}", file, self.name),
            None => self.name.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogHandle {
    path: PathBuf,
}

impl LogHandle {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Drives the `inspect` command line: `list tasks` for discovery and
/// `eval-set` for the run itself.
#[derive(Clone, Debug)]
pub struct InspectHarness {
    command: Vec<String>,
}

impl InspectHarness {
    pub fn new(command: Vec<String>) -> Result<Self, HarnessError> {
        if command.is_empty() || command[0].trim().is_empty() {
            return Err(HarnessError::EmptyCommand);
        }
        Ok(Self { command })
    }

    /// Splits a whitespace-separated command line such as `uv run inspect`.
    pub fn from_command_line(raw: &str) -> Result<Self, HarnessError> {
        Self::new(raw.split_whitespace().map(str::to_string).collect())
    }

    pub fn program(&self) -> &str {
        &self.command[0]
    }

    fn base_command(&self) -> Command {
        let mut cmd = Command::new(&self.command[0]);
        cmd.args(&self.command[1..]);
        cmd
    }

    fn spawn_error(&self, source: std::io::Error) -> HarnessError {
        HarnessError::Spawn {
            program: self.program().to_string(),
            source,
        }
    }
}

impl EvalHarness for InspectHarness {
    fn discover_tasks(&self, task_group: &str) -> Result<Vec<TaskHandle>> {
        let mut cmd = self.base_command();
        cmd.args(["list", "tasks", task_group, "--json"]);
        cmd.stdin(Stdio::null());
        debug!(program = self.program(), task_group, "listing tasks");
        let output = cmd.output().map_err(|e| self.spawn_error(e))?;
        if !output.status.success() {
            let stderr_tail = String::from_utf8_lossy(&output.stderr)
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .unwrap_or("harness exited without listing tasks")
                .to_string();
            return Err(HarnessError::Discovery {
                group: task_group.to_string(),
                message: stderr_tail,
            }
            .into());
        }
        let tasks = parse_task_listing(task_group, &String::from_utf8_lossy(&output.stdout))?;
        Ok(tasks)
    }

    fn run_evaluation(
        &self,
        tasks: &[TaskHandle],
        config: &RunConfiguration,
    ) -> Result<RunResult> {
        let mut cmd = self.base_command();
        cmd.args(eval_set_args(tasks, config));
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());
        debug!(program = self.program(), "starting eval-set");
        let status = cmd.status().map_err(|e| self.spawn_error(e))?;
        debug!(status = ?status.code(), "eval-set exited");
        Ok(RunResult {
            succeeded: status.success(),
            logs: collect_logs(config.log_directory()),
        })
    }
}

fn parse_task_listing(task_group: &str, stdout: &str) -> Result<Vec<TaskHandle>, HarnessError> {
    let tasks: Vec<TaskHandle> =
        serde_json::from_str(stdout.trim()).map_err(|e| HarnessError::Discovery {
            group: task_group.to_string(),
            message: format!("unreadable task listing: {}", e),
        })?;
    if tasks.is_empty() {
        return Err(HarnessError::NoTasks(task_group.to_string()));
    }
    Ok(tasks)
}

fn eval_set_args(tasks: &[TaskHandle], config: &RunConfiguration) -> Vec<String> {
    let mut args = vec!["eval-set".to_string()];
    args.extend(tasks.iter().map(TaskHandle::spec));
    args.push("--model".to_string());
    args.push(config.model_identifiers().join(","));
    args.push("--log-dir".to_string());
    args.push(config.log_directory().display().to_string());
    if let Some(max_tasks) = config.max_tasks() {
        args.push("--max-tasks".to_string());
        args.push(max_tasks.to_string());
    }
    for (key, value) in config.task_args() {
        args.push("-T".to_string());
        args.push(render_task_arg(key, value));
    }
    args
}

/// `-T` values are read back as YAML, so strings stay JSON-quoted.
fn render_task_arg(key: &str, value: &Value) -> String {
    format!("{}={}", key, value)
}

fn collect_logs(log_dir: &Path) -> Vec<LogHandle> {
    if !log_dir.exists() {
        return Vec::new();
    }
    let mut logs: Vec<LogHandle> = WalkDir::new(log_dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            let name = e.file_name().to_string_lossy();
            !name.starts_with('.') && !LOG_INDEX_FILES.iter().any(|f| *f == name)
        })
        .filter(|e| {
            matches!(
                e.path().extension().and_then(|x| x.to_str()),
                Some("eval") | Some("json")
            )
        })
        .map(|e| LogHandle::new(e.into_path()))
        .collect();
    logs.sort_by(|a, b| a.path.cmp(&b.path));
    logs
}
