use anyhow::{anyhow, Result};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

mod harness;

pub use harness::{
    EvalHarness, HarnessError, InspectHarness, LogHandle, TaskHandle, DEFAULT_HARNESS_PROGRAM,
};

pub const TASK_SET: &str = "inspect_evals.cot_unfaithfulness";
pub const GPT_35_TURBO: &str = "openai/gpt-3.5-turbo";
pub const CLAUDE_35_SONNET: &str = "anthropic/claude-3-5-sonnet-20241022";
pub const PR_SAMPLE_LIMIT: u64 = 50;
pub const FULL_MAX_TASKS: usize = 4;
pub const DEFAULT_PROMPT_STYLE: &str = "standard";
pub const DEFAULT_DATASET: &str = "bbh";
pub const DEFAULT_LOG_ROOT: &str = "logs";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Pr,
    Full,
    Extensions,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Pr => "pr",
            Mode::Full => "full",
            Mode::Extensions => "extensions",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Flags consulted only by [`Mode::Extensions`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtensionOptions {
    pub prompt_style: String,
    pub dataset: String,
}

impl Default for ExtensionOptions {
    fn default() -> Self {
        Self {
            prompt_style: DEFAULT_PROMPT_STYLE.to_string(),
            dataset: DEFAULT_DATASET.to_string(),
        }
    }
}

/// Everything the harness needs for one evaluation run.
///
/// Built once per invocation by [`RunConfiguration::for_mode`] and only read
/// afterwards. `model_identifiers` is never empty.
#[derive(Clone, Debug)]
pub struct RunConfiguration {
    mode: Mode,
    task_set: String,
    model_identifiers: Vec<String>,
    log_directory: PathBuf,
    task_args: BTreeMap<String, Value>,
    max_tasks: Option<usize>,
}

impl RunConfiguration {
    fn new(
        mode: Mode,
        model_identifiers: Vec<String>,
        log_directory: PathBuf,
        task_args: BTreeMap<String, Value>,
        max_tasks: Option<usize>,
    ) -> Result<Self> {
        if model_identifiers.is_empty() {
            return Err(anyhow!("mode '{}' resolved to an empty model list", mode));
        }
        Ok(Self {
            mode,
            task_set: TASK_SET.to_string(),
            model_identifiers,
            log_directory,
            task_args,
            max_tasks,
        })
    }

    pub fn for_mode(mode: Mode, log_root: &Path, extensions: &ExtensionOptions) -> Result<Self> {
        match mode {
            Mode::Pr => Self::pr(log_root),
            Mode::Full => Self::full(log_root),
            Mode::Extensions => Self::extensions(log_root, extensions),
        }
    }

    /// Capped run used when submitting the task set upstream.
    pub fn pr(log_root: &Path) -> Result<Self> {
        let mut task_args = BTreeMap::new();
        task_args.insert("limit".to_string(), json!(PR_SAMPLE_LIMIT));
        Self::new(
            Mode::Pr,
            vec![GPT_35_TURBO.to_string()],
            log_root.join("pr_submission"),
            task_args,
            None,
        )
    }

    /// Full replication across the paper-era model and its current counterpart.
    pub fn full(log_root: &Path) -> Result<Self> {
        Self::new(
            Mode::Full,
            vec![GPT_35_TURBO.to_string(), CLAUDE_35_SONNET.to_string()],
            log_root.join("full_experiments"),
            BTreeMap::new(),
            Some(FULL_MAX_TASKS),
        )
    }

    pub fn extensions(log_root: &Path, options: &ExtensionOptions) -> Result<Self> {
        let mut task_args = BTreeMap::new();
        task_args.insert("prompt_style".to_string(), json!(options.prompt_style));
        task_args.insert("dataset".to_string(), json!(options.dataset));
        Self::new(
            Mode::Extensions,
            vec![CLAUDE_35_SONNET.to_string()],
            log_root.join(format!(
                "extensions_{}_{}",
                options.prompt_style, options.dataset
            )),
            task_args,
            None,
        )
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn task_set(&self) -> &str {
        &self.task_set
    }

    pub fn model_identifiers(&self) -> &[String] {
        &self.model_identifiers
    }

    pub fn log_directory(&self) -> &Path {
        &self.log_directory
    }

    pub fn task_args(&self) -> &BTreeMap<String, Value> {
        &self.task_args
    }

    pub fn max_tasks(&self) -> Option<usize> {
        self.max_tasks
    }

    /// Task args plus the harness-level parallelism bound, as one mapping.
    pub fn extra_parameters(&self) -> BTreeMap<String, Value> {
        let mut out = self.task_args.clone();
        if let Some(max_tasks) = self.max_tasks {
            out.insert("max_tasks".to_string(), json!(max_tasks));
        }
        out
    }

    pub fn to_json(&self) -> Value {
        json!({
            "mode": self.mode.as_str(),
            "task_set": self.task_set,
            "models": self.model_identifiers,
            "log_dir": self.log_directory.display().to_string(),
            "extra_parameters": self.extra_parameters(),
        })
    }
}

#[derive(Clone, Debug, Default)]
pub struct RunResult {
    pub succeeded: bool,
    pub logs: Vec<LogHandle>,
}

impl RunResult {
    pub fn failed() -> Self {
        Self::default()
    }

    pub fn to_json(&self) -> Value {
        json!({
            "succeeded": self.succeeded,
            "logs": self
                .logs
                .iter()
                .map(|l| l.path().display().to_string())
                .collect::<Vec<_>>(),
        })
    }
}

/// Discovers the task set and hands the run to the harness.
///
/// Harness errors are not propagated: they are logged and reported as an
/// unsuccessful run so the caller only ever sees the aggregate outcome.
pub fn execute(harness: &dyn EvalHarness, config: &RunConfiguration) -> RunResult {
    match try_execute(harness, config) {
        Ok(result) => result,
        Err(err) => {
            warn!(mode = %config.mode(), error = %err, "evaluation run failed");
            RunResult::failed()
        }
    }
}

fn try_execute(harness: &dyn EvalHarness, config: &RunConfiguration) -> Result<RunResult> {
    let tasks = harness.discover_tasks(config.task_set())?;
    info!(
        mode = %config.mode(),
        task_set = config.task_set(),
        tasks = tasks.len(),
        models = ?config.model_identifiers(),
        log_dir = %config.log_directory().display(),
        "launching evaluation set"
    );
    let result = harness.run_evaluation(&tasks, config)?;
    info!(
        succeeded = result.succeeded,
        logs = result.logs.len(),
        "evaluation set finished"
    );
    Ok(result)
}

pub fn exit_code(result: &RunResult) -> i32 {
    if result.succeeded {
        0
    } else {
        1
    }
}

pub fn start_message(config: &RunConfiguration) -> String {
    match config.mode() {
        Mode::Pr => format!(
            "Running PR submission evaluations ({} samples)...",
            PR_SAMPLE_LIMIT
        ),
        Mode::Full => "Running full replication experiments...".to_string(),
        Mode::Extensions => format!(
            "Running extensions with prompt_style={}, dataset={}...",
            task_arg_text(config, "prompt_style"),
            task_arg_text(config, "dataset")
        ),
    }
}

/// Human-readable report for a finished run, one entry per line.
pub fn outcome_lines(config: &RunConfiguration, result: &RunResult) -> Vec<String> {
    match (config.mode(), result.succeeded) {
        (Mode::Pr, true) => vec!["✓ PR submission evaluations completed successfully".to_string()],
        (Mode::Pr, false) => {
            vec!["✗ Some evaluations failed - check logs for details".to_string()]
        }
        (Mode::Full, true) => vec![
            "✓ Full replication completed successfully".to_string(),
            format!("  Completed {} evaluations", result.logs.len()),
        ],
        (Mode::Full, false) => vec![
            "✗ Some evaluations failed".to_string(),
            "  Re-run this command to retry failed tasks".to_string(),
        ],
        (Mode::Extensions, true) => vec!["✓ Extension experiments completed".to_string()],
        (Mode::Extensions, false) => vec!["✗ Some extension experiments failed".to_string()],
    }
}

fn task_arg_text(config: &RunConfiguration, key: &str) -> String {
    match config.task_args().get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}
