use anyhow::Result;
use chrono::Utc;
use clap::{Parser, ValueEnum};
use cot_runner::{EvalHarness, ExtensionOptions, InspectHarness, RunConfiguration};
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::EnvFilter;

const EXAMPLES: &str = "\
Examples:
  # PR submission
  cot-eval --mode pr

  # Full replication
  cot-eval --mode full

  # Extensions
  cot-eval --mode extensions --prompt-style few-shot --dataset custom
";

#[derive(Parser, Debug)]
#[command(
    name = "cot-eval",
    version,
    about = "Run CoT unfaithfulness replication experiments",
    after_help = EXAMPLES
)]
struct Cli {
    /// Experiment mode to run
    #[arg(long, value_enum, default_value_t = ModeArg::Full)]
    mode: ModeArg,

    /// Prompting style for extensions (e.g., few-shot, cot, custom)
    #[arg(long, default_value = cot_runner::DEFAULT_PROMPT_STYLE)]
    prompt_style: String,

    /// Dataset to use for extensions
    #[arg(long, default_value = cot_runner::DEFAULT_DATASET)]
    dataset: String,

    /// Directory the per-mode log directories are created under
    #[arg(long, default_value = cot_runner::DEFAULT_LOG_ROOT)]
    log_root: PathBuf,

    /// Harness command line, e.g. "uv run inspect"
    #[arg(
        long,
        env = "COT_EVAL_HARNESS",
        default_value = cot_runner::DEFAULT_HARNESS_PROGRAM
    )]
    harness: String,

    /// Print the run configuration without launching the harness
    #[arg(long)]
    dry_run: bool,

    /// Emit a single JSON payload instead of report lines
    #[arg(long)]
    json: bool,

    /// Log harness activity to stderr
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum ModeArg {
    #[value(name = "pr")]
    Pr,
    #[value(name = "full")]
    Full,
    #[value(name = "extensions")]
    Extensions,
}

impl From<ModeArg> for cot_runner::Mode {
    fn from(value: ModeArg) -> Self {
        match value {
            ModeArg::Pr => cot_runner::Mode::Pr,
            ModeArg::Full => cot_runner::Mode::Full,
            ModeArg::Extensions => cot_runner::Mode::Extensions,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let json_mode = cli.json;
    let code = match InspectHarness::from_command_line(&cli.harness)
        .map_err(anyhow::Error::from)
        .and_then(|harness| run_command(&cli, &harness))
    {
        Ok(code) => code,
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", err.to_string(), json!({})));
                std::process::exit(1);
            }
            return Err(err);
        }
    };
    std::process::exit(code);
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "info" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn build_config(cli: &Cli) -> Result<RunConfiguration> {
    let extensions = ExtensionOptions {
        prompt_style: cli.prompt_style.clone(),
        dataset: cli.dataset.clone(),
    };
    RunConfiguration::for_mode(cli.mode.into(), &cli.log_root, &extensions)
}

/// Builds the configuration, runs it, reports, and returns the exit code.
fn run_command(cli: &Cli, harness: &dyn EvalHarness) -> Result<i32> {
    let config = build_config(cli)?;
    debug!(?config, "built run configuration");

    if cli.dry_run {
        if cli.json {
            emit_json(&json!({
                "ok": true,
                "command": "dry-run",
                "config": config.to_json(),
            }));
        } else {
            print_config(&config);
        }
        return Ok(0);
    }

    if !cli.json {
        println!("{}", cot_runner::start_message(&config));
    }
    let started_at = Utc::now();
    let result = cot_runner::execute(harness, &config);
    let finished_at = Utc::now();

    if cli.json {
        emit_json(&json!({
            "ok": result.succeeded,
            "command": "run",
            "config": config.to_json(),
            "run": result.to_json(),
            "started_at": started_at.to_rfc3339(),
            "finished_at": finished_at.to_rfc3339(),
        }));
    } else {
        for line in cot_runner::outcome_lines(&config, &result) {
            println!("{}", line);
        }
    }
    Ok(cot_runner::exit_code(&result))
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn print_config(config: &RunConfiguration) {
    println!("mode: {}", config.mode());
    println!("task_set: {}", config.task_set());
    println!("models: {}", config.model_identifiers().join(", "));
    println!("log_dir: {}", config.log_directory().display());
    for (key, value) in config.extra_parameters() {
        println!("{}: {}", key, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use cot_runner::{LogHandle, Mode, RunResult, TaskHandle};
    use std::cell::Cell;

    struct StubHarness {
        succeed: bool,
        fail: bool,
        runs: Cell<usize>,
    }

    impl StubHarness {
        fn new(succeed: bool) -> Self {
            Self {
                succeed,
                fail: false,
                runs: Cell::new(0),
            }
        }
    }

    impl EvalHarness for StubHarness {
        fn discover_tasks(&self, _task_group: &str) -> Result<Vec<TaskHandle>> {
            Ok(vec![TaskHandle::new("cot_bbh", None)])
        }

        fn run_evaluation(
            &self,
            _tasks: &[TaskHandle],
            config: &RunConfiguration,
        ) -> Result<RunResult> {
            self.runs.set(self.runs.get() + 1);
            if self.fail {
                return Err(anyhow!("harness crashed"));
            }
            Ok(RunResult {
                succeeded: self.succeed,
                logs: vec![LogHandle::new(config.log_directory().join("x.eval"))],
            })
        }
    }

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("cot-eval").chain(args.iter().copied()))
            .expect("args should parse")
    }

    #[test]
    fn defaults_select_full_mode() {
        let cli = parse(&[]);
        assert_eq!(cli.mode, ModeArg::Full);
        assert_eq!(cli.prompt_style, "standard");
        assert_eq!(cli.dataset, "bbh");
        assert_eq!(cli.log_root, PathBuf::from("logs"));
        if std::env::var_os("COT_EVAL_HARNESS").is_none() {
            assert_eq!(cli.harness, cot_runner::DEFAULT_HARNESS_PROGRAM);
        }
        let config = build_config(&cli).expect("config");
        assert_eq!(config.mode(), Mode::Full);
    }

    #[test]
    fn bogus_mode_is_rejected_by_parser() {
        let err = Cli::try_parse_from(["cot-eval", "--mode", "bogus"])
            .expect_err("bogus mode must be rejected");
        assert_eq!(err.kind(), clap::error::ErrorKind::InvalidValue);
        assert_ne!(err.exit_code(), 0);
    }

    #[test]
    fn extension_flags_reach_configuration() {
        let cli = parse(&[
            "--mode",
            "extensions",
            "--prompt-style",
            "few-shot",
            "--dataset",
            "custom",
        ]);
        let config = build_config(&cli).expect("config");
        let dir = config.log_directory().display().to_string();
        assert!(dir.contains("few-shot") && dir.contains("custom"), "{}", dir);
        assert_eq!(config.extra_parameters().len(), 2);
        assert_eq!(config.extra_parameters()["prompt_style"], "few-shot");
        assert_eq!(config.extra_parameters()["dataset"], "custom");
    }

    #[test]
    fn extension_flags_are_ignored_outside_extensions_mode() {
        let cli = parse(&["--mode", "pr", "--prompt-style", "few-shot"]);
        let config = build_config(&cli).expect("config");
        assert!(!config.extra_parameters().contains_key("prompt_style"));
        assert_eq!(config.extra_parameters()["limit"], 50);
        assert_eq!(config.model_identifiers().len(), 1);
    }

    #[test]
    fn exit_code_tracks_harness_outcome_for_all_modes() {
        for mode in ["pr", "full", "extensions"] {
            for succeed in [true, false] {
                let cli = parse(&["--mode", mode, "--json"]);
                let harness = StubHarness::new(succeed);
                let code = run_command(&cli, &harness).expect("run");
                assert_eq!(code, if succeed { 0 } else { 1 }, "mode {}", mode);
                assert_eq!(harness.runs.get(), 1);
            }
        }
    }

    #[test]
    fn harness_error_exits_with_failure() {
        let cli = parse(&["--mode", "full", "--json"]);
        let mut harness = StubHarness::new(true);
        harness.fail = true;
        assert_eq!(run_command(&cli, &harness).expect("run"), 1);
    }

    #[test]
    fn dry_run_never_touches_harness() {
        let cli = parse(&["--mode", "pr", "--dry-run", "--json"]);
        let harness = StubHarness::new(false);
        assert_eq!(run_command(&cli, &harness).expect("dry run"), 0);
        assert_eq!(harness.runs.get(), 0);
    }

    #[test]
    fn json_error_shape() {
        let v = json_error("command_failed", "boom".to_string(), json!({}));
        assert_eq!(v["ok"], false);
        assert_eq!(v["error"]["code"], "command_failed");
        assert_eq!(v["error"]["message"], "boom");
    }
}
