//! Run a task manifest through the configured strategy.
//!
//! Results are printed in completion order. Ctrl-C stops every task and
//! destroys every environment before the summary is printed.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use colored::Colorize;
use futures_util::stream::{FuturesUnordered, StreamExt};
use std::fmt::Write;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinError;
use tracing::{debug, info, warn};

use crate::config::{Config, Mode};
use crate::manifest::{self, Manifest, ResolvedTask};
use crate::report::{self, Summary, TaskOutcome, Verdict};
use crate::sandbox::{DockerProvider, EnvironmentProvider, HostProvider};
use crate::strategy::{
    ArtifactPath, PairSettings, PairedExclusive, SharedEnvironment, SharedSettings, Strategy,
    TaskReport,
};

/// Command line options for `run`.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub config: PathBuf,
    pub tasks: PathBuf,
    /// Overrides `execution.mode`
    pub mode: Option<Mode>,
    pub no_sandbox: bool,
    pub filter: Option<String>,
    pub report: Option<PathBuf>,
}

/// Travels with each task through the strategy.
#[derive(Debug)]
pub(crate) struct TaskContext {
    name: String,
    timeout: Option<Duration>,
    submitted: Instant,
}

/// Applies the name filter, then splits off tasks an override skipped.
///
/// Returns the runnable tasks and the names of the skipped ones.
pub fn select_tasks(
    tasks: Vec<ResolvedTask>,
    filter: Option<&str>,
) -> (Vec<ResolvedTask>, Vec<String>) {
    let (skipped, runnable): (Vec<_>, Vec<_>) = tasks
        .into_iter()
        .filter(|task| match filter {
            Some(pattern) => manifest::matches(pattern, &task.name),
            None => true,
        })
        .partition(|task| task.skip);
    (runnable, skipped.into_iter().map(|task| task.name).collect())
}

/// File name for a task's artifact. Characters that are unsafe in a path
/// component become `_`.
pub fn artifact_file_name(task: &str, extension: &str) -> String {
    let stem: String = task
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{stem}.{extension}")
}

pub fn format_banner(
    mode: Mode,
    provider: &str,
    runnable: usize,
    skipped: usize,
    concurrency: usize,
) -> String {
    let mut out = String::new();
    let _ = writeln!(&mut out, "\n{}", "━".repeat(50).dimmed());
    let _ = writeln!(&mut out, "{}", "   poolrun".yellow().bold());
    let _ = writeln!(&mut out, "{}", "━".repeat(50).dimmed());
    let _ = writeln!(&mut out, "  Mode:        {}", mode.to_string().cyan());
    let sandbox = if provider == "host" {
        "disabled".red()
    } else {
        provider.green()
    };
    let _ = writeln!(&mut out, "  Sandbox:     {sandbox}");
    let _ = writeln!(&mut out, "  Tasks:       {}", runnable.to_string().cyan());
    if skipped > 0 {
        let _ = writeln!(&mut out, "  Skipped:     {}", skipped.to_string().dimmed());
    }
    let _ = writeln!(&mut out, "  Concurrency: {}", concurrency.to_string().cyan());
    let _ = writeln!(&mut out, "{}", "━".repeat(50).dimmed());
    out
}

fn positive(value: usize, key: &str) -> Result<NonZeroUsize> {
    NonZeroUsize::new(value).with_context(|| format!("{key} must be at least 1"))
}

fn concurrency(config: &Config, mode: Mode) -> usize {
    match mode {
        Mode::Shared => config.execution.max_workers,
        Mode::Paired => config.execution.max_pairs,
    }
}

async fn connect_provider(no_sandbox: bool) -> Result<Arc<dyn EnvironmentProvider>> {
    if no_sandbox {
        warn!("Sandbox disabled, tasks run directly on the host");
        return Ok(Arc::new(HostProvider::new()?));
    }
    let docker = DockerProvider::connect()?;
    docker.ping().await?;
    Ok(Arc::new(docker))
}

fn build_strategy(
    config: &Config,
    mode: Mode,
    provider: Arc<dyn EnvironmentProvider>,
) -> Result<Box<dyn Strategy<TaskContext>>> {
    let binary_dir = config.binary_dir()?.to_path_buf();
    let execution = &config.execution;

    match mode {
        Mode::Shared => {
            let settings = SharedSettings {
                binary_dir,
                max_workers: positive(execution.max_workers, "execution.max_workers")?,
                task_env: execution.task_env.clone(),
                artifact_extension: execution.artifact_extension.clone(),
            };
            let artifact_path = execution.artifact_dir.clone().map(|dir| {
                let extension = execution.artifact_extension.clone();
                Box::new(move |task: &TaskContext, _: &Path, _: &[String]| {
                    dir.join(artifact_file_name(&task.name, &extension))
                }) as ArtifactPath<TaskContext>
            });
            let strategy =
                SharedEnvironment::new(provider, config.runtime_spec()?, settings, artifact_path)?;
            Ok(Box::new(strategy))
        }
        Mode::Paired => {
            let settings = PairSettings {
                binary_dir,
                max_pairs: positive(execution.max_pairs, "execution.max_pairs")?,
                task_env: execution.task_env.clone(),
                simulator_command: config.simulator_command()?,
                readiness_probe: config.readiness_probe()?,
                readiness_timeout: Duration::from_secs(config.simulator.readiness_timeout_secs),
            };
            let strategy = PairedExclusive::new(
                provider,
                config.runtime_spec()?,
                config.simulator_spec(),
                settings,
            )?;
            Ok(Box::new(strategy))
        }
    }
}

/// Outcome for a task whose runner panicked or was cancelled.
fn lost_task(name: String, error: &JoinError) -> TaskOutcome {
    TaskOutcome {
        name,
        verdict: Verdict::Error,
        exit_code: None,
        output: None,
        detail: Some(format!("Task runner failed: {error}")),
        artifact: None,
        duration_secs: 0.0,
    }
}

pub async fn run(options: RunOptions) -> Result<()> {
    let mut config = Config::load(&options.config)?;
    let mode = options.mode.unwrap_or(config.execution.mode);

    // Executables and bind sources are addressed by absolute path
    let cwd = std::env::current_dir().context("Failed to get current directory")?;
    config.resolve_paths(&cwd)?;

    let manifest = Manifest::load(&options.tasks)?;
    let (runnable, skipped) = select_tasks(
        manifest.resolve(config.default_timeout()),
        options.filter.as_deref(),
    );
    if runnable.is_empty() && skipped.is_empty() {
        bail!("No tasks to run");
    }

    let provider = connect_provider(options.no_sandbox).await?;
    print!(
        "{}",
        format_banner(
            mode,
            provider.name(),
            runnable.len(),
            skipped.len(),
            concurrency(&config, mode)
        )
    );

    let strategy = build_strategy(&config, mode, provider)?;
    let started_at = Utc::now();
    let clock = Instant::now();

    tokio::select! {
        started = strategy.start() => started.context("Failed to start environments")?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted while starting");
            strategy.shutdown(true, true).await;
            bail!("Interrupted");
        }
    }
    info!(mode = %mode, tasks = runnable.len(), "Environments ready");

    let total = runnable.len() + skipped.len();
    let budget = config.execution.output_line_budget;
    let mut outcomes = Vec::with_capacity(total);

    for name in skipped {
        let outcome = TaskOutcome::skipped(name);
        print!(
            "{}",
            report::format_outcome(&outcome, outcomes.len() + 1, total, budget)
        );
        outcomes.push(outcome);
    }

    let mut pending = FuturesUnordered::new();
    for task in runnable {
        let context = TaskContext {
            name: task.name.clone(),
            timeout: task.timeout,
            submitted: Instant::now(),
        };
        debug!(task = %task.name, executable = %task.executable.display(), "Submitting");
        match strategy.submit(context, task.executable, task.args, task.timeout) {
            Ok(handle) => {
                let name = task.name;
                pending.push(async move { (name, handle.await) });
            }
            Err(e) => {
                let outcome = TaskOutcome::new(task.name, Err(e.into()), task.timeout, Duration::ZERO);
                print!(
                    "{}",
                    report::format_outcome(&outcome, outcomes.len() + 1, total, budget)
                );
                outcomes.push(outcome);
            }
        }
    }

    let mut interrupted = false;
    let mut listening = true;
    loop {
        tokio::select! {
            next = pending.next() => {
                let Some((name, joined)) = next else { break };
                let outcome = match joined {
                    Ok(TaskReport { context, result }) => TaskOutcome::new(
                        context.name,
                        result,
                        context.timeout,
                        context.submitted.elapsed(),
                    ),
                    Err(e) => lost_task(name, &e),
                };
                print!(
                    "{}",
                    report::format_outcome(&outcome, outcomes.len() + 1, total, budget)
                );
                outcomes.push(outcome);
            }
            signal = tokio::signal::ctrl_c(), if listening => {
                listening = false;
                match signal {
                    Ok(()) => {
                        interrupted = true;
                        println!("\n{} Interrupted, stopping all tasks", "🛑".red());
                        strategy.shutdown(true, true).await;
                    }
                    Err(e) => warn!(error = %e, "Cannot listen for Ctrl-C"),
                }
            }
        }
    }

    let summary = Summary::from_outcomes(&outcomes);
    print!("{}", report::format_summary(&summary, clock.elapsed()));

    let written = match &options.report {
        Some(path) => report::write_json(path, &mode.to_string(), started_at, &outcomes)
            .map(|()| info!(path = %path.display(), "Wrote report")),
        None => Ok(()),
    };

    if !interrupted {
        strategy.shutdown(true, false).await;
    }
    written?;

    if interrupted {
        bail!("Interrupted");
    }
    if !summary.all_passed() {
        let failing = total - summary.passed - summary.skipped;
        bail!("{failing} of {total} tasks did not pass");
    }
    Ok(())
}
