//! Task verdicts, terminal formatting and the JSON report.
//!
//! Formatting functions are pure and return strings. Output is truncated for
//! display only; the JSON report keeps it whole.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use colored::{ColoredString, Colorize};
use serde::Serialize;
use std::fmt::{self, Write};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::strategy::{Completion, TaskError};

/// Terminal classification of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    /// Exit status 0
    Pass,
    /// Exit status 1
    Fail,
    /// Any other exit status
    Crash,
    /// No exit status before the deadline
    Timeout,
    /// The task never produced a usable exit
    Error,
    /// Excluded by an override
    Skipped,
}

impl Verdict {
    pub fn from_exit_code(exit_code: i64) -> Self {
        match exit_code {
            0 => Self::Pass,
            1 => Self::Fail,
            _ => Self::Crash,
        }
    }

    /// Whether this verdict fails the run.
    pub fn is_failure(self) -> bool {
        !matches!(self, Self::Pass | Self::Skipped)
    }

    fn colored(self) -> ColoredString {
        let label = self.to_string();
        match self {
            Self::Pass => label.green(),
            Self::Fail => label.red(),
            Self::Crash => label.red().bold(),
            Self::Timeout => label.yellow(),
            Self::Error => label.magenta(),
            Self::Skipped => label.dimmed(),
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
            Self::Crash => "CRASH",
            Self::Timeout => "TIMEOUT",
            Self::Error => "ERROR",
            Self::Skipped => "SKIP",
        };
        f.write_str(label)
    }
}

/// Everything known about one finished task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskOutcome {
    pub name: String,
    pub verdict: Verdict,
    pub exit_code: Option<i64>,
    /// Full output; absent on timeout
    pub output: Option<String>,
    /// Why the task failed, when the output alone does not say
    pub detail: Option<String>,
    pub artifact: Option<PathBuf>,
    pub duration_secs: f64,
}

impl TaskOutcome {
    pub fn new(
        name: String,
        result: Result<Completion, TaskError>,
        timeout: Option<Duration>,
        duration: Duration,
    ) -> Self {
        let duration_secs = duration.as_secs_f64();
        match result {
            Ok(Completion::Exited {
                exit_code,
                output,
                artifact,
            }) => {
                let verdict = Verdict::from_exit_code(exit_code);
                let detail = (verdict == Verdict::Crash)
                    .then(|| format!("Task crashed with exit code {exit_code}"));
                Self {
                    name,
                    verdict,
                    exit_code: Some(exit_code),
                    output: Some(output),
                    detail,
                    artifact,
                    duration_secs,
                }
            }
            Ok(Completion::TimedOut) => Self {
                name,
                verdict: Verdict::Timeout,
                exit_code: None,
                output: None,
                detail: Some(match timeout {
                    Some(t) => format!("Task did not complete after {} seconds", t.as_secs()),
                    None => "Task did not complete".to_string(),
                }),
                artifact: None,
                duration_secs,
            },
            Err(e) => Self {
                name,
                verdict: Verdict::Error,
                exit_code: None,
                output: e.output().map(str::to_string),
                detail: Some(e.to_string()),
                artifact: None,
                duration_secs,
            },
        }
    }

    pub fn skipped(name: String) -> Self {
        Self {
            name,
            verdict: Verdict::Skipped,
            exit_code: None,
            output: None,
            detail: None,
            artifact: None,
            duration_secs: 0.0,
        }
    }
}

/// Keeps the last `budget` lines, replacing the first with a marker when
/// anything was cut. At least one output line always survives.
pub fn truncate_output(output: &str, budget: usize) -> Vec<&str> {
    let lines: Vec<&str> = output.lines().collect();
    if budget == 0 || lines.len() <= budget {
        return lines;
    }
    let tail = budget.max(2) - 1;
    let mut kept = vec!["(output truncated)"];
    kept.extend_from_slice(&lines[lines.len() - tail..]);
    kept
}

/// One line per finished task, followed by its indented output unless it passed.
pub fn format_outcome(outcome: &TaskOutcome, completed: usize, total: usize, budget: usize) -> String {
    let width = total.to_string().len();
    let progress = format!("[{completed:>width$}/{total}]");
    let verdict = match outcome.exit_code {
        Some(code) if outcome.verdict.is_failure() => format!("{} ({code})", outcome.verdict.colored()),
        _ => outcome.verdict.colored().to_string(),
    };

    let mut out = String::new();
    let _ = writeln!(
        &mut out,
        "{} {:<16} {}",
        progress.dimmed(),
        verdict,
        outcome.name
    );

    if !outcome.verdict.is_failure() {
        return out;
    }

    let indent = " ".repeat(progress.len() + 1);
    if let Some(detail) = &outcome.detail {
        let _ = writeln!(&mut out, "{indent}{}", detail.dimmed());
    }
    if let Some(output) = &outcome.output {
        for line in truncate_output(output, budget) {
            let _ = writeln!(&mut out, "{indent}{line}");
        }
    }
    out
}

/// Per-verdict counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub passed: usize,
    pub failed: usize,
    pub crashed: usize,
    pub timed_out: usize,
    pub errors: usize,
    pub skipped: usize,
}

impl Summary {
    pub fn from_outcomes(outcomes: &[TaskOutcome]) -> Self {
        let mut summary = Self::default();
        for outcome in outcomes {
            match outcome.verdict {
                Verdict::Pass => summary.passed += 1,
                Verdict::Fail => summary.failed += 1,
                Verdict::Crash => summary.crashed += 1,
                Verdict::Timeout => summary.timed_out += 1,
                Verdict::Error => summary.errors += 1,
                Verdict::Skipped => summary.skipped += 1,
            }
        }
        summary
    }

    pub fn all_passed(&self) -> bool {
        self.failed + self.crashed + self.timed_out + self.errors == 0
    }
}

pub fn format_summary(summary: &Summary, elapsed: Duration) -> String {
    let mut out = String::new();
    let _ = writeln!(&mut out, "\n{}", "━".repeat(50).dimmed());
    let _ = writeln!(
        &mut out,
        "  {} passed, {} failed, {} crashed, {} timed out, {} errors, {} skipped",
        summary.passed.to_string().green(),
        summary.failed.to_string().red(),
        summary.crashed.to_string().red(),
        summary.timed_out.to_string().yellow(),
        summary.errors.to_string().magenta(),
        summary.skipped.to_string().dimmed()
    );
    let _ = writeln!(&mut out, "  Finished in {:.1}s", elapsed.as_secs_f64());
    let _ = writeln!(&mut out, "{}", "━".repeat(50).dimmed());
    out
}

#[derive(Debug, Serialize)]
struct JsonReport<'a> {
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    mode: &'a str,
    summary: Summary,
    tasks: &'a [TaskOutcome],
}

/// Writes the full report as pretty-printed JSON.
pub fn write_json(
    path: &Path,
    mode: &str,
    started_at: DateTime<Utc>,
    outcomes: &[TaskOutcome],
) -> Result<()> {
    let report = JsonReport {
        started_at,
        finished_at: Utc::now(),
        mode,
        summary: Summary::from_outcomes(outcomes),
        tasks: outcomes,
    };
    let json = serde_json::to_string_pretty(&report).context("Failed to serialize report")?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    fs::write(path, json).with_context(|| format!("Failed to write report: {}", path.display()))
}
