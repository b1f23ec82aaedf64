//! Cancellable command execution inside an environment.
//!
//! Starting an exec and collecting its output is a blocking call with no
//! interruption point. When a deadline is requested the call is moved into a
//! [`PreemptibleUnit`] (a separate OS process) and raced against the
//! deadline while the exit status is polled independently. Losing the race
//! kills the unit.

mod preemptible;

pub(crate) use preemptible::PreemptibleUnit;

use std::time::Duration;
use tokio::time::{sleep, sleep_until, timeout_at, Instant};
use tracing::debug;

use crate::sandbox::{Environment, EnvironmentProvider, ExecId, ExecRequest, SandboxError};

/// How often the exit status of a running exec is polled.
pub(crate) const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Result of a command that reached a definite exit status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ExecOutput {
    pub exit_code: i64,
    pub output: Vec<u8>,
}

impl ExecOutput {
    /// Output decoded lossily as UTF-8.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }
}

/// Runs `request` in `env`.
///
/// With a non-zero `timeout`, fails with [`SandboxError::Timeout`] unless an
/// exit status is observed before the deadline. Without one, the exec is
/// started directly and cannot be cancelled.
pub(crate) async fn run_command(
    provider: &dyn EnvironmentProvider,
    env: &Environment,
    request: &ExecRequest,
    timeout: Option<Duration>,
) -> Result<ExecOutput, SandboxError> {
    let exec = provider.exec_create(env, request).await?;
    debug!(exec = %exec, environment = %env.name, "Running {}", request.display_command());

    let result = match timeout.filter(|t| !t.is_zero()) {
        None => run_direct(provider, &exec).await,
        Some(timeout) => run_preemptible(provider, &exec, timeout).await,
    };
    provider.exec_release(&exec).await;
    result
}

async fn run_direct(
    provider: &dyn EnvironmentProvider,
    exec: &ExecId,
) -> Result<ExecOutput, SandboxError> {
    let output = provider.exec_start(exec).await?;
    let exit_code = wait_for_exit_code(provider, exec).await?;
    Ok(ExecOutput { exit_code, output })
}

async fn run_preemptible(
    provider: &dyn EnvironmentProvider,
    exec: &ExecId,
    timeout: Duration,
) -> Result<ExecOutput, SandboxError> {
    let deadline = Instant::now() + timeout;
    let mut unit = PreemptibleUnit::spawn(provider.attach_command(exec)?)?;
    debug!(exec = %exec, pid = ?unit.id(), "Attached");

    let observed = tokio::select! {
        status = wait_for_exit_code(provider, exec) => Some(status),
        () = sleep_until(deadline) => None,
    };

    let exit_code = match observed {
        Some(Ok(code)) => code,
        Some(Err(e)) => {
            let _ = unit.terminate().await;
            return Err(e);
        }
        None => {
            let status = unit.terminate().await?;
            debug!(exec = %exec, "No exit status after {:?}, unit killed ({status})", timeout);
            return Err(SandboxError::timeout(timeout));
        }
    };

    // Output still has to arrive before the original deadline.
    match timeout_at(deadline, unit.collect_output()).await {
        Ok(output) => Ok(ExecOutput {
            exit_code,
            output: output?,
        }),
        Err(_) => {
            let status = unit.terminate().await?;
            debug!(exec = %exec, "Output not delivered in time, unit killed ({status})");
            Err(SandboxError::timeout(timeout))
        }
    }
}

/// Polls until the exec reports an exit code.
async fn wait_for_exit_code(
    provider: &dyn EnvironmentProvider,
    exec: &ExecId,
) -> Result<i64, SandboxError> {
    loop {
        if let Some(code) = provider.exec_status(exec).await? {
            return Ok(code);
        }
        sleep(EXIT_POLL_INTERVAL).await;
    }
}
