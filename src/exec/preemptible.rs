//! A separately killable unit of execution.

use std::process::{ExitStatus, Stdio};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::sandbox::SandboxError;

/// A child process whose stdout carries the buffered result of a blocking
/// call made inside it.
///
/// Stdout is drained concurrently from spawn so a chatty unit never blocks
/// on a full pipe. On Unix the unit leads its own process group and
/// termination kills the whole group. Dropping the unit kills the process.
pub(crate) struct PreemptibleUnit {
    child: Child,
    reader: JoinHandle<std::io::Result<Vec<u8>>>,
}

impl PreemptibleUnit {
    /// Spawns `command` with a captured stdout.
    pub fn spawn(mut command: Command) -> Result<Self, SandboxError> {
        command
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);
        let mut child = command.spawn()?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::exec_failed("Pre-emptible unit has no stdout"))?;
        let reader = tokio::spawn(async move {
            let mut buf = Vec::new();
            stdout.read_to_end(&mut buf).await?;
            Ok(buf)
        });

        Ok(Self { child, reader })
    }

    /// OS process id, if the process has not been reaped.
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Waits for the unit to exit and returns everything it wrote.
    pub async fn collect_output(&mut self) -> Result<Vec<u8>, SandboxError> {
        let status = self.child.wait().await?;
        let output = (&mut self.reader)
            .await
            .map_err(|e| SandboxError::exec_failed(format!("Output reader failed: {e}")))??;

        if !status.success() {
            return Err(SandboxError::exec_failed(format!(
                "Pre-emptible unit exited with {status}: {}",
                String::from_utf8_lossy(&output).trim()
            )));
        }
        Ok(output)
    }

    /// Hard-kills the unit and waits until the process has been reaped.
    pub async fn terminate(mut self) -> Result<ExitStatus, SandboxError> {
        self.reader.abort();
        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            kill_group(pid);
        }
        // kill() is a no-op error if the process already exited
        let _ = self.child.kill().await;
        Ok(self.child.wait().await?)
    }
}

/// Kills every process in the group led by `pid`.
#[cfg(unix)]
fn kill_group(pid: u32) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    // ESRCH when the group is already gone
    let _ = killpg(Pid::from_raw(raw), Signal::SIGKILL);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn sh(script: &str) -> Command {
        let mut command = Command::new("sh");
        command.arg("-c").arg(script);
        command
    }

    #[tokio::test]
    async fn test_collect_output() {
        let mut unit = PreemptibleUnit::spawn(sh("echo hello")).unwrap();
        let output = unit.collect_output().await.unwrap();
        assert_eq!(output, b"hello\n");
    }

    #[tokio::test]
    async fn test_large_output_does_not_block() {
        let mut unit = PreemptibleUnit::spawn(sh("head -c 1048576 /dev/zero")).unwrap();
        let output = unit.collect_output().await.unwrap();
        assert_eq!(output.len(), 1_048_576);
    }

    #[tokio::test]
    async fn test_failed_unit_is_an_error() {
        let mut unit = PreemptibleUnit::spawn(sh("echo boom; exit 2")).unwrap();
        let err = unit.collect_output().await.unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn test_terminate_kills_and_reaps() {
        let unit = PreemptibleUnit::spawn(sh("sleep 30")).unwrap();
        assert!(unit.id().is_some());

        let start = Instant::now();
        let status = unit.terminate().await.unwrap();
        assert!(!status.success());
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_kills_grandchildren() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("survived");
        let script = format!("sh -c 'sleep 1; touch {}'; true", marker.display());
        let unit = PreemptibleUnit::spawn(sh(&script)).unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        unit.terminate().await.unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists());
    }
}
