//! Unsandboxed execution directly on the host.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use tempfile::TempDir;
use tokio::process::Command;
use tracing::debug;

use super::{Environment, EnvironmentProvider, EnvironmentSpec, ExecId, ExecRequest, SandboxError};

/// Wrapper that runs the command and publishes its exit status.
///
/// Arguments: status file, working directory, command and its arguments.
/// The status file appears atomically once the command has exited.
/// A working directory that cannot be entered reports status 127.
const WRAPPER: &str = r#"status="$1"; dir="$2"; shift 2; if cd "$dir"; then "$@" 2>&1; code=$?; else code=127; fi; printf "%s" "$code" > "$status.part"; mv "$status.part" "$status""#;

struct HostExec {
    command: Vec<String>,
    workdir: PathBuf,
    env: BTreeMap<String, String>,
    status: PathBuf,
}

/// Runs commands on the host with no isolation.
///
/// Environments are bookkeeping only: creating one records its variables,
/// removing one forgets them.
pub(crate) struct HostProvider {
    status_dir: TempDir,
    next_id: AtomicU64,
    envs: Mutex<HashMap<String, BTreeMap<String, String>>>,
    execs: Mutex<HashMap<String, HostExec>>,
}

impl HostProvider {
    pub fn new() -> Result<Self, SandboxError> {
        let status_dir = tempfile::Builder::new().prefix("poolrun-host-").tempdir()?;
        Ok(Self {
            status_dir,
            next_id: AtomicU64::new(1),
            envs: Mutex::new(HashMap::new()),
            execs: Mutex::new(HashMap::new()),
        })
    }

    fn next(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn wrapper(&self, exec: &ExecId) -> Result<Command, SandboxError> {
        let execs = self.execs.lock();
        let entry = execs
            .get(&exec.0)
            .ok_or_else(|| SandboxError::exec_failed(format!("Unknown exec: {exec}")))?;

        let workdir = if entry.workdir.as_os_str().is_empty() {
            Path::new(".")
        } else {
            entry.workdir.as_path()
        };

        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(WRAPPER)
            .arg("poolrun-exec")
            .arg(&entry.status)
            .arg(workdir)
            .args(&entry.command)
            .envs(&entry.env)
            .stdin(Stdio::null());
        Ok(command)
    }

    #[cfg(test)]
    pub(crate) fn pending_execs(&self) -> usize {
        self.execs.lock().len()
    }

    fn status_path(&self, exec: &ExecId) -> Result<PathBuf, SandboxError> {
        self.execs
            .lock()
            .get(&exec.0)
            .map(|entry| entry.status.clone())
            .ok_or_else(|| SandboxError::exec_failed(format!("Unknown exec: {exec}")))
    }
}

#[async_trait]
impl EnvironmentProvider for HostProvider {
    fn name(&self) -> &'static str {
        "host"
    }

    async fn create(&self, spec: &EnvironmentSpec) -> Result<Environment, SandboxError> {
        let n = self.next();
        let env = Environment {
            id: format!("host-{n}"),
            name: format!("poolrun-{}-host{n}", spec.role),
        };
        self.envs.lock().insert(env.id.clone(), spec.env.clone());
        debug!("Created host environment {}", env.name);
        Ok(env)
    }

    async fn remove(&self, env: &Environment) -> Result<(), SandboxError> {
        self.envs.lock().remove(&env.id);
        debug!("Removed host environment {}", env.name);
        Ok(())
    }

    async fn exec_create(
        &self,
        env: &Environment,
        request: &ExecRequest,
    ) -> Result<ExecId, SandboxError> {
        if request.command.is_empty() {
            return Err(SandboxError::exec_failed("Empty command"));
        }

        let mut vars = self
            .envs
            .lock()
            .get(&env.id)
            .cloned()
            .ok_or_else(|| SandboxError::container_unhealthy(format!("{} was removed", env.name)))?;
        vars.extend(request.env.clone());

        let id = ExecId(format!("exec-{}", self.next()));
        let status = self.status_dir.path().join(&id.0);
        self.execs.lock().insert(
            id.0.clone(),
            HostExec {
                command: request.command.clone(),
                workdir: request.workdir.clone(),
                env: vars,
                status,
            },
        );
        Ok(id)
    }

    async fn exec_start(&self, exec: &ExecId) -> Result<Vec<u8>, SandboxError> {
        let output = self.wrapper(exec)?.stderr(Stdio::null()).output().await?;
        Ok(output.stdout)
    }

    async fn exec_status(&self, exec: &ExecId) -> Result<Option<i64>, SandboxError> {
        let path = self.status_path(exec)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(code) => code.trim().parse().map(Some).map_err(|_| {
                SandboxError::exec_failed(format!("Malformed exit status for {exec}: {code:?}"))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn exec_detached(
        &self,
        env: &Environment,
        command: &[String],
    ) -> Result<(), SandboxError> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| SandboxError::exec_failed("Empty command"))?;
        let vars = self.envs.lock().get(&env.id).cloned().unwrap_or_default();

        Command::new(program)
            .args(args)
            .envs(&vars)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        debug!(environment = %env.name, "Started detached command: {:?}", command);
        Ok(())
    }

    fn attach_command(&self, exec: &ExecId) -> Result<Command, SandboxError> {
        self.wrapper(exec)
    }

    async fn exec_release(&self, exec: &ExecId) {
        let Some(entry) = self.execs.lock().remove(&exec.0) else {
            return;
        };
        // A killed wrapper may have left either file behind
        let _ = tokio::fs::remove_file(&entry.status).await;
        let _ = tokio::fs::remove_file(entry.status.with_extension("part")).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    async fn environment(provider: &HostProvider) -> Environment {
        let spec = EnvironmentSpec {
            role: "runtime".to_string(),
            env: [("POOLRUN_ROLE".to_string(), "runtime".to_string())].into(),
            ..Default::default()
        };
        provider.create(&spec).await.unwrap()
    }

    #[tokio::test]
    async fn test_exec_start_collects_output_and_status() {
        let provider = HostProvider::new().unwrap();
        let env = environment(&provider).await;
        let request = ExecRequest {
            command: sh("echo out; echo err >&2; exit 3"),
            ..Default::default()
        };

        let exec = provider.exec_create(&env, &request).await.unwrap();
        assert_eq!(provider.exec_status(&exec).await.unwrap(), None);

        let output = provider.exec_start(&exec).await.unwrap();
        assert_eq!(String::from_utf8_lossy(&output), "out\nerr\n");
        assert_eq!(provider.exec_status(&exec).await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_exec_uses_workdir_and_merged_env() {
        let provider = HostProvider::new().unwrap();
        let env = environment(&provider).await;
        let dir = tempfile::tempdir().unwrap();
        let request = ExecRequest {
            command: sh("pwd -P; echo $POOLRUN_ROLE $TASK"),
            workdir: dir.path().to_path_buf(),
            env: [("TASK".to_string(), "a".to_string())].into(),
        };

        let exec = provider.exec_create(&env, &request).await.unwrap();
        let output = String::from_utf8(provider.exec_start(&exec).await.unwrap()).unwrap();
        let canonical = dir.path().canonicalize().unwrap();
        assert_eq!(output, format!("{}\nruntime a\n", canonical.display()));
    }

    #[tokio::test]
    async fn test_missing_workdir_reports_127() {
        let provider = HostProvider::new().unwrap();
        let env = environment(&provider).await;
        let request = ExecRequest {
            command: sh("true"),
            workdir: PathBuf::from("/nonexistent/poolrun"),
            ..Default::default()
        };

        let exec = provider.exec_create(&env, &request).await.unwrap();
        provider.exec_start(&exec).await.unwrap();
        assert_eq!(provider.exec_status(&exec).await.unwrap(), Some(127));
    }

    #[tokio::test]
    async fn test_exec_in_removed_environment_fails() {
        let provider = HostProvider::new().unwrap();
        let env = environment(&provider).await;
        provider.remove(&env).await.unwrap();

        let request = ExecRequest {
            command: sh("true"),
            ..Default::default()
        };
        let err = provider.exec_create(&env, &request).await.unwrap_err();
        assert!(matches!(err, SandboxError::ContainerUnhealthy { .. }));
    }

    #[tokio::test]
    async fn test_unknown_exec_fails() {
        let provider = HostProvider::new().unwrap();
        let err = provider
            .exec_status(&ExecId("exec-404".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::ExecFailed { .. }));
    }

    #[tokio::test]
    async fn test_exec_release_forgets_the_exec() {
        let provider = HostProvider::new().unwrap();
        let env = environment(&provider).await;
        let request = ExecRequest {
            command: sh("exit 0"),
            ..Default::default()
        };

        let exec = provider.exec_create(&env, &request).await.unwrap();
        provider.exec_start(&exec).await.unwrap();
        let status = provider.status_path(&exec).unwrap();
        assert!(status.exists());

        provider.exec_release(&exec).await;
        assert!(!status.exists());
        assert_eq!(provider.pending_execs(), 0);
        assert!(provider.exec_status(&exec).await.is_err());

        // Releasing twice is harmless
        provider.exec_release(&exec).await;
    }

    #[tokio::test]
    async fn test_exec_detached_runs_in_background() {
        let provider = HostProvider::new().unwrap();
        let env = environment(&provider).await;
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("started");

        provider
            .exec_detached(&env, &sh(&format!("touch {}", marker.display())))
            .await
            .unwrap();

        for _ in 0..50 {
            if marker.exists() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("detached command never ran");
    }
}
