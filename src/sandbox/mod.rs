//! Sandboxed execution environments.
//!
//! An [`EnvironmentProvider`] creates and removes environments and runs
//! commands inside them. [`DockerProvider`] backs environments with
//! containers; [`HostProvider`] runs commands directly on the host.

mod docker;
mod error;
mod host;

pub(crate) use docker::{DockerProvider, ATTACH_SUBCOMMAND};
pub(crate) use error::SandboxError;
pub(crate) use host::HostProvider;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use tokio::process::Command;

/// Label attached to every environment this tool creates.
pub(crate) const MANAGED_LABEL: &str = "poolrun.managed";

/// A bind mount from the host into an environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Bind {
    pub host: PathBuf,
    pub container: PathBuf,
    pub readonly: bool,
}

impl Bind {
    /// Mounts `path` at the same location inside the environment.
    pub fn same_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            host: path.clone(),
            container: path,
            readonly: false,
        }
    }
}

/// Which network namespace an environment joins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) enum NetworkMode {
    /// The provider's default network.
    #[default]
    Default,
    /// Share the network namespace of another environment.
    Joined(String),
}

/// Declarative description of an environment to create.
#[derive(Debug, Clone, Default)]
pub(crate) struct EnvironmentSpec {
    /// Short role name used in environment names (e.g. "runtime").
    pub role: String,
    pub image: String,
    pub binds: Vec<Bind>,
    pub env: BTreeMap<String, String>,
    /// Shared memory size in bytes.
    pub shm_size: Option<i64>,
    /// Memory limit in bytes.
    pub memory: Option<i64>,
    pub network: NetworkMode,
}

/// A live environment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct Environment {
    pub id: String,
    pub name: String,
}

/// A command to run inside an environment.
#[derive(Debug, Clone, Default)]
pub(crate) struct ExecRequest {
    pub command: Vec<String>,
    pub workdir: PathBuf,
    pub env: BTreeMap<String, String>,
}

impl ExecRequest {
    /// Renders the command line for messages.
    pub fn display_command(&self) -> String {
        self.command.join(" ")
    }
}

/// Handle to a created but not necessarily started exec.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct ExecId(pub String);

impl fmt::Display for ExecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Creates, removes and executes commands in sandboxed environments.
#[async_trait]
pub(crate) trait EnvironmentProvider: Send + Sync {
    /// Returns the provider name for display.
    fn name(&self) -> &'static str;

    /// Creates and starts an environment.
    async fn create(&self, spec: &EnvironmentSpec) -> Result<Environment, SandboxError>;

    /// Forcefully removes an environment.
    async fn remove(&self, env: &Environment) -> Result<(), SandboxError>;

    /// Registers a command for execution without starting it.
    async fn exec_create(
        &self,
        env: &Environment,
        request: &ExecRequest,
    ) -> Result<ExecId, SandboxError>;

    /// Starts an exec and collects its combined output.
    ///
    /// This call may block indefinitely and cannot be interrupted from the
    /// calling task; use [`attach_command`](Self::attach_command) when a
    /// deadline is needed.
    async fn exec_start(&self, exec: &ExecId) -> Result<Vec<u8>, SandboxError>;

    /// Returns the exit code once the exec has finished, `None` while running.
    async fn exec_status(&self, exec: &ExecId) -> Result<Option<i64>, SandboxError>;

    /// Starts a command in the background without collecting anything.
    async fn exec_detached(&self, env: &Environment, command: &[String])
        -> Result<(), SandboxError>;

    /// A separate OS process that performs [`exec_start`](Self::exec_start)
    /// and writes the output to its stdout. Killing the process abandons the
    /// attach no matter what it is blocked on.
    fn attach_command(&self, exec: &ExecId) -> Result<Command, SandboxError>;

    /// Forgets a finished or abandoned exec. Its status is no longer
    /// available afterwards.
    async fn exec_release(&self, _exec: &ExecId) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_path_bind_is_writable() {
        let bind = Bind::same_path("/opt/tests");
        assert_eq!(bind.host, bind.container);
        assert!(!bind.readonly);
    }

    #[test]
    fn test_display_command_joins_arguments() {
        let request = ExecRequest {
            command: vec!["/bin/test".into(), "--gtest_filter=A.*".into()],
            ..Default::default()
        };
        assert_eq!(request.display_command(), "/bin/test --gtest_filter=A.*");
    }

    #[test]
    fn test_providers_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<DockerProvider>();
        assert_send_sync::<HostProvider>();
    }
}
