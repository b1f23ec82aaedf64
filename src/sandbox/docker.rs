use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, ListContainersOptions, LogOutput,
    RemoveContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::service::HostConfig;
use bollard::Docker;
use futures_util::StreamExt;
use std::collections::HashMap;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{
    Environment, EnvironmentProvider, EnvironmentSpec, ExecId, ExecRequest, NetworkMode,
    SandboxError, MANAGED_LABEL,
};

/// Hidden subcommand that performs an attached exec start in its own process.
pub(crate) const ATTACH_SUBCOMMAND: &str = "attach-exec";

/// Runs environments as Docker containers.
#[derive(Debug, Clone)]
pub(crate) struct DockerProvider {
    docker: Docker,
}

impl DockerProvider {
    /// Connects to the local Docker daemon without contacting it.
    pub fn connect() -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SandboxError::docker_unavailable(e.to_string()))?;
        Ok(Self { docker })
    }

    /// Checks that the daemon answers.
    pub async fn ping(&self) -> Result<(), SandboxError> {
        self.docker
            .ping()
            .await
            .map_err(|e| SandboxError::docker_unavailable(format!("{e}. Is Docker running?")))?;
        Ok(())
    }

    /// Force-removes every container carrying the managed label.
    ///
    /// Returns the names of the removed containers.
    pub async fn remove_orphaned(&self) -> Result<Vec<String>, SandboxError> {
        let filters = HashMap::from([(
            "label".to_string(),
            vec![format!("{MANAGED_LABEL}=true")],
        )]);
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters,
                ..Default::default()
            }))
            .await?;

        let mut removed = Vec::new();
        for summary in containers {
            let Some(id) = summary.id else { continue };
            let name = summary
                .names
                .and_then(|names| names.into_iter().next())
                .map_or_else(|| id.clone(), |n| n.trim_start_matches('/').to_string());
            let env = Environment { id, name };
            match self.remove(&env).await {
                Ok(()) => removed.push(env.name),
                Err(e) => warn!("Failed to remove {}: {}", env.name, e),
            }
        }
        Ok(removed)
    }
}

#[async_trait]
impl EnvironmentProvider for DockerProvider {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn create(&self, spec: &EnvironmentSpec) -> Result<Environment, SandboxError> {
        let name = container_name(&spec.role);
        debug!("Creating container: {}", name);

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                build_container_config(spec),
            )
            .await
            .map_err(|e| match e {
                DockerError::DockerResponseServerError {
                    status_code: 404, ..
                } => SandboxError::image_not_found(&spec.image),
                other => other.into(),
            })?;

        debug!("Starting container: {}", name);
        let env = Environment {
            id: created.id,
            name,
        };
        if let Err(e) = self.docker.start_container::<String>(&env.id, None).await {
            let _ = self.remove(&env).await;
            return Err(e.into());
        }

        info!("Created container {} ({})", env.name, spec.image);
        Ok(env)
    }

    async fn remove(&self, env: &Environment) -> Result<(), SandboxError> {
        debug!("Removing container: {}", env.name);
        match self
            .docker
            .remove_container(
                &env.id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            // Already gone
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn exec_create(
        &self,
        env: &Environment,
        request: &ExecRequest,
    ) -> Result<ExecId, SandboxError> {
        let exec = self
            .docker
            .create_exec(
                &env.id,
                CreateExecOptions {
                    cmd: Some(request.command.clone()),
                    env: Some(env_pairs(&request.env)),
                    working_dir: Some(request.workdir.display().to_string()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await?;
        debug!(exec = %exec.id, container = %env.name, "Created exec");
        Ok(ExecId(exec.id))
    }

    async fn exec_start(&self, exec: &ExecId) -> Result<Vec<u8>, SandboxError> {
        let mut output = Vec::new();

        if let StartExecResults::Attached {
            output: mut stream, ..
        } = self.docker.start_exec(&exec.0, None).await?
        {
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(
                        LogOutput::StdOut { message }
                        | LogOutput::StdErr { message }
                        | LogOutput::Console { message },
                    ) => output.extend_from_slice(&message),
                    Ok(LogOutput::StdIn { .. }) => {}
                    Err(e) => return Err(SandboxError::exec_failed(e.to_string())),
                }
            }
        }

        Ok(output)
    }

    async fn exec_status(&self, exec: &ExecId) -> Result<Option<i64>, SandboxError> {
        let inspect = self.docker.inspect_exec(&exec.0).await?;
        if inspect.running == Some(true) {
            return Ok(None);
        }
        Ok(inspect.exit_code)
    }

    async fn exec_detached(
        &self,
        env: &Environment,
        command: &[String],
    ) -> Result<(), SandboxError> {
        let exec = self
            .docker
            .create_exec(
                &env.id,
                CreateExecOptions {
                    cmd: Some(command.to_vec()),
                    attach_stdout: Some(false),
                    attach_stderr: Some(false),
                    ..Default::default()
                },
            )
            .await?;
        self.docker
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: true,
                    ..Default::default()
                }),
            )
            .await?;
        debug!(container = %env.name, "Started detached command: {:?}", command);
        Ok(())
    }

    fn attach_command(&self, exec: &ExecId) -> Result<Command, SandboxError> {
        let exe = std::env::current_exe().map_err(|e| {
            SandboxError::exec_failed(format!("Cannot locate own executable: {e}"))
        })?;
        let mut command = Command::new(exe);
        command.arg(ATTACH_SUBCOMMAND).arg(&exec.0);
        Ok(command)
    }
}

fn container_name(role: &str) -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("poolrun-{role}-{}", &id[..8])
}

fn env_pairs(env: &std::collections::BTreeMap<String, String>) -> Vec<String> {
    env.iter().map(|(k, v)| format!("{k}={v}")).collect()
}

fn build_container_config(spec: &EnvironmentSpec) -> ContainerConfig<String> {
    let binds = spec
        .binds
        .iter()
        .map(|bind| {
            let mode = if bind.readonly { "ro" } else { "rw" };
            format!(
                "{}:{}:{}",
                bind.host.display(),
                bind.container.display(),
                mode
            )
        })
        .collect();

    let network_mode = match &spec.network {
        NetworkMode::Default => None,
        NetworkMode::Joined(id) => Some(format!("container:{id}")),
    };

    // A tty keeps the image's default shell alive while the container idles.
    ContainerConfig {
        image: Some(spec.image.clone()),
        env: Some(env_pairs(&spec.env)),
        tty: Some(true),
        open_stdin: Some(true),
        labels: Some(HashMap::from([(
            MANAGED_LABEL.to_string(),
            "true".to_string(),
        )])),
        host_config: Some(HostConfig {
            binds: Some(binds),
            shm_size: spec.shm_size,
            memory: spec.memory,
            network_mode,
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::Bind;
    use std::path::PathBuf;

    fn spec() -> EnvironmentSpec {
        EnvironmentSpec {
            role: "runtime".to_string(),
            image: "runtime:latest".to_string(),
            binds: vec![
                Bind::same_path("/opt/bin"),
                Bind {
                    host: PathBuf::from("/home/ci/.ssh"),
                    container: PathBuf::from("/root/.ssh"),
                    readonly: true,
                },
            ],
            env: [("LD_LIBRARY_PATH".to_string(), "/opt/lib".to_string())].into(),
            shm_size: Some(8 * 1024 * 1024 * 1024),
            ..Default::default()
        }
    }

    #[test]
    fn test_container_config_binds_and_env() {
        let config = build_container_config(&spec());
        let host = config.host_config.unwrap();

        assert_eq!(
            host.binds.unwrap(),
            vec![
                "/opt/bin:/opt/bin:rw".to_string(),
                "/home/ci/.ssh:/root/.ssh:ro".to_string(),
            ]
        );
        assert_eq!(host.shm_size, Some(8 * 1024 * 1024 * 1024));
        assert_eq!(host.network_mode, None);
        assert_eq!(
            config.env.unwrap(),
            vec!["LD_LIBRARY_PATH=/opt/lib".to_string()]
        );
        assert_eq!(config.tty, Some(true));
    }

    #[test]
    fn test_container_config_is_labelled() {
        let config = build_container_config(&spec());
        let labels = config.labels.unwrap();
        assert_eq!(labels.get(MANAGED_LABEL).map(String::as_str), Some("true"));
    }

    #[test]
    fn test_joined_network_mode() {
        let mut spec = spec();
        spec.network = NetworkMode::Joined("abc123".to_string());
        let host = build_container_config(&spec).host_config.unwrap();
        assert_eq!(host.network_mode, Some("container:abc123".to_string()));
    }

    #[test]
    fn test_container_name_has_role_and_short_id() {
        let name = container_name("simulator");
        assert!(name.starts_with("poolrun-simulator-"));
        assert_eq!(name.len(), "poolrun-simulator-".len() + 8);
        assert_ne!(name, container_name("simulator"));
    }

    #[tokio::test]
    async fn test_attach_command_reinvokes_self() {
        let provider = DockerProvider::connect().unwrap();
        let command = provider.attach_command(&ExecId("e1".to_string())).unwrap();
        let args: Vec<_> = command.as_std().get_args().collect();
        assert_eq!(args, vec![ATTACH_SUBCOMMAND, "e1"]);
    }
}
