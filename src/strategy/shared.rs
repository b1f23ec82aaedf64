//! Many concurrent tasks in one long-lived environment.

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::ffi::OsString;
use std::io;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::{staging, Completion, InFlight, Strategy, TaskError, TaskReport};
use crate::exec::{self, ExecOutput};
use crate::pool::{Lease, Lifecycle, ManagedPool, PoolError, PoolStats};
use crate::sandbox::{Environment, EnvironmentProvider, EnvironmentSpec, ExecRequest};

/// Maps a task to the path its artifact is moved to.
pub(crate) type ArtifactPath<C> = Box<dyn Fn(&C, &Path, &[String]) -> PathBuf + Send + Sync>;

/// Settings for [`SharedEnvironment`].
#[derive(Debug, Clone)]
pub(crate) struct SharedSettings {
    /// Directory holding the executables. Copied into every task's workdir.
    pub binary_dir: PathBuf,
    pub max_workers: NonZeroUsize,
    /// Extra variables for every task command.
    pub task_env: BTreeMap<String, String>,
    /// Extension (without the dot) of the artifact a task may produce.
    pub artifact_extension: String,
}

/// Builds single environments from a fixed spec.
pub(crate) struct EnvironmentLifecycle {
    provider: Arc<dyn EnvironmentProvider>,
    spec: EnvironmentSpec,
    runtime: Handle,
}

impl Lifecycle for EnvironmentLifecycle {
    type Resource = Environment;

    fn make(&self) -> Result<Environment> {
        self.runtime
            .block_on(self.provider.create(&self.spec))
            .with_context(|| format!("Failed to create {} environment", self.spec.role))
    }

    fn destroy(&self, env: &Environment) -> Result<()> {
        self.runtime
            .block_on(self.provider.remove(env))
            .with_context(|| format!("Failed to remove {}", env.name))
    }
}

enum Slot {
    Pending,
    Ready(Arc<Environment>),
    Closed,
}

struct Inner<C> {
    pool: Arc<ManagedPool<EnvironmentLifecycle>>,
    provider: Arc<dyn EnvironmentProvider>,
    settings: SharedSettings,
    artifact_path: Option<ArtifactPath<C>>,
    workers: Semaphore,
    in_flight: InFlight,
    slot: watch::Sender<Slot>,
    /// The checked-out environment, held from `start()` until shutdown.
    lease: Mutex<Option<Lease<EnvironmentLifecycle>>>,
}

/// Runs tasks concurrently in a single shared environment.
///
/// Tasks are isolated only by working directory: each one gets a hard-linked
/// copy of the binary directory. After a task exits with 0 or 1, a single new
/// artifact in its workdir is moved to the path given by `artifact_path`.
pub(crate) struct SharedEnvironment<C> {
    inner: Arc<Inner<C>>,
}

impl<C: Send + Sync + 'static> SharedEnvironment<C> {
    /// Must be called from within a Tokio runtime.
    pub fn new(
        provider: Arc<dyn EnvironmentProvider>,
        spec: EnvironmentSpec,
        settings: SharedSettings,
        artifact_path: Option<ArtifactPath<C>>,
    ) -> Result<Self> {
        let runtime = Handle::try_current().context("Shared strategy needs a Tokio runtime")?;
        let lifecycle = EnvironmentLifecycle {
            provider: Arc::clone(&provider),
            spec,
            runtime,
        };
        let pool = ManagedPool::new(lifecycle, NonZeroUsize::MIN);
        let (slot, _) = watch::channel(Slot::Pending);

        Ok(Self {
            inner: Arc::new(Inner {
                pool: Arc::new(pool),
                provider,
                workers: Semaphore::new(settings.max_workers.get()),
                settings,
                artifact_path,
                in_flight: InFlight::new(),
                slot,
                lease: Mutex::new(None),
            }),
        })
    }

    #[allow(dead_code)] // Inspected by tests
    pub fn pool_stats(&self) -> PoolStats {
        self.inner.pool.stats()
    }
}

impl<C: Send + Sync + 'static> Inner<C> {
    async fn environment(&self) -> Result<Arc<Environment>, TaskError> {
        let mut rx = self.slot.subscribe();
        let slot = rx
            .wait_for(|slot| !matches!(slot, Slot::Pending))
            .await
            .map_err(|_| PoolError::illegal_state("submit()"))?;
        match &*slot {
            Slot::Ready(env) => Ok(Arc::clone(env)),
            _ => Err(PoolError::illegal_state("submit()").into()),
        }
    }

    async fn run_task(
        &self,
        context: &C,
        executable: &Path,
        args: &[String],
        timeout: Option<Duration>,
    ) -> Result<Completion, TaskError> {
        let _permit = self
            .workers
            .acquire()
            .await
            .map_err(|_| PoolError::illegal_state("submit()"))?;
        let env = self.environment().await?;

        let binary_dir = self.settings.binary_dir.clone();
        let workdir = tokio::task::spawn_blocking(move || staging::stage(&binary_dir))
            .await
            .map_err(io::Error::other)??;
        let before = staging::snapshot(workdir.path())?;

        let mut command = vec![workdir.path().join(executable).display().to_string()];
        command.extend_from_slice(args);
        let request = ExecRequest {
            command,
            workdir: workdir.path().to_path_buf(),
            env: self.settings.task_env.clone(),
        };

        let result = match exec::run_command(self.provider.as_ref(), &env, &request, timeout).await
        {
            Ok(out) => self.collect(context, executable, args, &request, &before, out),
            Err(e) if e.is_timeout() => Ok(Completion::TimedOut),
            Err(e) => Err(e.into()),
        };

        let path = workdir.path().to_path_buf();
        match tokio::task::spawn_blocking(move || workdir.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Failed to remove {}: {}", path.display(), e),
            Err(e) => debug!("Failed to remove {}: {}", path.display(), e),
        }
        result
    }

    fn collect(
        &self,
        context: &C,
        executable: &Path,
        args: &[String],
        request: &ExecRequest,
        before: &HashSet<OsString>,
        out: ExecOutput,
    ) -> Result<Completion, TaskError> {
        let output = out.text();
        let artifacts =
            staging::new_artifacts(&request.workdir, before, &self.settings.artifact_extension)?;

        if artifacts.len() > 1 {
            return Err(TaskError::AmbiguousArtifact {
                command: request.display_command(),
                count: artifacts.len(),
                output,
            });
        }

        let mut artifact = None;
        if matches!(out.exit_code, 0 | 1) {
            if let (Some(found), Some(path_for)) = (artifacts.first(), &self.artifact_path) {
                let destination = path_for(context, executable, args);
                staging::move_artifact(found, &destination)?;
                debug!("Moved artifact to {}", destination.display());
                artifact = Some(destination);
            }
        }

        Ok(Completion::Exited {
            exit_code: out.exit_code,
            output,
            artifact,
        })
    }

    /// Hands the shared environment back and drains the pool.
    async fn release(&self, force: bool) {
        self.slot.send_replace(Slot::Closed);
        if let Some(lease) = self.lease.lock().take() {
            self.pool.put(lease);
        }
        let pool = Arc::clone(&self.pool);
        if let Err(e) = tokio::task::spawn_blocking(move || pool.shutdown(true, force)).await {
            error!("Pool shutdown failed: {}", e);
        }
    }
}

#[async_trait]
impl<C: Send + Sync + 'static> Strategy<C> for SharedEnvironment<C> {
    async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        inner.pool.start()?;

        let pool = Arc::clone(&inner.pool);
        let lease = tokio::task::spawn_blocking(move || pool.get())
            .await
            .context("Environment checkout was interrupted")??;

        let env = lease.share();
        {
            let mut held = inner.lease.lock();
            if inner.in_flight.is_closed() {
                drop(held);
                inner.pool.put(lease);
                anyhow::bail!("Shut down while starting");
            }
            *held = Some(lease);
        }

        info!(environment = %env.name, "Shared environment ready");
        inner.slot.send_replace(Slot::Ready(env));
        Ok(())
    }

    async fn shutdown(&self, wait: bool, force: bool) {
        let inner = Arc::clone(&self.inner);
        inner.in_flight.close();

        // Nothing will ever fill the slot once shutdown starts.
        let never_started = matches!(*inner.slot.borrow(), Slot::Pending);
        if force || never_started {
            inner.slot.send_replace(Slot::Closed);
        }
        if force {
            inner.pool.shutdown(false, true);
        }

        let drain = async move {
            inner.in_flight.wait_idle().await;
            inner.release(force).await;
        };
        if wait {
            drain.await;
        } else {
            tokio::spawn(drain);
        }
    }

    fn submit(
        &self,
        context: C,
        executable: PathBuf,
        args: Vec<String>,
        timeout: Option<Duration>,
    ) -> Result<JoinHandle<TaskReport<C>>, PoolError> {
        let guard = self
            .inner
            .in_flight
            .enter()
            .ok_or_else(|| PoolError::illegal_state("submit()"))?;
        let inner = Arc::clone(&self.inner);

        Ok(tokio::spawn(async move {
            let _guard = guard;
            let result = inner.run_task(&context, &executable, &args, timeout).await;
            TaskReport { context, result }
        }))
    }
}
