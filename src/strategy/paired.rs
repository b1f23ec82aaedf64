//! One exclusive primary/companion pair per task.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use super::{Completion, InFlight, Strategy, TaskError, TaskReport};
use crate::exec;
use crate::pool::{Lifecycle, ManagedPool, PoolError, PoolStats, ShutdownSignal};
use crate::sandbox::{
    Environment, EnvironmentProvider, EnvironmentSpec, ExecRequest, NetworkMode,
};

const READINESS_POLL: Duration = Duration::from_millis(200);

/// Settings for [`PairedExclusive`].
#[derive(Debug, Clone)]
pub(crate) struct PairSettings {
    /// Directory holding the executables, mounted at the same path in the primary.
    pub binary_dir: PathBuf,
    /// Pool capacity and task concurrency.
    pub max_pairs: NonZeroUsize,
    pub task_env: BTreeMap<String, String>,
    /// Started detached in the companion on every prepare.
    pub simulator_command: Vec<String>,
    /// Run in the primary until it exits 0.
    pub readiness_probe: Vec<String>,
    pub readiness_timeout: Duration,
}

/// A primary environment and a companion sharing its network namespace.
#[derive(Debug)]
pub(crate) struct Pair {
    pub primary: Environment,
    pub companion: Environment,
}

pub(crate) struct PairLifecycle {
    provider: Arc<dyn EnvironmentProvider>,
    primary: EnvironmentSpec,
    companion: EnvironmentSpec,
    simulator_command: Vec<String>,
    readiness_probe: Vec<String>,
    readiness_timeout: Duration,
    runtime: Handle,
}

impl PairLifecycle {
    async fn make_pair(&self) -> Result<Pair> {
        let primary = self
            .provider
            .create(&self.primary)
            .await
            .context("Failed to create primary environment")?;

        let companion_spec = EnvironmentSpec {
            network: NetworkMode::Joined(primary.id.clone()),
            ..self.companion.clone()
        };
        match self.provider.create(&companion_spec).await {
            Ok(companion) => {
                debug!(primary = %primary.name, companion = %companion.name, "Pair created");
                Ok(Pair { primary, companion })
            }
            Err(e) => {
                if let Err(cleanup) = self.provider.remove(&primary).await {
                    warn!("Failed to remove orphaned {}: {}", primary.name, cleanup);
                }
                Err(anyhow!(e).context("Failed to create companion environment"))
            }
        }
    }

    async fn prepare_pair(&self, pair: &Pair, shutdown: &ShutdownSignal) -> Result<()> {
        self.provider
            .exec_detached(&pair.companion, &self.simulator_command)
            .await
            .context("Failed to start simulator")?;

        let probe = ExecRequest {
            command: self.readiness_probe.clone(),
            workdir: PathBuf::from("/"),
            env: BTreeMap::new(),
        };
        let deadline = Instant::now() + self.readiness_timeout;

        loop {
            if shutdown.is_set() {
                bail!("Interrupted by pool shutdown");
            }
            let probed = exec::run_command(self.provider.as_ref(), &pair.primary, &probe, None)
                .await
                .context("Readiness probe failed")?;
            if probed.exit_code == 0 {
                debug!(primary = %pair.primary.name, "Simulator is listening");
                return Ok(());
            }
            if Instant::now() >= deadline {
                bail!(
                    "Simulator in {} not listening after {:?}",
                    pair.companion.name,
                    self.readiness_timeout
                );
            }
            tokio::time::sleep(READINESS_POLL).await;
        }
    }

    async fn destroy_pair(&self, pair: &Pair) -> Result<()> {
        let (companion, primary) = tokio::join!(
            self.provider.remove(&pair.companion),
            self.provider.remove(&pair.primary),
        );
        companion.with_context(|| format!("Failed to remove {}", pair.companion.name))?;
        primary.with_context(|| format!("Failed to remove {}", pair.primary.name))
    }
}

impl Lifecycle for PairLifecycle {
    type Resource = Pair;

    fn make(&self) -> Result<Pair> {
        self.runtime.block_on(self.make_pair())
    }

    fn prepare(&self, pair: &Pair, shutdown: &ShutdownSignal) -> Result<()> {
        self.runtime.block_on(self.prepare_pair(pair, shutdown))
    }

    fn destroy(&self, pair: &Pair) -> Result<()> {
        self.runtime.block_on(self.destroy_pair(pair))
    }
}

struct Inner {
    pool: Arc<ManagedPool<PairLifecycle>>,
    provider: Arc<dyn EnvironmentProvider>,
    settings: PairSettings,
    workers: Semaphore,
    in_flight: InFlight,
}

/// Runs every task against its own validated pair.
///
/// A pair whose task timed out is discarded and rebuilt, since the simulator
/// cannot be trusted afterwards. Any other exit returns the pair for reuse.
pub(crate) struct PairedExclusive {
    inner: Arc<Inner>,
}

impl PairedExclusive {
    /// Must be called from within a Tokio runtime.
    pub fn new(
        provider: Arc<dyn EnvironmentProvider>,
        primary: EnvironmentSpec,
        companion: EnvironmentSpec,
        settings: PairSettings,
    ) -> Result<Self> {
        let runtime = Handle::try_current().context("Paired strategy needs a Tokio runtime")?;
        let lifecycle = PairLifecycle {
            provider: Arc::clone(&provider),
            primary,
            companion,
            simulator_command: settings.simulator_command.clone(),
            readiness_probe: settings.readiness_probe.clone(),
            readiness_timeout: settings.readiness_timeout,
            runtime,
        };
        let pool = ManagedPool::new(lifecycle, settings.max_pairs);

        Ok(Self {
            inner: Arc::new(Inner {
                pool: Arc::new(pool),
                provider,
                workers: Semaphore::new(settings.max_pairs.get()),
                settings,
                in_flight: InFlight::new(),
            }),
        })
    }

    #[allow(dead_code)] // Inspected by tests
    pub fn pool_stats(&self) -> PoolStats {
        self.inner.pool.stats()
    }
}

impl Inner {
    async fn run_task(
        &self,
        executable: &Path,
        args: &[String],
        timeout: Option<Duration>,
    ) -> Result<Completion, TaskError> {
        let _permit = self
            .workers
            .acquire()
            .await
            .map_err(|_| PoolError::illegal_state("submit()"))?;

        let pool = Arc::clone(&self.pool);
        let lease = tokio::task::spawn_blocking(move || pool.get())
            .await
            .map_err(|_| PoolError::illegal_state("get()"))??;

        let mut command = vec![self.settings.binary_dir.join(executable).display().to_string()];
        command.extend_from_slice(args);
        let request = ExecRequest {
            command,
            workdir: self.settings.binary_dir.clone(),
            env: self.settings.task_env.clone(),
        };

        let outcome =
            exec::run_command(self.provider.as_ref(), &lease.primary, &request, timeout).await;
        match outcome {
            Ok(out) => {
                self.pool.put(lease);
                Ok(Completion::Exited {
                    exit_code: out.exit_code,
                    output: out.text(),
                    artifact: None,
                })
            }
            Err(e) if e.is_timeout() => {
                warn!(pair = %lease.id(), "{} timed out; rebuilding pair", request.display_command());
                self.pool.discard(lease);
                Ok(Completion::TimedOut)
            }
            Err(e) => {
                warn!(pair = %lease.id(), "Discarding pair after error: {}", e);
                self.pool.discard(lease);
                Err(e.into())
            }
        }
    }
}

#[async_trait]
impl<C: Send + Sync + 'static> Strategy<C> for PairedExclusive {
    async fn start(&self) -> Result<()> {
        self.inner.pool.start()?;
        Ok(())
    }

    async fn shutdown(&self, wait: bool, force: bool) {
        let inner = Arc::clone(&self.inner);
        inner.in_flight.close();
        // Tasks still waiting for a pair fail instead of blocking the drain.
        inner.pool.shutdown(false, force);

        if wait {
            inner.in_flight.wait_idle().await;
            let pool = Arc::clone(&inner.pool);
            if let Err(e) = tokio::task::spawn_blocking(move || pool.shutdown(true, force)).await {
                error!("Pool shutdown failed: {}", e);
            }
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
            let result = inner.run_task(&executable, &args, timeout).await;
            TaskReport { context, result }
        }))
    }
}
