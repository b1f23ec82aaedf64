//! Execution strategies built on the managed pool.
//!
//! A [`Strategy`] accepts tasks and runs them concurrently in pooled
//! environments. [`SharedEnvironment`] runs every task in one long-lived
//! environment, isolating tasks by working directory. [`PairedExclusive`]
//! gives each task its own primary/companion pair.

mod paired;
mod shared;
mod staging;

pub(crate) use paired::{PairSettings, PairedExclusive};
pub(crate) use shared::{ArtifactPath, SharedEnvironment, SharedSettings};

use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::pool::PoolError;
use crate::sandbox::SandboxError;

/// How a task that reached the sandbox ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Completion {
    /// The task exited with a definite status.
    Exited {
        exit_code: i64,
        output: String,
        /// Where the task's artifact was moved, if it produced one.
        artifact: Option<PathBuf>,
    },
    /// No exit status was observed before the deadline. No output exists.
    TimedOut,
}

/// Failures that prevent a task from producing a [`Completion`].
#[derive(Debug, thiserror::Error)]
pub(crate) enum TaskError {
    /// More than one artifact appeared where at most one was expected.
    #[error("{command} produced more than one artifact ({count})")]
    AmbiguousArtifact {
        command: String,
        count: usize,
        output: String,
    },

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    /// Preparing the task's working directory or moving its artifact failed.
    #[error("Staging failed: {0}")]
    Staging(#[from] std::io::Error),
}

impl TaskError {
    /// Output captured before the failure, if any.
    pub fn output(&self) -> Option<&str> {
        match self {
            Self::AmbiguousArtifact { output, .. } => Some(output),
            _ => None,
        }
    }
}

/// Terminal outcome of one submitted task.
#[derive(Debug)]
pub(crate) struct TaskReport<C> {
    pub context: C,
    pub result: Result<Completion, TaskError>,
}

/// Runs submitted tasks in pooled environments.
#[async_trait]
pub(crate) trait Strategy<C: Send + Sync + 'static>: Send + Sync {
    /// Starts the pool and whatever the strategy holds for its lifetime.
    async fn start(&self) -> anyhow::Result<()>;

    /// Stops accepting tasks and releases every environment.
    ///
    /// With `wait`, returns only after in-flight tasks finished and every
    /// environment was destroyed. With `force`, environments in use are
    /// destroyed underneath their tasks.
    async fn shutdown(&self, wait: bool, force: bool);

    /// Schedules `executable args` with an optional deadline.
    ///
    /// Fails with [`PoolError::IllegalState`] after shutdown.
    fn submit(
        &self,
        context: C,
        executable: PathBuf,
        args: Vec<String>,
        timeout: Option<Duration>,
    ) -> Result<JoinHandle<TaskReport<C>>, PoolError>;
}

/// Tracks tasks that were accepted but have not finished.
///
/// Each task holds a clone of the sender. Closing drops the original, so the
/// receiver yields `None` once the last task is gone.
pub(crate) struct InFlight {
    tx: Mutex<Option<mpsc::Sender<()>>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<()>>,
}

/// Held by a running task.
pub(crate) struct InFlightGuard(#[allow(dead_code)] mpsc::Sender<()>);

impl InFlight {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    /// Registers a task, or `None` once closed.
    pub fn enter(&self) -> Option<InFlightGuard> {
        self.tx.lock().clone().map(InFlightGuard)
    }

    /// Refuses new tasks. Returns false if already closed.
    pub fn close(&self) -> bool {
        self.tx.lock().take().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.lock().is_none()
    }

    /// Waits for every registered task to finish. Only meaningful after `close`.
    pub async fn wait_idle(&self) {
        let mut rx = self.rx.lock().await;
        while rx.recv().await.is_some() {}
    }
}
