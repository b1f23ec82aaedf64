//! Resource lifecycle hooks supplied to a [`ManagedPool`](super::ManagedPool).

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// How a pool creates, readies and releases one kind of resource.
///
/// Hooks are only ever called from the pool's background workers. Every
/// successful `make()` is eventually matched by exactly one `destroy()`.
pub(crate) trait Lifecycle: Send + Sync + 'static {
    /// The pooled resource.
    type Resource: Send + Sync + 'static;

    /// Constructs a new, unprepared resource. May be slow.
    fn make(&self) -> Result<Self::Resource>;

    /// Readies a freshly made or just returned resource for the next borrower.
    ///
    /// Must be safe to call repeatedly on the same resource. Long waits should
    /// poll `shutdown` and give up once it is set.
    fn prepare(&self, _resource: &Self::Resource, _shutdown: &ShutdownSignal) -> Result<()> {
        Ok(())
    }

    /// Releases a resource for good.
    fn destroy(&self, resource: &Self::Resource) -> Result<()>;
}

/// One-way flag raised when a pool begins shutting down.
#[derive(Debug, Clone, Default)]
pub(crate) struct ShutdownSignal(Arc<AtomicBool>);

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
