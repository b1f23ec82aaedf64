//! Fixed-capacity resource pool with background lifecycle workers.
//!
//! Resources travel between four hand-off queues:
//!
//! ```text
//! make ─▶ prepare ─▶ ready ─▶ get() ─▶ checked out ─┬─ put() ─────▶ unready ─▶ prepare ─▶ ready
//!                                                   └─ discard() ─▶ recycle ─▶ destroy + make ─▶ ready
//! after shutdown(): unready | recycle | ready | drain ─▶ destroy
//! ```
//!
//! A resource is in exactly one queue or in the checked-out map at a time.
//! Creation is bounded by `capacity` permits; a permit is held for as long as
//! the resource (or its recycled replacement) exists.

use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::error::PoolError;
use super::lifecycle::{Lifecycle, ShutdownSignal};

/// Upper bound on how long a worker or blocked `get()` waits before re-checking shutdown.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Identity of a pooled resource, unique per `make()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct ResourceId(u64);

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "res-{}", self.0)
    }
}

struct Pooled<R> {
    id: ResourceId,
    resource: Arc<R>,
}

impl<R> Clone for Pooled<R> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            resource: Arc::clone(&self.resource),
        }
    }
}

struct Queue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
}

impl<T> Queue<T> {
    fn bounded(capacity: usize) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        Self { tx, rx }
    }

    /// Never blocks: no more than `capacity` resources exist at once.
    fn push(&self, item: T) {
        // The receiver lives in the same struct, so the channel cannot be disconnected.
        let _ = self.tx.send(item);
    }

    fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        self.rx.recv_timeout(timeout).ok()
    }

    fn try_pop(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    fn len(&self) -> usize {
        self.rx.len()
    }
}

#[derive(Clone, Copy)]
enum Return {
    Reuse,
    Recycle,
}

#[derive(Default)]
struct Counters {
    made: AtomicUsize,
    destroyed: AtomicUsize,
    recycled: AtomicUsize,
}

/// Point-in-time view of a pool's accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PoolStats {
    pub capacity: usize,
    /// Made and not yet destroyed.
    pub live: usize,
    pub made: usize,
    pub destroyed: usize,
    /// Discarded resources rebuilt by a worker.
    pub recycled: usize,
    pub checked_out: usize,
    pub ready: usize,
}

struct Shared<L: Lifecycle> {
    lifecycle: L,
    capacity: usize,
    permits: AtomicUsize,
    /// Destroys still owed; draining workers exit once this reaches zero.
    live: AtomicUsize,
    next_id: AtomicU64,
    unready: Queue<Pooled<L::Resource>>,
    recycle: Queue<Pooled<L::Resource>>,
    ready: Queue<Pooled<L::Resource>>,
    drain: Queue<Pooled<L::Resource>>,
    checked_out: Mutex<HashMap<ResourceId, Pooled<L::Resource>>>,
    shutdown: ShutdownSignal,
    counters: Counters,
}

impl<L: Lifecycle> Shared<L> {
    fn work(&self) {
        while !self.shutdown.is_set() {
            self.service();
        }
        self.drain_until_settled();
    }

    /// One unit of work, cheapest first: re-prepare, then create, then rebuild.
    fn service(&self) {
        if let Some(item) = self.unready.pop_timeout(POLL_INTERVAL) {
            self.prepare_into_ready(item);
            return;
        }

        if !self.shutdown.is_set() && self.try_acquire_permit() {
            if let Some(item) = self.make_fresh() {
                self.prepare_into_ready(item);
                return;
            }
            self.release_permit();
        }

        if let Some(item) = self.recycle.try_pop() {
            debug!(resource = %item.id, "Recycling discarded resource");
            self.destroy(item);
            self.counters.recycled.fetch_add(1, Ordering::SeqCst);
            // The destroyed resource's permit carries over to its replacement.
            let fresh = if self.shutdown.is_set() {
                None
            } else {
                self.make_fresh()
            };
            match fresh {
                Some(fresh) => self.prepare_into_ready(fresh),
                None => self.release_permit(),
            }
        }
    }

    fn drain_until_settled(&self) {
        while self.live.load(Ordering::SeqCst) > 0 {
            match self.pop_any() {
                Some(item) => self.destroy(item),
                None => thread::sleep(POLL_INTERVAL),
            }
        }
    }

    fn pop_any(&self) -> Option<Pooled<L::Resource>> {
        [&self.unready, &self.recycle, &self.ready, &self.drain]
            .into_iter()
            .find_map(Queue::try_pop)
    }

    fn try_acquire_permit(&self) -> bool {
        self.permits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |p| p.checked_sub(1))
            .is_ok()
    }

    fn release_permit(&self) {
        self.permits.fetch_add(1, Ordering::SeqCst);
    }

    fn make_fresh(&self) -> Option<Pooled<L::Resource>> {
        match self.lifecycle.make() {
            Ok(resource) => {
                self.live.fetch_add(1, Ordering::SeqCst);
                self.counters.made.fetch_add(1, Ordering::SeqCst);
                let id = ResourceId(self.next_id.fetch_add(1, Ordering::SeqCst));
                debug!(resource = %id, "Made resource");
                Some(Pooled {
                    id,
                    resource: Arc::new(resource),
                })
            }
            Err(e) => {
                error!(error = %format!("{e:#}"), "Failed to make resource");
                None
            }
        }
    }

    fn prepare_into_ready(&self, item: Pooled<L::Resource>) {
        match self.lifecycle.prepare(&item.resource, &self.shutdown) {
            Ok(()) => {
                debug!(resource = %item.id, "Resource ready");
                self.ready.push(item);
            }
            Err(e) => {
                warn!(resource = %item.id, error = %format!("{e:#}"), "Prepare failed; recycling");
                self.recycle.push(item);
            }
        }
    }

    fn destroy(&self, item: Pooled<L::Resource>) {
        if let Err(e) = self.lifecycle.destroy(&item.resource) {
            error!(resource = %item.id, error = %format!("{e:#}"), "Failed to destroy resource");
        }
        debug!(resource = %item.id, "Destroyed resource");
        self.counters.destroyed.fetch_add(1, Ordering::SeqCst);
        self.live.fetch_sub(1, Ordering::SeqCst);
    }

    fn check_out(&self, item: Pooled<L::Resource>) -> Result<Pooled<L::Resource>, PoolError> {
        let mut checked_out = self.checked_out.lock();
        if self.shutdown.is_set() {
            self.drain.push(item);
            return Err(PoolError::illegal_state("get()"));
        }
        checked_out.insert(item.id, item.clone());
        Ok(item)
    }

    fn check_in(&self, item: Pooled<L::Resource>, how: Return) {
        let mut checked_out = self.checked_out.lock();
        if checked_out.remove(&item.id).is_none() {
            debug!(resource = %item.id, "Lease already reclaimed by forced shutdown");
            return;
        }
        if self.shutdown.is_set() {
            self.drain.push(item);
            return;
        }
        match how {
            Return::Reuse => self.unready.push(item),
            Return::Recycle => self.recycle.push(item),
        }
    }
}

/// A checked-out resource. Hand it back with [`ManagedPool::put`] or
/// [`ManagedPool::discard`]; dropping it unreturned discards it.
pub(crate) struct Lease<L: Lifecycle> {
    item: Pooled<L::Resource>,
    pool: Weak<Shared<L>>,
    settled: bool,
}

impl<L: Lifecycle> Lease<L> {
    pub fn id(&self) -> ResourceId {
        self.item.id
    }

    /// Shared handle to the resource, for borrowers that outlive a single call.
    pub fn share(&self) -> Arc<L::Resource> {
        Arc::clone(&self.item.resource)
    }

    fn settle(&mut self) -> Pooled<L::Resource> {
        self.settled = true;
        self.item.clone()
    }
}

impl<L: Lifecycle> Deref for Lease<L> {
    type Target = L::Resource;

    fn deref(&self) -> &Self::Target {
        &self.item.resource
    }
}

impl<L: Lifecycle> fmt::Debug for Lease<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease").field("id", &self.item.id).finish()
    }
}

impl<L: Lifecycle> Drop for Lease<L> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if let Some(shared) = self.pool.upgrade() {
            warn!(resource = %self.item.id, "Lease dropped without put() or discard(); recycling");
            let item = self.settle();
            shared.check_in(item, Return::Recycle);
        }
    }
}

/// Owns the full lifecycle of up to `capacity` resources built by a [`Lifecycle`].
pub(crate) struct ManagedPool<L: Lifecycle> {
    shared: Arc<Shared<L>>,
    worker_count: usize,
    started: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<L: Lifecycle> ManagedPool<L> {
    /// Creates a pool with one lifecycle worker per resource slot.
    pub fn new(lifecycle: L, capacity: NonZeroUsize) -> Self {
        Self::with_workers(lifecycle, capacity, capacity)
    }

    pub fn with_workers(lifecycle: L, capacity: NonZeroUsize, workers: NonZeroUsize) -> Self {
        let capacity = capacity.get();
        Self {
            shared: Arc::new(Shared {
                lifecycle,
                capacity,
                permits: AtomicUsize::new(capacity),
                live: AtomicUsize::new(0),
                next_id: AtomicU64::new(1),
                unready: Queue::bounded(capacity),
                recycle: Queue::bounded(capacity),
                ready: Queue::bounded(capacity),
                drain: Queue::bounded(capacity),
                checked_out: Mutex::new(HashMap::new()),
                shutdown: ShutdownSignal::new(),
                counters: Counters::default(),
            }),
            worker_count: workers.get(),
            started: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Spawns the background workers. Calling it again is a no-op.
    pub fn start(&self) -> Result<(), PoolError> {
        if self.shared.shutdown.is_set() {
            return Err(PoolError::illegal_state("start()"));
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut workers = self.workers.lock();
        for index in 0..self.worker_count {
            let shared = Arc::clone(&self.shared);
            match thread::Builder::new()
                .name(format!("pool-worker-{index}"))
                .spawn(move || shared.work())
            {
                Ok(handle) => workers.push(handle),
                Err(e) => error!(error = %e, "Failed to spawn pool worker"),
            }
        }

        info!(
            capacity = self.shared.capacity,
            workers = workers.len(),
            "Pool started"
        );
        Ok(())
    }

    /// Checks out a prepared resource, waiting until one is available.
    pub fn get(&self) -> Result<Lease<L>, PoolError> {
        loop {
            if self.shared.shutdown.is_set() {
                return Err(PoolError::illegal_state("get()"));
            }
            if let Some(item) = self.shared.ready.pop_timeout(POLL_INTERVAL) {
                return self.lease(item);
            }
        }
    }

    /// Checks out a prepared resource only if one is available right now.
    #[allow(dead_code)] // Public API for callers
    pub fn try_get(&self) -> Result<Lease<L>, PoolError> {
        if self.shared.shutdown.is_set() {
            return Err(PoolError::illegal_state("try_get()"));
        }
        match self.shared.ready.try_pop() {
            Some(item) => self.lease(item),
            None => Err(PoolError::Empty),
        }
    }

    /// Returns a healthy resource for re-preparation and reuse.
    pub fn put(&self, mut lease: Lease<L>) {
        let item = lease.settle();
        debug!(resource = %item.id, "Resource returned");
        self.shared.check_in(item, Return::Reuse);
    }

    /// Returns a poisoned resource to be destroyed and rebuilt.
    pub fn discard(&self, mut lease: Lease<L>) {
        let item = lease.settle();
        debug!(resource = %item.id, "Resource discarded");
        self.shared.check_in(item, Return::Recycle);
    }

    /// Begins draining the pool.
    ///
    /// With `force`, resources still checked out are destroyed without waiting
    /// for their borrowers, which must tolerate the resource vanishing. With
    /// `wait`, blocks until every resource ever made has been destroyed.
    pub fn shutdown(&self, wait: bool, force: bool) {
        {
            let mut checked_out = self.shared.checked_out.lock();
            if !self.shared.shutdown.is_set() {
                info!(force, "Pool shutting down");
            }
            self.shared.shutdown.set();
            if force {
                for (id, item) in checked_out.drain() {
                    warn!(resource = %id, "Forcibly reclaiming checked-out resource");
                    self.shared.drain.push(item);
                }
            }
        }

        if wait {
            let handles = std::mem::take(&mut *self.workers.lock());
            for handle in handles {
                if handle.join().is_err() {
                    error!("Pool worker panicked");
                }
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        let shared = &self.shared;
        PoolStats {
            capacity: shared.capacity,
            live: shared.live.load(Ordering::SeqCst),
            made: shared.counters.made.load(Ordering::SeqCst),
            destroyed: shared.counters.destroyed.load(Ordering::SeqCst),
            recycled: shared.counters.recycled.load(Ordering::SeqCst),
            checked_out: shared.checked_out.lock().len(),
            ready: shared.ready.len(),
        }
    }

    fn lease(&self, item: Pooled<L::Resource>) -> Result<Lease<L>, PoolError> {
        let item = self.shared.check_out(item)?;
        debug!(resource = %item.id, "Resource checked out");
        Ok(Lease {
            item,
            pool: Arc::downgrade(&self.shared),
            settled: false,
        })
    }
}

impl<L: Lifecycle> Drop for ManagedPool<L> {
    fn drop(&mut self) {
        if self.started.load(Ordering::SeqCst) {
            self.shutdown(true, true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{bail, Result};
    use std::collections::HashSet;
    use std::time::Instant;

    #[derive(Default)]
    struct Tracker {
        made: AtomicUsize,
        destroyed: AtomicUsize,
        alive: AtomicUsize,
        peak_alive: AtomicUsize,
        prepared: AtomicUsize,
        make_failures_left: AtomicUsize,
        hold_prepare_until_shutdown: AtomicBool,
    }

    struct Counting(Arc<Tracker>);

    impl Lifecycle for Counting {
        type Resource = usize;

        fn make(&self) -> Result<usize> {
            let t = &self.0;
            if t.make_failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                bail!("simulated make failure");
            }
            let serial = t.made.fetch_add(1, Ordering::SeqCst) + 1;
            let alive = t.alive.fetch_add(1, Ordering::SeqCst) + 1;
            t.peak_alive.fetch_max(alive, Ordering::SeqCst);
            Ok(serial)
        }

        fn prepare(&self, _resource: &usize, shutdown: &ShutdownSignal) -> Result<()> {
            self.0.prepared.fetch_add(1, Ordering::SeqCst);
            if self.0.hold_prepare_until_shutdown.load(Ordering::SeqCst) {
                while !shutdown.is_set() {
                    thread::sleep(Duration::from_millis(10));
                }
                bail!("interrupted by shutdown");
            }
            Ok(())
        }

        fn destroy(&self, _resource: &usize) -> Result<()> {
            self.0.alive.fetch_sub(1, Ordering::SeqCst);
            self.0.destroyed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn pool(capacity: usize) -> (ManagedPool<Counting>, Arc<Tracker>) {
        let tracker = Arc::new(Tracker::default());
        let pool = ManagedPool::new(
            Counting(Arc::clone(&tracker)),
            NonZeroUsize::new(capacity).unwrap(),
        );
        (pool, tracker)
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_put_returns_resource_for_reuse() {
        let (pool, tracker) = pool(1);
        pool.start().unwrap();

        let lease = pool.get().unwrap();
        let first = *lease;
        pool.put(lease);

        let lease = pool.get().unwrap();
        assert_eq!(*lease, first);
        assert_eq!(tracker.made.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.prepared.load(Ordering::SeqCst), 2);
        pool.put(lease);

        pool.shutdown(true, false);
        assert_eq!(tracker.destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().live, 0);
    }

    #[test]
    fn test_try_get_on_unstarted_pool_is_empty() {
        let (pool, _tracker) = pool(2);
        assert_eq!(pool.try_get().unwrap_err(), PoolError::Empty);
    }

    #[test]
    fn test_get_after_shutdown_is_illegal() {
        let (pool, tracker) = pool(2);
        pool.start().unwrap();
        wait_until(|| pool.stats().ready == 2);

        pool.shutdown(true, false);

        assert!(pool.get().unwrap_err().is_illegal_state());
        assert!(pool.try_get().unwrap_err().is_illegal_state());
        assert!(pool.start().unwrap_err().is_illegal_state());
        assert_eq!(
            tracker.made.load(Ordering::SeqCst),
            tracker.destroyed.load(Ordering::SeqCst)
        );
        assert_eq!(pool.stats().live, 0);
    }

    #[test]
    fn test_discard_rebuilds_without_new_permit() {
        let (pool, tracker) = pool(1);
        pool.start().unwrap();

        let lease = pool.get().unwrap();
        let poisoned = *lease;
        pool.discard(lease);

        let lease = pool.get().unwrap();
        assert_ne!(*lease, poisoned);
        let stats = pool.stats();
        assert_eq!(stats.recycled, 1);
        assert_eq!(stats.made, 2);
        assert_eq!(stats.destroyed, 1);
        assert_eq!(tracker.peak_alive.load(Ordering::SeqCst), 1);
        pool.put(lease);

        pool.shutdown(true, false);
        assert_eq!(tracker.made.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.destroyed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_concurrent_borrowers_respect_capacity_and_conservation() {
        let (pool, tracker) = pool(3);
        let pool = Arc::new(pool);
        pool.start().unwrap();
        let held = Arc::new(Mutex::new(HashSet::new()));

        let borrowers: Vec<_> = (0..8)
            .map(|t| {
                let pool = Arc::clone(&pool);
                let held = Arc::clone(&held);
                thread::spawn(move || {
                    for i in 0..10 {
                        let lease = pool.get().unwrap();
                        assert!(held.lock().insert(lease.id()), "resource lent twice");
                        thread::sleep(Duration::from_millis(1));
                        held.lock().remove(&lease.id());
                        if (t + i) % 3 == 0 {
                            pool.discard(lease);
                        } else {
                            pool.put(lease);
                        }
                    }
                })
            })
            .collect();
        for borrower in borrowers {
            borrower.join().unwrap();
        }

        pool.shutdown(true, false);

        assert!(tracker.peak_alive.load(Ordering::SeqCst) <= 3);
        assert_eq!(
            tracker.made.load(Ordering::SeqCst),
            tracker.destroyed.load(Ordering::SeqCst)
        );
        let stats = pool.stats();
        assert_eq!(stats.live, 0);
        assert_eq!(stats.checked_out, 0);
        assert!(stats.recycled > 0);
    }

    #[test]
    fn test_forced_shutdown_destroys_checked_out_resources() {
        let (pool, tracker) = pool(2);
        pool.start().unwrap();
        let a = pool.get().unwrap();
        let b = pool.get().unwrap();

        pool.shutdown(true, true);
        assert_eq!(tracker.made.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.destroyed.load(Ordering::SeqCst), 2);

        // Late returns from the borrower must not destroy anything twice.
        pool.put(a);
        pool.discard(b);
        assert_eq!(tracker.destroyed.load(Ordering::SeqCst), 2);
        assert_eq!(pool.stats().live, 0);
    }

    #[test]
    fn test_graceful_shutdown_waits_for_returned_lease() {
        let (pool, tracker) = pool(1);
        let pool = Arc::new(pool);
        pool.start().unwrap();
        let lease = pool.get().unwrap();

        let returner = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(200));
                pool.put(lease);
            })
        };
        pool.shutdown(true, false);
        returner.join().unwrap();

        assert_eq!(tracker.destroyed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_make_failure_does_not_stop_worker() {
        let tracker = Arc::new(Tracker::default());
        tracker.make_failures_left.store(2, Ordering::SeqCst);
        let pool = ManagedPool::with_workers(
            Counting(Arc::clone(&tracker)),
            NonZeroUsize::new(1).unwrap(),
            NonZeroUsize::new(1).unwrap(),
        );
        pool.start().unwrap();

        let lease = pool.get().unwrap();
        assert_eq!(*lease, 1);
        pool.put(lease);

        pool.shutdown(true, false);
        assert_eq!(tracker.made.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.destroyed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_prepare_is_interrupted_by_shutdown() {
        let (pool, tracker) = pool(1);
        tracker
            .hold_prepare_until_shutdown
            .store(true, Ordering::SeqCst);
        pool.start().unwrap();
        wait_until(|| tracker.prepared.load(Ordering::SeqCst) == 1);

        pool.shutdown(true, false);

        assert_eq!(tracker.made.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.destroyed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dropped_lease_is_recycled() {
        let (pool, tracker) = pool(1);
        pool.start().unwrap();

        drop(pool.get().unwrap());
        let lease = pool.get().unwrap();
        assert_eq!(*lease, 2);
        assert_eq!(pool.stats().recycled, 1);
        pool.put(lease);

        pool.shutdown(true, false);
        assert_eq!(tracker.destroyed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_start_is_idempotent() {
        let (pool, tracker) = pool(1);
        pool.start().unwrap();
        pool.start().unwrap();
        wait_until(|| pool.stats().ready == 1);

        pool.shutdown(true, false);
        assert_eq!(tracker.made.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_resource_id_display() {
        assert_eq!(ResourceId(7).to_string(), "res-7");
    }
}
