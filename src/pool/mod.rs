//! Managed pool of expensive, recyclable resources.
//!
//! The pool owns creation, preparation, reuse, recycling and final draining
//! of a bounded set of resources. What a resource is, and how to build and
//! tear it down, is supplied through the [`Lifecycle`] trait.

mod error;
mod lifecycle;
mod managed;

pub(crate) use error::PoolError;
pub(crate) use lifecycle::{Lifecycle, ShutdownSignal};
pub(crate) use managed::{Lease, ManagedPool, PoolStats};
