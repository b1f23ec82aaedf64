//! Domain-specific error types for pool operations.

/// Errors returned by [`ManagedPool`](super::ManagedPool) check-out and lifecycle calls.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    /// A non-blocking check-out found no prepared resource.
    #[error("No prepared resource is available in the pool")]
    Empty,

    /// The operation is not valid once shutdown has begun.
    #[error("Illegal pool state: {operation} called after shutdown()")]
    IllegalState { operation: &'static str },
}

impl PoolError {
    /// Creates an `IllegalState` error for the named operation.
    pub fn illegal_state(operation: &'static str) -> Self {
        Self::IllegalState { operation }
    }

    /// Returns true if this is an `Empty` error.
    #[allow(dead_code)] // Public API for callers
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// Returns true if this is an `IllegalState` error.
    #[allow(dead_code)] // Public API for callers
    pub fn is_illegal_state(&self) -> bool {
        matches!(self, Self::IllegalState { .. })
    }
}
