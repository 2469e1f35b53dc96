//! Turning sandbox results into host values.
//!
//! Each kind of [`Remote`] has exactly one extraction strategy: copied data
//! is returned as-is, functions become [`Callable`]s, and aggregates are
//! copied structurally in a single round-trip.

use std::fmt;

use crate::{
    sandbox::{LazyRef, Remote, Result},
    value::Value,
};

/// A sandbox function usable from the host.
///
/// Calling it copies the arguments in and dereferences the result, so a
/// function returning `{ nested: fn }` yields an object holding another
/// `Callable`.
#[derive(Clone)]
pub struct Callable(LazyRef);

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Callable").field(&self.0).finish()
    }
}

impl From<LazyRef> for Callable {
    fn from(reference: LazyRef) -> Self {
        Self(reference)
    }
}

impl Callable {
    /// # Errors
    /// Fails with the sandbox error of the call, or
    /// [`ExecutionError::Disposed`](crate::sandbox::ExecutionError::Disposed)
    /// once the owning context is gone.
    pub async fn call(&self, args: Vec<Value>) -> Result<Value> {
        deref(self.0.call(args).await?).await
    }

    #[must_use]
    pub const fn reference(&self) -> &LazyRef {
        &self.0
    }

    /// Whether both callables refer to the same sandbox function handle.
    #[must_use]
    pub fn same(&self, other: &Self) -> bool {
        self.0.same(&other.0)
    }
}

/// Produce a host value from a sandbox result.
///
/// Host values pass through untouched, which makes dereferencing
/// idempotent. Cycles inside sandbox aggregates are cut with `null`.
///
/// # Errors
/// Fails if the owning context was disposed or copying an aggregate threw.
pub async fn deref(remote: impl Into<Remote>) -> Result<Value> {
    match remote.into() {
        Remote::Copied(value) => Ok(value),
        Remote::Function(reference) => Ok(Value::Function(Callable(reference))),
        Remote::Aggregate(reference) => reference.snapshot().await,
    }
}
