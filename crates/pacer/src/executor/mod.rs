//! Bounded-concurrency executor.
//!
//! Runs at most `max` operations at once. Operations that find no free permit
//! wait in a FIFO queue ordered by `execute` call time, and each one starts as
//! soon as a running operation finishes and hands its permit over:
//! - Success, error, panic and dropped futures all release the permit
//! - Operation outputs (including errors) are returned untouched
//! - A release only signals the next waiter, it never runs it inline

mod pool;

use std::future::Future;

use serde::Serialize;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::error::Result;

pub use pool::{Acquire, Permit, PermitPool, PoolSnapshot};

/// Executor accounting for health endpoints and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExecutorStats {
    pub capacity: usize,
    pub available: usize,
    pub queued: usize,
    pub in_flight: usize,
    pub peak_in_flight: usize,
}

impl ExecutorStats {
    /// All permits held and callers waiting.
    pub fn is_saturated(&self) -> bool {
        self.available == 0 && self.queued > 0
    }
}

impl From<PoolSnapshot> for ExecutorStats {
    fn from(snapshot: PoolSnapshot) -> Self {
        Self {
            capacity: snapshot.capacity,
            available: snapshot.available,
            queued: snapshot.queued,
            in_flight: snapshot.in_flight,
            peak_in_flight: snapshot.peak_in_flight,
        }
    }
}

/// Throttles async operations sharing a resource.
///
/// Cloning shares the same permits and queue.
#[derive(Clone, Debug)]
pub struct BoundedExecutor {
    pool: PermitPool,
}

impl BoundedExecutor {
    /// Create an executor running at most `max` operations concurrently.
    ///
    /// Fails with [`crate::Error::InvalidArgument`] if `max` is zero.
    pub fn new(max: usize) -> Result<Self> {
        let pool = PermitPool::new(max)?;
        tracing::debug!(max, "Bounded executor created");
        Ok(Self { pool })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(config.max_concurrency)
    }

    /// Submit `operation`, returning a future with exactly its output.
    ///
    /// The permit (or queue position) is claimed here, synchronously, so queue
    /// order is call order. `operation` is invoked on the first poll after a
    /// permit is held; use [`BoundedExecutor::spawn`] to drive it eagerly.
    pub fn execute<F, Fut>(&self, operation: F) -> impl Future<Output = Fut::Output> + use<F, Fut>
    where
        F: FnOnce() -> Fut,
        Fut: Future,
    {
        let acquire = self.pool.acquire();
        async move {
            let _permit = acquire.await;
            operation().await
        }
    }

    /// Submit `operation` and drive it on the tokio runtime.
    pub fn spawn<F, Fut>(&self, operation: F) -> JoinHandle<Fut::Output>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future + Send + 'static,
        Fut::Output: Send + 'static,
    {
        tokio::spawn(self.execute(operation))
    }

    pub fn capacity(&self) -> usize {
        self.pool.capacity()
    }

    pub fn available(&self) -> usize {
        self.pool.available()
    }

    pub fn queued(&self) -> usize {
        self.pool.queued()
    }

    pub fn in_flight(&self) -> usize {
        self.pool.in_flight()
    }

    pub fn stats(&self) -> ExecutorStats {
        self.pool.snapshot().into()
    }

    /// The underlying permit pool, for callers that manage permits by hand.
    pub fn pool(&self) -> &PermitPool {
        &self.pool
    }
}
