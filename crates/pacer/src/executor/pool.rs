//! Permit pool with a strict FIFO queue of waiters.
//!
//! A queue position is taken when [`PermitPool::acquire`] is *called*, not when
//! the returned future is first polled. A released permit goes straight to the
//! head of the queue; the available count only grows when nobody is waiting.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::error::{Error, Result};

struct Waiter {
    ticket: u64,
    grant: oneshot::Sender<()>,
}

struct PoolState {
    capacity: usize,
    available: usize,
    queue: VecDeque<Waiter>,
    next_ticket: u64,
    peak_in_flight: usize,
}

impl PoolState {
    fn in_flight(&self) -> usize {
        self.capacity - self.available
    }

    fn take(&mut self) {
        self.available -= 1;
        self.peak_in_flight = self.peak_in_flight.max(self.in_flight());
    }

    /// Return one permit: hand it to the head waiter, or back to the pool.
    ///
    /// Only signals the waiter. Nothing the waiter runs executes under the
    /// pool lock, so a release can never re-enter another release.
    fn release(&mut self) {
        while let Some(waiter) = self.queue.pop_front() {
            if waiter.grant.send(()).is_ok() {
                tracing::trace!(
                    ticket = waiter.ticket,
                    queued = self.queue.len(),
                    "Permit handed to queued waiter"
                );
                return;
            }
        }

        debug_assert!(self.available < self.capacity, "permit released twice");
        self.available = (self.available + 1).min(self.capacity);
        tracing::trace!(available = self.available, "Permit returned to pool");
    }
}

struct PoolShared {
    state: Mutex<PoolState>,
}

impl PoolShared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        // No user code ever runs under this lock, so a poisoned guard still
        // holds consistent counts.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Point-in-time view of a pool's accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub capacity: usize,
    pub available: usize,
    pub queued: usize,
    pub in_flight: usize,
    pub peak_in_flight: usize,
}

/// A fixed-capacity pool of permits.
///
/// Cloning shares the same pool.
#[derive(Clone)]
pub struct PermitPool {
    shared: Arc<PoolShared>,
}

impl PermitPool {
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::invalid("max", "capacity must be at least 1"));
        }

        Ok(Self {
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState {
                    capacity,
                    available: capacity,
                    queue: VecDeque::new(),
                    next_ticket: 0,
                    peak_in_flight: 0,
                }),
            }),
        })
    }

    /// Take a permit if one is free right now.
    ///
    /// Free permits only exist while the queue is empty, so this never
    /// overtakes a queued waiter.
    pub fn try_acquire(&self) -> Option<Permit> {
        let mut state = self.shared.lock();
        if state.available == 0 {
            return None;
        }
        state.take();
        Some(Permit {
            shared: Arc::clone(&self.shared),
        })
    }

    /// Reserve a permit, or a place in the queue, at call time.
    ///
    /// The returned future resolves once the permit is held. Dropping it
    /// before then gives up the queue position; dropping it after the grant
    /// but before it was observed passes the permit on.
    pub fn acquire(&self) -> Acquire {
        let mut state = self.shared.lock();
        if state.available > 0 {
            state.take();
            return Acquire {
                shared: Arc::clone(&self.shared),
                state: AcquireState::Granted(Permit {
                    shared: Arc::clone(&self.shared),
                }),
            };
        }

        let (grant, rx) = oneshot::channel();
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.queue.push_back(Waiter { ticket, grant });
        tracing::debug!(
            ticket,
            queued = state.queue.len(),
            "No permits available - waiter queued"
        );

        Acquire {
            shared: Arc::clone(&self.shared),
            state: AcquireState::Waiting { ticket, rx },
        }
    }

    pub fn capacity(&self) -> usize {
        self.shared.lock().capacity
    }

    pub fn available(&self) -> usize {
        self.shared.lock().available
    }

    pub fn queued(&self) -> usize {
        self.shared.lock().queue.len()
    }

    /// Permits currently held, including granted-but-not-yet-polled ones.
    pub fn in_flight(&self) -> usize {
        self.shared.lock().in_flight()
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let state = self.shared.lock();
        PoolSnapshot {
            capacity: state.capacity,
            available: state.available,
            queued: state.queue.len(),
            in_flight: state.in_flight(),
            peak_in_flight: state.peak_in_flight,
        }
    }
}

impl std::fmt::Debug for PermitPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("PermitPool")
            .field("capacity", &snapshot.capacity)
            .field("available", &snapshot.available)
            .field("queued", &snapshot.queued)
            .finish()
    }
}

/// A held permit. Returns to the pool (or to the next waiter) on drop.
#[must_use = "dropping a permit releases it immediately"]
pub struct Permit {
    shared: Arc<PoolShared>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.shared.lock().release();
    }
}

impl std::fmt::Debug for Permit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Permit").finish_non_exhaustive()
    }
}

enum AcquireState {
    Granted(Permit),
    Waiting {
        ticket: u64,
        rx: oneshot::Receiver<()>,
    },
    Done,
}

/// Future returned by [`PermitPool::acquire`].
#[must_use = "futures do nothing unless polled"]
pub struct Acquire {
    shared: Arc<PoolShared>,
    state: AcquireState,
}

impl Acquire {
    /// True if the permit was free at call time and no queueing happened.
    pub fn is_immediate(&self) -> bool {
        matches!(self.state, AcquireState::Granted(_))
    }
}

impl Future for Acquire {
    type Output = Permit;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Permit> {
        let this = &mut *self;
        match std::mem::replace(&mut this.state, AcquireState::Done) {
            AcquireState::Granted(permit) => Poll::Ready(permit),
            AcquireState::Waiting { ticket, mut rx } => match Pin::new(&mut rx).poll(cx) {
                Poll::Ready(Ok(())) => Poll::Ready(Permit {
                    shared: Arc::clone(&this.shared),
                }),
                // Senders leave the queue only by granting or when this future
                // removes itself in Drop.
                Poll::Ready(Err(_)) => unreachable!("waiter dropped from queue without a grant"),
                Poll::Pending => {
                    this.state = AcquireState::Waiting { ticket, rx };
                    Poll::Pending
                }
            },
            AcquireState::Done => panic!("Acquire polled after completion"),
        }
    }
}

impl Drop for Acquire {
    fn drop(&mut self) {
        let AcquireState::Waiting { ticket, .. } = self.state else {
            return;
        };

        let mut state = self.shared.lock();
        if let Some(pos) = state.queue.iter().position(|w| w.ticket == ticket) {
            state.queue.remove(pos);
            tracing::debug!(ticket, "Queued waiter dropped before grant");
        } else {
            // Grant was sent but never observed.
            tracing::debug!(ticket, "Granted waiter dropped before use - passing permit on");
            state.release();
        }
    }
}
