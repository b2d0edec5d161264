//! Observable value cells.
//!
//! A cell holds one value and notifies subscribers whenever it changes:
//! - `subscribe` calls back immediately with the current value, then on change
//! - `set` is a no-op when the new value equals the current one
//! - `map`/`combine` build derived cells that recompute on every upstream change
//!
//! Callbacks run outside all locks, so they may read or write cells freely.
//! A `set` made from inside a callback is queued behind the notifications
//! already in flight, so every subscriber sees changes in order and ends on
//! the latest value. Async consumers can use [`ObservableCell::watch`] instead
//! of callbacks.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::watch;

use crate::subscription::{Subscription, SubscriptionId};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct CellInner<T> {
    value: watch::Sender<T>,
    subscribers: Mutex<Vec<(SubscriptionId, Callback<T>)>>,
    /// Subscriptions a derived cell holds on its sources.
    upstream: Mutex<Vec<Subscription>>,
    pending: Mutex<Pending<T>>,
}

/// Notifications waiting for delivery. Only the call that set `draining`
/// delivers; nested and concurrent `set`s just enqueue.
struct Pending<T> {
    queue: VecDeque<(Callback<T>, T)>,
    draining: bool,
}

/// Clears the drain state if a callback panics, so later sets still notify.
struct DrainGuard<'a, T> {
    pending: &'a Mutex<Pending<T>>,
}

impl<T> Drop for DrainGuard<'_, T> {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            return;
        }
        let mut pending = lock(self.pending);
        pending.queue.clear();
        pending.draining = false;
    }
}

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared observable value. Cloning shares the same cell.
pub struct ObservableCell<T> {
    inner: Arc<CellInner<T>>,
}

impl<T> Clone for ObservableCell<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Default + Clone + PartialEq + Send + Sync + 'static> Default for ObservableCell<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> ObservableCell<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(CellInner {
                value: watch::Sender::new(value),
                subscribers: Mutex::new(Vec::new()),
                upstream: Mutex::new(Vec::new()),
                pending: Mutex::new(Pending {
                    queue: VecDeque::new(),
                    draining: false,
                }),
            }),
        }
    }

    pub fn get(&self) -> T {
        self.inner.value.borrow().clone()
    }

    /// Replace the value, notifying subscribers if it changed.
    pub fn set(&self, value: T) {
        let changed = self.inner.value.send_if_modified(|current| {
            if *current == value {
                false
            } else {
                *current = value.clone();
                true
            }
        });

        if changed {
            self.notify(value);
        }
    }

    /// Set the value computed from the current one.
    ///
    /// Read and write are two steps; concurrent writers may interleave.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&T) -> T,
    {
        let next = f(&self.get());
        self.set(next);
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = SubscriptionId::new();
        let callback: Callback<T> = Arc::new(callback);
        lock(&self.inner.subscribers).push((id, Arc::clone(&callback)));

        callback(&self.get());

        let cell: Weak<CellInner<T>> = Arc::downgrade(&self.inner);
        Subscription::new(id, move || {
            if let Some(inner) = cell.upgrade() {
                lock(&inner.subscribers).retain(|(sub_id, _)| *sub_id != id);
            }
        })
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner.subscribers).len()
    }

    /// Receiver that observes every change, for use from async code.
    pub fn watch(&self) -> watch::Receiver<T> {
        self.inner.value.subscribe()
    }

    /// Derived cell holding `f(value)`, recomputed whenever this cell changes.
    ///
    /// The derived cell does not keep this cell alive; it stops updating once
    /// every handle to this cell is gone.
    pub fn map<U, F>(&self, f: F) -> ObservableCell<U>
    where
        U: Clone + PartialEq + Send + Sync + 'static,
        F: Fn(&T) -> U + Send + Sync + 'static,
    {
        let derived = ObservableCell::new(f(&self.get()));
        let target = Arc::downgrade(&derived.inner);

        let sub = self.subscribe(move |value| {
            if let Some(inner) = target.upgrade() {
                ObservableCell { inner }.set(f(value));
            }
        });
        derived.hold(sub);
        derived
    }

    /// Derived cell holding `f(a, b)`, recomputed when either source changes.
    pub fn combine<B, U, F>(a: &ObservableCell<T>, b: &ObservableCell<B>, f: F) -> ObservableCell<U>
    where
        B: Clone + PartialEq + Send + Sync + 'static,
        U: Clone + PartialEq + Send + Sync + 'static,
        F: Fn(&T, &B) -> U + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let derived = ObservableCell::new(f(&a.get(), &b.get()));

        // Weak handles only: each source's callback reads the other source,
        // and strong ones would keep both sources alive forever.
        let sub_a = {
            let target = Arc::downgrade(&derived.inner);
            let other = Arc::downgrade(&b.inner);
            let f = Arc::clone(&f);
            a.subscribe(move |value| {
                if let (Some(inner), Some(other)) = (target.upgrade(), other.upgrade()) {
                    let other = other.value.borrow().clone();
                    ObservableCell { inner }.set(f(value, &other));
                }
            })
        };
        let sub_b = {
            let target = Arc::downgrade(&derived.inner);
            let other = Arc::downgrade(&a.inner);
            b.subscribe(move |value| {
                if let (Some(inner), Some(other)) = (target.upgrade(), other.upgrade()) {
                    let other = other.value.borrow().clone();
                    ObservableCell { inner }.set(f(&other, value));
                }
            })
        };

        derived.hold(sub_a);
        derived.hold(sub_b);
        derived
    }

    fn hold(&self, subscription: Subscription) {
        lock(&self.inner.upstream).push(subscription);
    }

    fn notify(&self, value: T) {
        {
            let subscribers = lock(&self.inner.subscribers);
            let mut pending = lock(&self.inner.pending);
            pending.queue.extend(
                subscribers
                    .iter()
                    .map(|(_, cb)| (Arc::clone(cb), value.clone())),
            );
            if pending.draining {
                return;
            }
            pending.draining = true;
        }

        let _guard = DrainGuard {
            pending: &self.inner.pending,
        };
        loop {
            let next = {
                let mut pending = lock(&self.inner.pending);
                let next = pending.queue.pop_front();
                if next.is_none() {
                    pending.draining = false;
                }
                next
            };
            match next {
                Some((callback, value)) => callback(&value),
                None => break,
            }
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for ObservableCell<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObservableCell")
            .field("value", &*self.inner.value.borrow())
            .finish_non_exhaustive()
    }
}
