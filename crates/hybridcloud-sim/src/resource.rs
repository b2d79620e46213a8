//! Capacity pools with blocking acquisition.
//!
//! A [`Pool`] is a counter of interchangeable units. `acquire` suspends the
//! caller until enough units are free; `release` returns them. Waiters are
//! served strictly in priority-then-arrival order: when the head of the
//! queue cannot be satisfied, nobody behind it is served either, so a large
//! request is never starved by a stream of small ones.
//!
//! Grants are not handed out inside `acquire` or `release`. Both schedule a
//! zero-delay dispatch on the clock instead, which lets every request made at
//! the same instant enter the queue before any of them is served. That is
//! what makes priority meaningful for simultaneous arrivals.

use std::cell::{Cell, RefCell};
use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use futures::future::{Either, select};
use tracing::trace;

use crate::clock::{Env, SimTime, WeakEnv};
use crate::error::{SimError, SimResult};
use crate::job::Priority;

/// Queue position: higher priority first, then FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct WaitKey {
    priority: Reverse<Priority>,
    seq: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestState {
    Waiting,
    Granted,
    Taken,
    Failed,
}

struct Request {
    amount: u64,
    state: Cell<RequestState>,
    waker: RefCell<Option<Waker>>,
}

impl Request {
    fn resolve(&self, state: RequestState) {
        self.state.set(state);
        if let Some(w) = self.waker.borrow_mut().take() {
            w.wake();
        }
    }
}

struct PoolState {
    level: u64,
    peak_in_use: u64,
    waiters: BTreeMap<WaitKey, Rc<Request>>,
    next_seq: u64,
    closed: bool,
    dispatch_pending: bool,
}

struct PoolInner {
    name: String,
    capacity: u64,
    env: WeakEnv,
    state: RefCell<PoolState>,
}

/// A capacity counter bound to one simulation clock.
#[derive(Clone)]
pub struct Pool {
    inner: Rc<PoolInner>,
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.inner.name)
            .field("capacity", &self.inner.capacity)
            .field("available", &self.available())
            .field("waiting", &self.waiting())
            .finish()
    }
}

impl Pool {
    /// Create a full pool of `capacity` units.
    pub fn new(env: &Env, name: impl Into<String>, capacity: u64) -> Self {
        Self {
            inner: Rc::new(PoolInner {
                name: name.into(),
                capacity,
                env: env.downgrade(),
                state: RefCell::new(PoolState {
                    level: capacity,
                    peak_in_use: 0,
                    waiters: BTreeMap::new(),
                    next_seq: 0,
                    closed: false,
                    dispatch_pending: false,
                }),
            }),
        }
    }

    /// Pool name, used in logs and errors.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Declared capacity.
    pub fn capacity(&self) -> u64 {
        self.inner.capacity
    }

    /// Units currently free.
    pub fn available(&self) -> u64 {
        self.inner.state.borrow().level
    }

    /// Units currently held by granted requests.
    pub fn in_use(&self) -> u64 {
        self.inner.capacity - self.available()
    }

    /// Highest number of units held at once so far.
    pub fn peak_in_use(&self) -> u64 {
        self.inner.state.borrow().peak_in_use
    }

    /// Number of suspended requests.
    pub fn waiting(&self) -> usize {
        self.inner.state.borrow().waiters.len()
    }

    /// Total units requested by suspended requests.
    pub fn queued_units(&self) -> u64 {
        self.inner
            .state
            .borrow()
            .waiters
            .values()
            .map(|r| r.amount)
            .sum()
    }

    /// Whether [`Pool::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.state.borrow().closed
    }

    /// Request `amount` units. The returned future resolves once they are
    /// granted, or with an error if the pool is (or becomes) closed.
    pub fn acquire(&self, amount: u64, priority: Priority) -> Acquire {
        let request = Rc::new(Request {
            amount,
            state: Cell::new(RequestState::Waiting),
            waker: RefCell::new(None),
        });
        let mut acquire = Acquire {
            pool: self.clone(),
            key: None,
            request,
            error: None,
        };

        if amount > self.inner.capacity {
            acquire.error = Some(SimError::ExceedsCapacity {
                pool: self.inner.name.clone(),
                requested: amount,
                capacity: self.inner.capacity,
            });
            return acquire;
        }

        let mut st = self.inner.state.borrow_mut();
        if st.closed {
            acquire.error = Some(SimError::ResourceClosed(self.inner.name.clone()));
            return acquire;
        }
        if amount == 0 {
            acquire.request.state.set(RequestState::Granted);
            return acquire;
        }

        let key = WaitKey {
            priority: Reverse(priority),
            seq: st.next_seq,
        };
        st.next_seq += 1;
        st.waiters.insert(key, Rc::clone(&acquire.request));
        drop(st);

        acquire.key = Some(key);
        trace!(pool = %self.inner.name, amount, priority = priority.value(), "acquire queued");
        self.schedule_dispatch();
        acquire
    }

    /// Like [`Pool::acquire`], but give up after `timeout` time units.
    ///
    /// Returns `Ok(None)` when the timer wins. The losing request is withdrawn
    /// from the queue, and a grant that landed in the same instant is handed
    /// back, so a timed-out caller never holds units.
    pub async fn acquire_within(
        &self,
        amount: u64,
        priority: Priority,
        timeout: SimTime,
    ) -> SimResult<Option<u64>> {
        let env = self.inner.env.upgrade()?;
        let timer = env.timeout(timeout)?;
        let acquire = self.acquire(amount, priority);

        match select(acquire, timer).await {
            Either::Left((granted, _timer)) => granted.map(Some),
            Either::Right(((), pending)) => {
                drop(pending);
                trace!(pool = %self.inner.name, amount, "acquire timed out");
                Ok(None)
            }
        }
    }

    /// Return `amount` units to the pool.
    ///
    /// Fails only if it would push the free count above capacity, which
    /// means the caller is returning units it never held.
    pub fn release(&self, amount: u64) -> SimResult<()> {
        {
            let mut st = self.inner.state.borrow_mut();
            let in_use = self.inner.capacity - st.level;
            if amount > in_use {
                return Err(SimError::OverRelease {
                    pool: self.inner.name.clone(),
                    amount,
                    in_use,
                });
            }
            st.level += amount;
        }
        trace!(pool = %self.inner.name, amount, "released");
        self.schedule_dispatch();
        Ok(())
    }

    /// Close the pool: every suspended and future request fails.
    ///
    /// Units already granted stay granted and may still be released.
    pub fn close(&self) {
        let failed: Vec<Rc<Request>> = {
            let mut st = self.inner.state.borrow_mut();
            st.closed = true;
            std::mem::take(&mut st.waiters).into_values().collect()
        };
        for request in failed {
            request.resolve(RequestState::Failed);
        }
    }

    fn schedule_dispatch(&self) {
        {
            let mut st = self.inner.state.borrow_mut();
            if st.dispatch_pending {
                return;
            }
            st.dispatch_pending = true;
        }

        match self.inner.env.upgrade() {
            Ok(env) => {
                let weak = Rc::downgrade(&self.inner);
                env.defer(move || {
                    if let Some(inner) = weak.upgrade() {
                        Pool { inner }.dispatch();
                    }
                });
            }
            // No clock left to defer onto; nothing will ever poll the waiters
            // again, so serve them inline.
            Err(_) => self.dispatch(),
        }
    }

    /// Grant queued requests from the head while they fit.
    fn dispatch(&self) {
        let granted: Vec<Rc<Request>> = {
            let mut guard = self.inner.state.borrow_mut();
            let st = &mut *guard;
            st.dispatch_pending = false;
            let mut granted = Vec::new();
            while let Some(entry) = st.waiters.first_entry() {
                let amount = entry.get().amount;
                if amount > st.level {
                    break;
                }
                let request = entry.remove();
                st.level -= amount;
                granted.push(request);
            }
            let in_use = self.inner.capacity - st.level;
            st.peak_in_use = st.peak_in_use.max(in_use);
            granted
        };

        for request in granted {
            trace!(pool = %self.inner.name, amount = request.amount, "granted");
            request.resolve(RequestState::Granted);
        }
    }

    /// Withdraw a request that is being abandoned.
    fn cancel(&self, key: Option<WaitKey>, request: &Request) {
        match request.state.get() {
            RequestState::Waiting => {
                if let Some(key) = key {
                    self.inner.state.borrow_mut().waiters.remove(&key);
                    // The head may have been blocking smaller requests behind it.
                    self.schedule_dispatch();
                }
            }
            RequestState::Granted if request.amount > 0 => {
                request.state.set(RequestState::Taken);
                self.inner.state.borrow_mut().level += request.amount;
                self.schedule_dispatch();
            }
            _ => {}
        }
    }
}

/// Future returned by [`Pool::acquire`]. Resolves to the number of units granted.
///
/// Dropping it before completion withdraws the request; dropping it after a
/// grant landed but before it was observed returns the units.
#[must_use = "an acquisition does nothing unless awaited"]
pub struct Acquire {
    pool: Pool,
    key: Option<WaitKey>,
    request: Rc<Request>,
    error: Option<SimError>,
}

impl Future for Acquire {
    type Output = SimResult<u64>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(err) = self.error.take() {
            self.request.state.set(RequestState::Failed);
            return Poll::Ready(Err(err));
        }
        match self.request.state.get() {
            RequestState::Granted | RequestState::Taken => {
                self.request.state.set(RequestState::Taken);
                Poll::Ready(Ok(self.request.amount))
            }
            RequestState::Failed => Poll::Ready(Err(SimError::ResourceClosed(
                self.pool.name().to_string(),
            ))),
            RequestState::Waiting => {
                *self.request.waker.borrow_mut() = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

impl Drop for Acquire {
    fn drop(&mut self) {
        self.pool.cancel(self.key, &self.request);
    }
}
