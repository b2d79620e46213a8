//! Simulation clock and cooperative process executor.
//!
//! Every simulated activity (the arrival feed, each device visit of a job)
//! is a `!Send` future spawned onto an [`Env`]. Exactly one process is polled
//! at a time. A process gives up control only when it awaits a
//! [`Timeout`] or a resource grant; the clock then pops the earliest
//! scheduled event, advances `now` to its timestamp and resumes whoever was
//! waiting on it.
//!
//! Events scheduled for the same instant fire in scheduling order, and all
//! processes made runnable by one event are drained before the next event is
//! popped. Nothing here is thread-safe and nothing needs to be: the
//! single-poller property is what keeps resource counters consistent.

use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll, Waker};

use futures::future::LocalBoxFuture;
use futures::task::{ArcWake, waker};
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::error::{SimError, SimResult};

/// Simulated time, in seconds.
pub type SimTime = f64;

/// Identifier of a spawned process.
pub type ProcessId = u64;

/// Shared run queue. Wakers must be `Send + Sync`, so this is the one place
/// a lock appears; it is never contended.
type ReadyQueue = Arc<Mutex<VecDeque<ProcessId>>>;

/// Wake target shared between a [`Timeout`] and its queued event.
#[derive(Default)]
struct TimerSlot {
    fired: Cell<bool>,
    cancelled: Cell<bool>,
    waker: RefCell<Option<Waker>>,
}

impl TimerSlot {
    fn fire(&self) {
        self.fired.set(true);
        if let Some(w) = self.waker.borrow_mut().take() {
            w.wake();
        }
    }
}

enum Action {
    Wake(Rc<TimerSlot>),
    Call(Box<dyn FnOnce()>),
}

struct ScheduledEvent {
    at: SimTime,
    seq: u64,
    action: Action,
}

impl ScheduledEvent {
    fn is_cancelled(&self) -> bool {
        matches!(&self.action, Action::Wake(slot) if slot.cancelled.get())
    }
}

impl PartialEq for ScheduledEvent {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for ScheduledEvent {}

impl PartialOrd for ScheduledEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: earliest time, then lowest seq, must compare greatest.
        other
            .at
            .total_cmp(&self.at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct ProcessWaker {
    id: ProcessId,
    ready: ReadyQueue,
}

impl ArcWake for ProcessWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self
            .ready
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(arc_self.id);
    }
}

struct Process {
    future: Option<LocalBoxFuture<'static, ()>>,
    waker: Waker,
}

struct EnvState {
    now: SimTime,
    next_seq: u64,
    next_pid: ProcessId,
    queue: BinaryHeap<ScheduledEvent>,
    processes: FxHashMap<ProcessId, Process>,
}

impl EnvState {
    fn schedule(&mut self, at: SimTime, action: Action) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push(ScheduledEvent { at, seq, action });
    }

    /// Discard cancelled timers at the head and report the next live event time.
    fn next_live_time(&mut self) -> Option<SimTime> {
        while let Some(ev) = self.queue.peek() {
            if ev.is_cancelled() {
                self.queue.pop();
            } else {
                return Some(ev.at);
            }
        }
        None
    }
}

/// Handle to the simulation clock. Cheap to clone; all clones share one timeline.
#[derive(Clone)]
pub struct Env {
    state: Rc<RefCell<EnvState>>,
    ready: ReadyQueue,
}

impl Default for Env {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Env {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Env")
            .field("now", &self.now())
            .field("pending_events", &self.pending_events())
            .field("active_processes", &self.active_processes())
            .finish()
    }
}

impl Env {
    /// Create a clock at time zero with nothing scheduled.
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(EnvState {
                now: 0.0,
                next_seq: 0,
                next_pid: 0,
                queue: BinaryHeap::new(),
                processes: FxHashMap::default(),
            })),
            ready: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Current simulated time.
    pub fn now(&self) -> SimTime {
        self.state.borrow().now
    }

    /// Number of scheduled events still queued (including cancelled timers
    /// not yet discarded).
    pub fn pending_events(&self) -> usize {
        self.state.borrow().queue.len()
    }

    /// Number of processes that have been spawned and not yet finished.
    pub fn active_processes(&self) -> usize {
        self.state.borrow().processes.len()
    }

    /// A handle that does not keep the clock alive.
    pub fn downgrade(&self) -> WeakEnv {
        WeakEnv {
            state: Rc::downgrade(&self.state),
            ready: Arc::clone(&self.ready),
        }
    }

    /// Spawn a process. It first runs when the clock next drains its run queue.
    pub fn spawn<F>(&self, future: F) -> ProcessHandle<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        let slot = Rc::new(JoinSlot::default());
        let output = Rc::clone(&slot);
        let wrapped = async move {
            let value = future.await;
            output.complete(value);
        };

        let id = {
            let mut st = self.state.borrow_mut();
            let id = st.next_pid;
            st.next_pid += 1;
            let process_waker = waker(Arc::new(ProcessWaker {
                id,
                ready: Arc::clone(&self.ready),
            }));
            st.processes.insert(
                id,
                Process {
                    future: Some(Box::pin(wrapped)),
                    waker: process_waker,
                },
            );
            id
        };
        self.push_ready(id);
        ProcessHandle { id, slot }
    }

    /// Suspend the awaiting process for `delay` time units.
    ///
    /// The wake-up is scheduled immediately, so two timeouts created at the
    /// same instant with the same delay fire in creation order.
    pub fn timeout(&self, delay: SimTime) -> SimResult<Timeout> {
        if !delay.is_finite() || delay < 0.0 {
            return Err(SimError::invalid_time(delay, "delay must be finite and >= 0"));
        }
        let slot = Rc::new(TimerSlot::default());
        let mut st = self.state.borrow_mut();
        let at = st.now + delay;
        st.schedule(at, Action::Wake(Rc::clone(&slot)));
        Ok(Timeout { slot })
    }

    /// Run `f` as a zero-delay event at the current instant, after every
    /// event already scheduled for now.
    pub fn defer(&self, f: impl FnOnce() + 'static) {
        let mut st = self.state.borrow_mut();
        let at = st.now;
        st.schedule(at, Action::Call(Box::new(f)));
    }

    /// Advance time and run processes until no events remain, or until the
    /// horizon is reached. Returns the final clock value.
    ///
    /// With a horizon, the clock ends exactly at `until` even if the event
    /// queue drained earlier; events scheduled after it stay queued.
    pub fn run(&self, until: Option<SimTime>) -> SimResult<SimTime> {
        if let Some(horizon) = until {
            let now = self.now();
            if !horizon.is_finite() || horizon < now {
                return Err(SimError::invalid_time(
                    horizon,
                    format!("horizon must be finite and >= now ({now})"),
                ));
            }
        }

        loop {
            self.drain_ready();

            let event = {
                let mut st = self.state.borrow_mut();
                let Some(next_at) = st.next_live_time() else {
                    break;
                };
                if until.is_some_and(|h| next_at > h) {
                    break;
                }
                let Some(event) = st.queue.pop() else {
                    break;
                };
                st.now = event.at;
                event
            };

            trace!(at = event.at, seq = event.seq, "clock event");
            match event.action {
                Action::Wake(slot) => slot.fire(),
                Action::Call(f) => f(),
            }
        }

        let mut st = self.state.borrow_mut();
        if let Some(horizon) = until {
            st.now = st.now.max(horizon);
        }
        Ok(st.now)
    }

    /// Drop every unfinished process and queued event.
    ///
    /// Processes hold clock handles, so a run that ends with blocked jobs
    /// would otherwise keep the whole graph alive.
    pub fn abandon_pending(&self) {
        let (processes, queue) = {
            let mut st = self.state.borrow_mut();
            (
                std::mem::take(&mut st.processes),
                std::mem::take(&mut st.queue),
            )
        };
        self.ready
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        drop(processes);
        drop(queue);
    }

    fn push_ready(&self, id: ProcessId) {
        self.ready
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(id);
    }

    fn pop_ready(&self) -> Option<ProcessId> {
        self.ready
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    fn drain_ready(&self) {
        while let Some(id) = self.pop_ready() {
            self.poll_process(id);
        }
    }

    fn poll_process(&self, id: ProcessId) {
        let (mut future, process_waker) = {
            let mut st = self.state.borrow_mut();
            let Some(process) = st.processes.get_mut(&id) else {
                // Finished already; a stale wake.
                return;
            };
            let Some(future) = process.future.take() else {
                return;
            };
            (future, process.waker.clone())
        };

        let mut cx = Context::from_waker(&process_waker);
        match future.as_mut().poll(&mut cx) {
            Poll::Ready(()) => {
                self.state.borrow_mut().processes.remove(&id);
            }
            Poll::Pending => {
                if let Some(process) = self.state.borrow_mut().processes.get_mut(&id) {
                    process.future = Some(future);
                }
            }
        }
    }
}

/// Non-owning clock handle held by long-lived model objects (resource pools).
#[derive(Clone)]
pub struct WeakEnv {
    state: Weak<RefCell<EnvState>>,
    ready: ReadyQueue,
}

impl WeakEnv {
    /// Recover a full handle if the clock is still alive.
    pub fn upgrade(&self) -> SimResult<Env> {
        let state = self.state.upgrade().ok_or(SimError::ClockStopped)?;
        Ok(Env {
            state,
            ready: Arc::clone(&self.ready),
        })
    }
}

impl fmt::Debug for WeakEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakEnv")
            .field("alive", &(self.state.strong_count() > 0))
            .finish()
    }
}

/// Future returned by [`Env::timeout`].
///
/// Dropping it before it fires cancels the wake-up, so an abandoned timer
/// never drags the clock forward.
#[must_use = "a timeout does nothing unless awaited"]
pub struct Timeout {
    slot: Rc<TimerSlot>,
}

impl Future for Timeout {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.slot.fired.get() {
            Poll::Ready(())
        } else {
            *self.slot.waker.borrow_mut() = Some(cx.waker().clone());
            Poll::Pending
        }
    }
}

impl Drop for Timeout {
    fn drop(&mut self) {
        if !self.slot.fired.get() {
            self.slot.cancelled.set(true);
        }
    }
}

struct JoinSlot<T> {
    value: RefCell<Option<T>>,
    done: Cell<bool>,
    waker: RefCell<Option<Waker>>,
}

impl<T> Default for JoinSlot<T> {
    fn default() -> Self {
        Self {
            value: RefCell::new(None),
            done: Cell::new(false),
            waker: RefCell::new(None),
        }
    }
}

impl<T> JoinSlot<T> {
    fn complete(&self, value: T) {
        *self.value.borrow_mut() = Some(value);
        self.done.set(true);
        if let Some(w) = self.waker.borrow_mut().take() {
            w.wake();
        }
    }
}

/// Handle to a spawned process; awaiting it yields the process output.
pub struct ProcessHandle<T> {
    id: ProcessId,
    slot: Rc<JoinSlot<T>>,
}

impl<T> ProcessHandle<T> {
    /// Process identifier.
    pub fn id(&self) -> ProcessId {
        self.id
    }

    /// Whether the process has run to completion.
    pub fn is_finished(&self) -> bool {
        self.slot.done.get()
    }

    /// Take the output of a finished process without awaiting it.
    pub fn try_take(&self) -> Option<T> {
        self.slot.value.borrow_mut().take()
    }
}

impl<T> Future for ProcessHandle<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        if let Some(value) = self.slot.value.borrow_mut().take() {
            return Poll::Ready(value);
        }
        *self.slot.waker.borrow_mut() = Some(cx.waker().clone());
        Poll::Pending
    }
}
