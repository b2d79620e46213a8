//! Synchronous in-process publish/subscribe.
//!
//! `publish` calls every matching subscriber before it returns, in the order
//! they were registered. Handlers may publish or subscribe re-entrantly;
//! a subscriber added during a publish sees only later messages.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use serde::Serialize;

use crate::clock::SimTime;
use crate::job::JobId;

/// Topic published when a device finishes serving a phase.
pub const DEVICE_FINISH: &str = "device_finish";

/// Topic published when a job enters the system.
pub const JOB_ARRIVED: &str = "job_arrived";

/// Topic published when a job could not be served.
pub const JOB_FAILED: &str = "job_failed";

/// A message on the bus.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "topic", rename_all = "snake_case")]
pub enum BusEvent {
    /// A device completed a phase of `job_id`.
    DeviceFinish {
        device: String,
        job_id: JobId,
        timestamp: SimTime,
    },
    /// A job arrived.
    JobArrived { job_id: JobId, timestamp: SimTime },
    /// A job's dispatch failed.
    JobFailed {
        job_id: JobId,
        reason: String,
        timestamp: SimTime,
    },
}

impl BusEvent {
    /// Topic the event is published under.
    pub fn topic(&self) -> &'static str {
        match self {
            BusEvent::DeviceFinish { .. } => DEVICE_FINISH,
            BusEvent::JobArrived { .. } => JOB_ARRIVED,
            BusEvent::JobFailed { .. } => JOB_FAILED,
        }
    }

    /// Job the event concerns.
    pub fn job_id(&self) -> JobId {
        match self {
            BusEvent::DeviceFinish { job_id, .. }
            | BusEvent::JobArrived { job_id, .. }
            | BusEvent::JobFailed { job_id, .. } => *job_id,
        }
    }
}

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler = Rc<dyn Fn(&BusEvent)>;

struct Subscriber {
    id: SubscriptionId,
    /// `None` matches every topic.
    topic: Option<String>,
    handler: Handler,
}

#[derive(Default)]
struct BusInner {
    subscribers: RefCell<Vec<Subscriber>>,
    next_id: Cell<u64>,
    published: Cell<u64>,
}

/// Event bus. Clones share the same subscriber list.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Rc<BusInner>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .field("published", &self.published())
            .finish()
    }
}

impl EventBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to one topic.
    pub fn subscribe(
        &self,
        topic: impl Into<String>,
        handler: impl Fn(&BusEvent) + 'static,
    ) -> SubscriptionId {
        self.register(Some(topic.into()), Rc::new(handler))
    }

    /// Subscribe to every topic.
    pub fn subscribe_all(&self, handler: impl Fn(&BusEvent) + 'static) -> SubscriptionId {
        self.register(None, Rc::new(handler))
    }

    /// Remove a subscription. Returns whether it existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.inner.subscribers.borrow_mut();
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }

    /// Deliver `event` to every matching subscriber, in registration order.
    pub fn publish(&self, event: &BusEvent) {
        let topic = event.topic();
        let handlers: Vec<Handler> = self
            .inner
            .subscribers
            .borrow()
            .iter()
            .filter(|s| s.topic.as_deref().is_none_or(|t| t == topic))
            .map(|s| Rc::clone(&s.handler))
            .collect();

        self.inner.published.set(self.inner.published.get() + 1);
        for handler in handlers {
            handler(event);
        }
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.borrow().len()
    }

    /// Number of events published so far.
    pub fn published(&self) -> u64 {
        self.inner.published.get()
    }

    fn register(&self, topic: Option<String>, handler: Handler) -> SubscriptionId {
        let id = SubscriptionId(self.inner.next_id.get());
        self.inner.next_id.set(id.0 + 1);
        self.inner.subscribers.borrow_mut().push(Subscriber { id, topic, handler });
        id
    }
}
