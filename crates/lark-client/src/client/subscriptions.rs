//! Subscription registry and delivery.
//!
//! # Purpose
//! Routes inbound messages to their subscription by SID, the authoritative
//! key (the server has already matched the subject). Pull subscriptions
//! buffer into a bounded per-subscription queue; push subscriptions share
//! their dispatcher's queue. The subject index exists only for local
//! bookkeeping.
//!
//! # Design notes
//! Overflow drops the oldest pending message so a stalled consumer observes
//! the most recent traffic; every drop is counted and surfaced to the error
//! listener as a slow-consumer report.
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

use lark_wire::Message;

use crate::errors::{Error, Result};

use super::connection::ConnectionInner;

/// Bounded in-memory message queue between the reader and one consumer.
pub(crate) struct PendingQueue {
    messages: Mutex<VecDeque<Message>>,
    ready: Notify,
    capacity: usize,
    closed: AtomicBool,
    dropped: AtomicU64,
}

pub(crate) enum PushOutcome {
    Delivered,
    DroppedOldest,
    Closed,
}

impl PendingQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            messages: Mutex::new(VecDeque::new()),
            ready: Notify::new(),
            capacity: capacity.max(1),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    pub(crate) fn push(&self, message: Message) -> PushOutcome {
        if self.closed.load(Ordering::Relaxed) {
            return PushOutcome::Closed;
        }
        let outcome = {
            let mut messages = self.messages.lock().expect("pending queue lock");
            let outcome = if messages.len() >= self.capacity {
                messages.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
                PushOutcome::DroppedOldest
            } else {
                PushOutcome::Delivered
            };
            messages.push_back(message);
            outcome
        };
        self.ready.notify_waiters();
        outcome
    }

    /// Pop the next message, waiting up to `timeout` (forever when `None`).
    /// A closed queue drains its backlog before reporting `Closed`.
    pub(crate) async fn pop(&self, timeout: Option<Duration>) -> Result<Message> {
        let deadline = timeout.map(|timeout| tokio::time::Instant::now() + timeout);
        loop {
            let notified = self.ready.notified();
            {
                let mut messages = self.messages.lock().expect("pending queue lock");
                if let Some(message) = messages.pop_front() {
                    return Ok(message);
                }
            }
            if self.closed.load(Ordering::Relaxed) {
                return Err(Error::Closed);
            }
            match deadline {
                Some(deadline) => {
                    let Some(remaining) =
                        deadline.checked_duration_since(tokio::time::Instant::now())
                    else {
                        return Err(Error::Timeout);
                    };
                    let _ = tokio::time::timeout(remaining, notified).await;
                }
                None => notified.await,
            }
        }
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        self.ready.notify_waiters();
    }

    pub(crate) fn len(&self) -> usize {
        self.messages.lock().expect("pending queue lock").len()
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

// Where an entry's messages go.
pub(crate) enum Target {
    /// A pull subscription's own queue, or a dispatcher's shared queue.
    Queue(Arc<PendingQueue>),
    /// Request/reply traffic routed through the connection's inbox table.
    Inbox,
}

pub(crate) struct Entry {
    pub(crate) subject: String,
    pub(crate) queue_group: Option<String>,
    pub(crate) target: Target,
    /// Whether the queue belongs to this entry alone. Dispatcher entries
    /// share their dispatcher's queue, which must outlive any one of them.
    pub(crate) owns_queue: bool,
    /// Absolute delivery count after which the subscription self-destructs.
    pub(crate) max_msgs: Option<u64>,
    pub(crate) delivered: u64,
}

/// A subscription's state replayed on the wire after a reconnect.
pub(crate) struct ReplayEntry {
    pub(crate) sid: u64,
    pub(crate) subject: String,
    pub(crate) queue_group: Option<String>,
    /// Remaining auto-unsubscribe allowance, when one was set.
    pub(crate) remaining: Option<u64>,
}

pub(crate) enum Delivery {
    Delivered,
    /// The message belongs to the request/reply inbox.
    Inbox(Message),
    SlowConsumer { sid: u64, dropped: u64 },
    /// No entry for this SID; late traffic after an unsubscribe.
    Unknown,
}

#[derive(Default)]
struct RegistryInner {
    entries: HashMap<u64, Entry>,
    by_subject: HashMap<String, HashSet<u64>>,
}

#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    inner: Mutex<RegistryInner>,
}

impl SubscriptionRegistry {
    pub(crate) fn insert(&self, sid: u64, entry: Entry) {
        let mut inner = self.inner.lock().expect("registry lock");
        inner
            .by_subject
            .entry(entry.subject.clone())
            .or_default()
            .insert(sid);
        inner.entries.insert(sid, entry);
    }

    pub(crate) fn remove(&self, sid: u64) -> Option<Entry> {
        let mut inner = self.inner.lock().expect("registry lock");
        Self::remove_locked(&mut inner, sid)
    }

    fn remove_locked(inner: &mut RegistryInner, sid: u64) -> Option<Entry> {
        let entry = inner.entries.remove(&sid)?;
        if let Some(sids) = inner.by_subject.get_mut(&entry.subject) {
            sids.remove(&sid);
            if sids.is_empty() {
                inner.by_subject.remove(&entry.subject);
            }
        }
        Some(entry)
    }

    /// Arm auto-unsubscribe after `max` total deliveries. Returns the entry
    /// when the limit is already satisfied and the caller should drop it.
    pub(crate) fn set_max(&self, sid: u64, max: u64) -> Option<Entry> {
        let mut inner = self.inner.lock().expect("registry lock");
        let satisfied = match inner.entries.get_mut(&sid) {
            Some(entry) => {
                entry.max_msgs = Some(max);
                entry.delivered >= max
            }
            None => return None,
        };
        if satisfied {
            Self::remove_locked(&mut inner, sid)
        } else {
            None
        }
    }

    pub(crate) fn deliver(&self, message: Message) -> Delivery {
        let mut inner = self.inner.lock().expect("registry lock");
        let sid = message.sid;
        let Some(entry) = inner.entries.get_mut(&sid) else {
            debug!(sid, subject = %message.subject, "message for unknown sid");
            return Delivery::Unknown;
        };
        entry.delivered += 1;
        let completed = entry
            .max_msgs
            .is_some_and(|max| entry.delivered >= max);
        let owns_queue = entry.owns_queue;
        let (outcome, dropped) = match &entry.target {
            Target::Inbox => return Delivery::Inbox(message),
            Target::Queue(queue) => {
                let outcome = queue.push(message);
                if completed && owns_queue {
                    queue.close();
                }
                (outcome, queue.dropped())
            }
        };
        if completed {
            Self::remove_locked(&mut inner, sid);
        }
        match outcome {
            PushOutcome::DroppedOldest => Delivery::SlowConsumer { sid, dropped },
            _ => Delivery::Delivered,
        }
    }

    /// Consistent snapshot of live subscriptions for resubscribe replay.
    pub(crate) fn replay_snapshot(&self) -> Vec<ReplayEntry> {
        let inner = self.inner.lock().expect("registry lock");
        let mut entries: Vec<ReplayEntry> = inner
            .entries
            .iter()
            .map(|(sid, entry)| ReplayEntry {
                sid: *sid,
                subject: entry.subject.clone(),
                queue_group: entry.queue_group.clone(),
                remaining: entry
                    .max_msgs
                    .map(|max| max.saturating_sub(entry.delivered)),
            })
            .collect();
        // Stable replay order keeps the wire traffic deterministic.
        entries.sort_by_key(|entry| entry.sid);
        entries
    }

    pub(crate) fn all_sids(&self) -> Vec<u64> {
        let inner = self.inner.lock().expect("registry lock");
        let mut sids: Vec<u64> = inner.entries.keys().copied().collect();
        sids.sort_unstable();
        sids
    }

    pub(crate) fn sids_for_subject(&self, subject: &str) -> Vec<u64> {
        let inner = self.inner.lock().expect("registry lock");
        inner
            .by_subject
            .get(subject)
            .map(|sids| sids.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Drop every entry and close their queues. Used on connection close.
    pub(crate) fn clear(&self) {
        let mut inner = self.inner.lock().expect("registry lock");
        for entry in inner.entries.values() {
            if let Target::Queue(queue) = &entry.target {
                queue.close();
            }
        }
        inner.entries.clear();
        inner.by_subject.clear();
    }
}

/// A pull subscription: messages buffer internally until `next` is called.
///
/// Survives reconnects; the connection replays it with the same SID.
pub struct Subscription {
    pub(crate) sid: u64,
    pub(crate) subject: String,
    pub(crate) queue_group: Option<String>,
    pub(crate) queue: Arc<PendingQueue>,
    pub(crate) connection: Weak<ConnectionInner>,
}

impl Subscription {
    pub fn sid(&self) -> u64 {
        self.sid
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn queue_group(&self) -> Option<&str> {
        self.queue_group.as_deref()
    }

    /// Block for the next message, up to `timeout`.
    pub async fn next(&self, timeout: Duration) -> Result<Message> {
        self.queue.pop(Some(timeout)).await
    }

    /// Messages delivered but not yet consumed.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Messages discarded because this consumer fell behind.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }

    pub async fn unsubscribe(self) -> Result<()> {
        let connection = self.connection.upgrade().ok_or(Error::Closed)?;
        connection.unsubscribe_sid(self.sid, None)
    }

    /// Auto-unsubscribe after `max` total deliveries.
    pub async fn unsubscribe_after(&self, max: u64) -> Result<()> {
        let connection = self.connection.upgrade().ok_or(Error::Closed)?;
        connection.unsubscribe_sid(self.sid, Some(max))
    }
}

/// A named group of push subscriptions sharing one handler task.
///
/// The dispatcher owns its subscriptions: closing it unsubscribes them and
/// stops the handler after the queue drains.
pub struct Dispatcher {
    pub(crate) queue: Arc<PendingQueue>,
    pub(crate) sids: Mutex<Vec<u64>>,
    pub(crate) connection: Weak<ConnectionInner>,
}

impl Dispatcher {
    pub async fn subscribe(&self, subject: &str) -> Result<u64> {
        self.subscribe_queue(subject, None).await
    }

    pub async fn subscribe_queue(&self, subject: &str, queue_group: Option<&str>) -> Result<u64> {
        let connection = self.connection.upgrade().ok_or(Error::Closed)?;
        // The queue is the dispatcher's, shared by all of its subscriptions.
        let sid = connection.register_subscription(
            subject,
            queue_group,
            Target::Queue(Arc::clone(&self.queue)),
            false,
        )?;
        self.sids.lock().expect("dispatcher sids lock").push(sid);
        Ok(sid)
    }

    pub fn sids(&self) -> Vec<u64> {
        self.sids.lock().expect("dispatcher sids lock").clone()
    }

    /// Unsubscribe everything and stop the handler once drained.
    pub fn close(&self) {
        if let Some(connection) = self.connection.upgrade() {
            let sids = std::mem::take(&mut *self.sids.lock().expect("dispatcher sids lock"));
            for sid in sids {
                let _ = connection.unsubscribe_sid(sid, None);
            }
        }
        self.queue.close();
    }
}
