//! Outbound message queue.
//!
//! # Purpose
//! A bounded FIFO between the publish path and the writer task. Messages are
//! detached in batches as a linked chain so the writer can serialize a whole
//! batch without collecting it into an intermediate vector.
//!
//! # Design notes
//! Producers and the single consumer coordinate through two `Notify` handles;
//! the `Notified` future is always created before the state check so a wakeup
//! between check and await is never lost. A paused queue yields nothing from
//! `accumulate` until resumed, which is how the writer is quiesced across a
//! reconnect without tearing down queued messages.
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use lark_wire::CRLF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MessageKind {
    /// Control traffic: CONNECT, SUB, UNSUB, PING, PONG. No body follows.
    Protocol,
    /// PUB/HPUB carrying a body that must be serialized after the prefix.
    Regular,
}

/// One outbound operation, linked intrusively for batch serialization.
#[derive(Debug)]
pub(crate) struct OutboundMessage {
    pub(crate) prefix: Bytes,
    pub(crate) headers: Option<Bytes>,
    pub(crate) payload: Bytes,
    pub(crate) kind: MessageKind,
    pub(crate) next: Option<Box<OutboundMessage>>,
}

impl OutboundMessage {
    pub(crate) fn protocol(prefix: Bytes) -> Box<Self> {
        Box::new(Self {
            prefix,
            headers: None,
            payload: Bytes::new(),
            kind: MessageKind::Protocol,
            next: None,
        })
    }

    pub(crate) fn regular(prefix: Bytes, headers: Option<Bytes>, payload: Bytes) -> Box<Self> {
        Box::new(Self {
            prefix,
            headers,
            payload,
            kind: MessageKind::Regular,
            next: None,
        })
    }

    /// Full serialized size on the wire.
    pub(crate) fn wire_len(&self) -> usize {
        let mut len = self.prefix.len() + CRLF.len();
        if self.kind == MessageKind::Regular {
            len += self.headers.as_ref().map_or(0, Bytes::len) + self.payload.len() + CRLF.len();
        }
        len
    }

    /// Body bytes only; what the reconnect buffer policy accounts.
    pub(crate) fn body_len(&self) -> usize {
        self.headers.as_ref().map_or(0, Bytes::len) + self.payload.len()
    }
}

/// A batch detached from the queue: chain head plus totals.
pub(crate) struct Accumulated {
    pub(crate) head: Box<OutboundMessage>,
    pub(crate) size: usize,
    pub(crate) count: usize,
}

impl Accumulated {
    pub(crate) fn iter(&self) -> ChainIter<'_> {
        ChainIter {
            next: Some(&self.head),
        }
    }
}

pub(crate) struct ChainIter<'a> {
    next: Option<&'a OutboundMessage>,
}

impl<'a> Iterator for ChainIter<'a> {
    type Item = &'a OutboundMessage;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = current.next.as_deref();
        Some(current)
    }
}

struct Inner {
    messages: VecDeque<Box<OutboundMessage>>,
    bytes: usize,
    paused: bool,
}

pub(crate) struct WriteQueue {
    inner: Mutex<Inner>,
    // Consumer side: messages arrived or the queue was resumed.
    ready: Notify,
    // Producer side: room was freed.
    space: Notify,
    max_messages: usize,
    discard_when_full: bool,
}

impl WriteQueue {
    /// `max_messages == 0` means unbounded (the reconnect queue).
    pub(crate) fn new(max_messages: usize, discard_when_full: bool) -> Self {
        Self {
            inner: Mutex::new(Inner {
                messages: VecDeque::new(),
                bytes: 0,
                paused: false,
            }),
            ready: Notify::new(),
            space: Notify::new(),
            max_messages,
            discard_when_full,
        }
    }

    /// Enqueue a message, honoring the configured overflow policy.
    ///
    /// Returns `false` when the discard policy dropped the message. Blocks
    /// while full under the blocking policy.
    pub(crate) async fn push(&self, message: Box<OutboundMessage>) -> bool {
        loop {
            let notified = self.space.notified();
            {
                let mut inner = self.inner.lock().expect("write queue lock");
                if self.max_messages == 0 || inner.messages.len() < self.max_messages {
                    inner.bytes += message.wire_len();
                    inner.messages.push_back(message);
                    drop(inner);
                    self.ready.notify_waiters();
                    return true;
                }
                if self.discard_when_full {
                    return false;
                }
            }
            notified.await;
        }
    }

    /// Enqueue control traffic. Never blocks and never drops; internal
    /// messages bypass the capacity checks.
    pub(crate) fn push_internal(&self, message: Box<OutboundMessage>) {
        {
            let mut inner = self.inner.lock().expect("write queue lock");
            inner.bytes += message.wire_len();
            inner.messages.push_back(message);
        }
        self.ready.notify_waiters();
    }

    /// Detach up to `max_count` messages totaling at most `max_bytes`,
    /// waiting up to `wait` for the first one. Returns `None` on timeout or
    /// while the queue is paused.
    pub(crate) async fn accumulate(
        &self,
        max_bytes: usize,
        max_count: usize,
        wait: Duration,
    ) -> Option<Accumulated> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.ready.notified();
            {
                let mut inner = self.inner.lock().expect("write queue lock");
                if inner.paused {
                    return None;
                }
                if !inner.messages.is_empty() {
                    let batch = Self::detach(&mut inner, max_bytes, max_count);
                    drop(inner);
                    self.space.notify_waiters();
                    return Some(batch);
                }
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            let _ = tokio::time::timeout(remaining, notified).await;
        }
    }

    // The first message is always taken, even if alone it exceeds max_bytes.
    fn detach(inner: &mut Inner, max_bytes: usize, max_count: usize) -> Accumulated {
        let mut head: Option<Box<OutboundMessage>> = None;
        let mut slot = &mut head;
        let mut size = 0;
        let mut count = 0;
        while count < max_count {
            let Some(front) = inner.messages.front() else {
                break;
            };
            let wire_len = front.wire_len();
            if count > 0 && size + wire_len > max_bytes {
                break;
            }
            let message = inner.messages.pop_front().expect("front exists");
            inner.bytes -= wire_len;
            size += wire_len;
            count += 1;
            *slot = Some(message);
            slot = &mut slot.as_mut().expect("just set").next;
        }
        Accumulated {
            head: head.expect("at least one message"),
            size,
            count,
        }
    }

    /// Stop serving accumulators. Queued messages are retained.
    pub(crate) fn pause(&self) {
        self.inner.lock().expect("write queue lock").paused = true;
        self.ready.notify_waiters();
    }

    pub(crate) fn resume(&self) {
        self.inner.lock().expect("write queue lock").paused = false;
        self.ready.notify_waiters();
    }

    /// Drop queued messages matching `predicate`. Used while paused to purge
    /// traffic that must not survive a reconnect.
    pub(crate) fn filter(&self, predicate: impl Fn(&OutboundMessage) -> bool) {
        {
            let mut inner = self.inner.lock().expect("write queue lock");
            inner.messages.retain(|message| !predicate(message));
            inner.bytes = inner.messages.iter().map(|message| message.wire_len()).sum();
        }
        self.space.notify_waiters();
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().expect("write queue lock").messages.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn size_in_bytes(&self) -> usize {
        self.inner.lock().expect("write queue lock").bytes
    }
}
