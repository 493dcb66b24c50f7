// Connection counters and their read-only snapshot.
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub(crate) struct ClientStats {
    pub(crate) in_msgs: AtomicU64,
    pub(crate) out_msgs: AtomicU64,
    pub(crate) in_bytes: AtomicU64,
    pub(crate) out_bytes: AtomicU64,
    pub(crate) reconnects: AtomicU64,
    pub(crate) dropped_messages: AtomicU64,
    pub(crate) exceptions: AtomicU64,
}

impl ClientStats {
    pub(crate) fn register_read(&self, bytes: usize) {
        self.in_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn register_write(&self, bytes: usize) {
        self.out_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn register_exception(&self) {
        self.exceptions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn register_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("lark_client_reconnects_total").increment(1);
    }

    pub(crate) fn register_dropped(&self, count: u64) {
        self.dropped_messages.fetch_add(count, Ordering::Relaxed);
        metrics::counter!("lark_client_dropped_messages_total").increment(count);
    }

    pub(crate) fn snapshot(&self) -> Statistics {
        Statistics {
            in_msgs: self.in_msgs.load(Ordering::Relaxed),
            out_msgs: self.out_msgs.load(Ordering::Relaxed),
            in_bytes: self.in_bytes.load(Ordering::Relaxed),
            out_bytes: self.out_bytes.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            dropped_messages: self.dropped_messages.load(Ordering::Relaxed),
            exceptions: self.exceptions.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of a connection's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Statistics {
    pub in_msgs: u64,
    pub out_msgs: u64,
    pub in_bytes: u64,
    pub out_bytes: u64,
    pub reconnects: u64,
    pub dropped_messages: u64,
    pub exceptions: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_registered_traffic() {
        let stats = ClientStats::default();
        stats.register_read(10);
        stats.register_write(20);
        stats.register_reconnect();
        stats.register_dropped(3);
        stats.register_exception();
        stats.in_msgs.fetch_add(2, Ordering::Relaxed);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.in_bytes, 10);
        assert_eq!(snapshot.out_bytes, 20);
        assert_eq!(snapshot.reconnects, 1);
        assert_eq!(snapshot.dropped_messages, 3);
        assert_eq!(snapshot.exceptions, 1);
        assert_eq!(snapshot.in_msgs, 2);
    }
}
