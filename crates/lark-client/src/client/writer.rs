//! Writer task: drains the outbound queues and batches bytes onto the
//! transport.
//!
//! # Design notes
//! `start`/`stop` are idempotent and may be called repeatedly under
//! reconnect churn without awaiting the completion future first. Each
//! spawned task owns its own run flag and completion channel, so a stale
//! task can never be revived by a later `start` and overlapping tasks never
//! share a transport. Stopping purges in-flight PING/PONG from the primary
//! queue; they would pair with the wrong server after a reconnect.
use bytes::BytesMut;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot, watch};

use lark_transport::TransportWriter;
use lark_wire::CRLF;

use crate::config::MAX_MESSAGES_PER_BATCH;
use crate::errors::Error;
use crate::stats::ClientStats;

use super::write_queue::{Accumulated, MessageKind, OutboundMessage, WriteQueue};

// Accumulate waits: generous when idle, short while replaying a reconnect so
// the resubscribe traffic gets through quickly.
const WAIT_FOR_MESSAGE: Duration = Duration::from_secs(120);
const RECONNECT_ACCUMULATE_WAIT: Duration = Duration::from_millis(1);

/// Communication failures are reported with the session generation that
/// observed them, so a stale task cannot trigger recovery of a healthy
/// session.
pub(crate) type CommSender = mpsc::Sender<(u64, Error)>;

struct TaskState {
    running: Arc<AtomicBool>,
    done: watch::Receiver<bool>,
    cancel: watch::Sender<bool>,
}

pub(crate) struct Writer {
    outgoing: WriteQueue,
    reconnect_outgoing: WriteQueue,
    reconnect_mode: AtomicBool,
    buffer_size: usize,
    state: Mutex<TaskState>,
    stats: Arc<ClientStats>,
}

impl Writer {
    pub(crate) fn new(
        max_messages: usize,
        discard_when_full: bool,
        buffer_size: usize,
        stats: Arc<ClientStats>,
    ) -> Self {
        // Completed-from-birth marker so stop() before any start() resolves.
        let (done_tx, done_rx) = watch::channel(true);
        drop(done_tx);
        Self {
            outgoing: WriteQueue::new(max_messages, discard_when_full),
            // Replay traffic is control-plane only and must never be dropped.
            reconnect_outgoing: WriteQueue::new(0, false),
            reconnect_mode: AtomicBool::new(false),
            buffer_size,
            state: Mutex::new(TaskState {
                running: Arc::new(AtomicBool::new(false)),
                done: done_rx,
                cancel: watch::channel(false).0,
            }),
            stats,
        }
    }

    /// Spawn a writer task for a new transport session.
    ///
    /// The task idles until `ready` resolves with the transport write half.
    pub(crate) fn start(
        self: &Arc<Self>,
        session: u64,
        ready: oneshot::Receiver<TransportWriter>,
        comm_tx: CommSender,
    ) {
        let running = Arc::new(AtomicBool::new(true));
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);
        {
            let mut state = self.state.lock().expect("writer start/stop lock");
            state.running = Arc::clone(&running);
            state.done = done_rx;
            state.cancel = cancel_tx;
            self.outgoing.resume();
            self.reconnect_outgoing.resume();
        }
        let writer = Arc::clone(self);
        tokio::spawn(async move {
            let result = tokio::select! {
                result = writer.run(&running, ready) => result,
                _ = cancel_rx.wait_for(|cancelled| *cancelled) => Ok(()),
            };
            if let Err(err) = result {
                if running.load(Ordering::Relaxed) {
                    let _ = comm_tx.send((session, err)).await;
                }
            }
            running.store(false, Ordering::Relaxed);
            let _ = done_tx.send(true);
        });
    }

    /// Quiesce the current task. Returns a future resolving when it has
    /// exited; safe to call repeatedly without awaiting.
    pub(crate) fn stop(&self) -> impl Future<Output = ()> + Send + use<> {
        let done = {
            let state = self.state.lock().expect("writer start/stop lock");
            state.running.store(false, Ordering::Relaxed);
            let _ = state.cancel.send(true);
            self.outgoing.pause();
            self.reconnect_outgoing.pause();
            // Stale keepalive traffic must not survive into the next session.
            self.outgoing.filter(|message| {
                message.prefix.as_ref() == b"PING" || message.prefix.as_ref() == b"PONG"
            });
            state.done.clone()
        };
        async move {
            let mut done = done;
            let _ = done.wait_for(|finished| *finished).await;
        }
    }

    pub(crate) fn set_reconnect_mode(&self, enabled: bool) {
        self.reconnect_mode.store(enabled, Ordering::Relaxed);
    }

    /// Enqueue a user publish on the primary queue. Returns `false` when the
    /// discard-when-full policy dropped it.
    pub(crate) async fn queue(&self, message: Box<OutboundMessage>) -> bool {
        self.outgoing.push(message).await
    }

    /// Enqueue protocol traffic: the reconnect queue while replaying, the
    /// primary queue otherwise.
    pub(crate) fn queue_internal(&self, message: Box<OutboundMessage>) {
        if self.reconnect_mode.load(Ordering::Relaxed) {
            self.reconnect_outgoing.push_internal(message);
        } else {
            self.outgoing.push_internal(message);
        }
    }

    pub(crate) fn outgoing_len(&self) -> usize {
        self.outgoing.len()
    }

    pub(crate) fn outgoing_bytes(&self) -> usize {
        self.outgoing.size_in_bytes()
    }

    async fn run(
        &self,
        running: &AtomicBool,
        ready: oneshot::Receiver<TransportWriter>,
    ) -> Result<(), Error> {
        // A dropped sender means the session was torn down before the
        // handshake finished; exit without reporting.
        let Ok(mut sink) = ready.await else {
            return Ok(());
        };
        let mut batch_buf = BytesMut::with_capacity(self.buffer_size);

        while running.load(Ordering::Relaxed) {
            let batch = if self.reconnect_mode.load(Ordering::Relaxed) {
                self.reconnect_outgoing
                    .accumulate(
                        self.buffer_size,
                        MAX_MESSAGES_PER_BATCH,
                        RECONNECT_ACCUMULATE_WAIT,
                    )
                    .await
            } else if !self.reconnect_outgoing.is_empty() {
                // Replay traffic left over from a reconnect drains ahead of
                // any buffered user publishes.
                self.reconnect_outgoing
                    .accumulate(
                        self.buffer_size,
                        MAX_MESSAGES_PER_BATCH,
                        RECONNECT_ACCUMULATE_WAIT,
                    )
                    .await
            } else {
                self.outgoing
                    .accumulate(self.buffer_size, MAX_MESSAGES_PER_BATCH, WAIT_FOR_MESSAGE)
                    .await
            };
            let Some(batch) = batch else {
                tokio::task::yield_now().await;
                continue;
            };
            self.send_batch(&mut sink, &mut batch_buf, batch).await?;
        }
        Ok(())
    }

    async fn send_batch(
        &self,
        sink: &mut TransportWriter,
        buf: &mut BytesMut,
        batch: Accumulated,
    ) -> Result<(), Error> {
        buf.clear();
        for message in batch.iter() {
            buf.extend_from_slice(&message.prefix);
            buf.extend_from_slice(CRLF);
            if message.kind == MessageKind::Regular {
                if let Some(headers) = &message.headers {
                    buf.extend_from_slice(headers);
                }
                buf.extend_from_slice(&message.payload);
                buf.extend_from_slice(CRLF);
            }
            if buf.len() >= self.buffer_size {
                self.flush_to(sink, buf).await?;
            }
        }
        self.flush_to(sink, buf).await?;
        sink.flush().await?;
        self.stats
            .out_msgs
            .fetch_add(batch.count as u64, Ordering::Relaxed);
        Ok(())
    }

    async fn flush_to(&self, sink: &mut TransportWriter, buf: &mut BytesMut) -> Result<(), Error> {
        if !buf.is_empty() {
            sink.write_all(buf).await?;
            self.stats.register_write(buf.len());
            metrics::counter!("lark_client_bytes_out_total").increment(buf.len() as u64);
            buf.clear();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use lark_transport::{Endpoint, Scheme, Transport};
    use lark_wire::{ping_line, pub_prefix};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn make_writer() -> Arc<Writer> {
        Arc::new(Writer::new(100, false, 8 * 1024, Arc::new(ClientStats::default())))
    }

    async fn tcp_pair() -> (TransportWriter, tokio::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let endpoint = Endpoint::new(Scheme::Plain, "127.0.0.1", addr.port());
        let (transport, accepted) = tokio::join!(
            Transport::connect(&endpoint, Duration::from_secs(1)),
            listener.accept()
        );
        let (_, sink) = transport.expect("connect").split();
        (sink, accepted.expect("accept").0)
    }

    #[tokio::test]
    async fn batches_are_serialized_in_order() {
        let writer = make_writer();
        let (sink, mut peer) = tcp_pair().await;
        let (ready_tx, ready_rx) = oneshot::channel();
        let (comm_tx, _comm_rx) = mpsc::channel(4);
        writer.start(1, ready_rx, comm_tx);
        ready_tx.send(sink).ok().expect("deliver sink");

        writer
            .queue(OutboundMessage::regular(
                pub_prefix("a", None, 3),
                None,
                Bytes::from_static(b"one"),
            ))
            .await;
        writer.queue_internal(OutboundMessage::protocol(ping_line()));

        let mut received = vec![0u8; "PUB a 3\r\none\r\nPING\r\n".len()];
        peer.read_exact(&mut received).await.expect("read");
        assert_eq!(received, b"PUB a 3\r\none\r\nPING\r\n");

        writer.stop().await;
    }

    #[tokio::test]
    async fn reconnect_mode_routes_internal_traffic_first() {
        let writer = make_writer();
        // Buffered user publish sits in the paused primary queue.
        writer
            .queue(OutboundMessage::regular(
                pub_prefix("buffered", None, 4),
                None,
                Bytes::from_static(b"late"),
            ))
            .await;
        writer.set_reconnect_mode(true);
        writer.queue_internal(OutboundMessage::protocol(Bytes::from_static(b"SUB s 1")));

        let (sink, mut peer) = tcp_pair().await;
        let (ready_tx, ready_rx) = oneshot::channel();
        let (comm_tx, _comm_rx) = mpsc::channel(4);
        writer.start(1, ready_rx, comm_tx);
        ready_tx.send(sink).ok().expect("deliver sink");
        writer.set_reconnect_mode(false);

        let expected = b"SUB s 1\r\nPUB buffered 4\r\nlate\r\n";
        let mut received = vec![0u8; expected.len()];
        peer.read_exact(&mut received).await.expect("read");
        assert_eq!(received, expected);

        writer.stop().await;
    }

    #[tokio::test]
    async fn stop_purges_stale_pings() {
        let writer = make_writer();
        writer.queue_internal(OutboundMessage::protocol(ping_line()));
        writer
            .queue(OutboundMessage::regular(
                pub_prefix("keep", None, 0),
                None,
                Bytes::new(),
            ))
            .await;
        writer.stop().await;
        assert_eq!(writer.outgoing_len(), 1);
        assert!(writer.outgoing_bytes() > 0);
    }

    #[tokio::test]
    async fn rapid_stop_start_without_awaiting_is_safe() {
        // Regression contract: thrashing start/stop must neither panic nor
        // deadlock, even though the completion futures are never awaited.
        let writer = make_writer();
        for session in 0..100 {
            let (_ready_tx, ready_rx) = oneshot::channel::<TransportWriter>();
            let (comm_tx, _comm_rx) = mpsc::channel(4);
            drop(writer.stop());
            writer.start(session, ready_rx, comm_tx);
        }
        writer.stop().await;
    }

    #[tokio::test]
    async fn write_failure_reports_session_generation() {
        let writer = make_writer();
        let (sink, peer) = tcp_pair().await;
        drop(peer);
        let (ready_tx, ready_rx) = oneshot::channel();
        let (comm_tx, mut comm_rx) = mpsc::channel(4);
        writer.start(7, ready_rx, comm_tx);
        ready_tx.send(sink).ok().expect("deliver sink");

        // Keep writing until the dead socket surfaces the failure.
        for _ in 0..64 {
            writer
                .queue(OutboundMessage::regular(
                    pub_prefix("x", None, 1024),
                    None,
                    Bytes::from(vec![0u8; 1024]),
                ))
                .await;
            tokio::time::sleep(Duration::from_millis(5)).await;
            if let Ok((session, _err)) = comm_rx.try_recv() {
                assert_eq!(session, 7);
                return;
            }
        }
        panic!("writer never reported the broken transport");
    }
}
