//! Reader task: feeds transport bytes through the protocol parser and hands
//! each operation to the connection.
use bytes::BytesMut;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::AsyncReadExt;
use tokio::sync::{oneshot, watch};
use tracing::debug;

use lark_transport::TransportReader;
use lark_wire::Protocol;

use crate::errors::Error;

use super::connection::ConnectionInner;
use super::writer::CommSender;

/// Transport read half plus any bytes consumed ahead during the handshake.
pub(crate) type ReaderReady = (TransportReader, BytesMut);

struct TaskState {
    running: Arc<AtomicBool>,
    done: watch::Receiver<bool>,
    cancel: watch::Sender<bool>,
}

pub(crate) struct Reader {
    buffer_size: usize,
    state: Mutex<TaskState>,
}

impl Reader {
    pub(crate) fn new(buffer_size: usize) -> Self {
        let (done_tx, done_rx) = watch::channel(true);
        drop(done_tx);
        Self {
            buffer_size,
            state: Mutex::new(TaskState {
                running: Arc::new(AtomicBool::new(false)),
                done: done_rx,
                cancel: watch::channel(false).0,
            }),
        }
    }

    pub(crate) fn start(
        &self,
        connection: Arc<ConnectionInner>,
        session: u64,
        ready: oneshot::Receiver<ReaderReady>,
        comm_tx: CommSender,
    ) {
        let running = Arc::new(AtomicBool::new(true));
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);
        {
            let mut state = self.state.lock().expect("reader start/stop lock");
            state.running = Arc::clone(&running);
            state.done = done_rx;
            state.cancel = cancel_tx;
        }
        let buffer_size = self.buffer_size;
        tokio::spawn(async move {
            let result = tokio::select! {
                result = run_reader(&connection, buffer_size, &running, ready) => result,
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

    /// Interrupt the task even while it is blocked on a transport read.
    pub(crate) fn stop(&self) -> impl Future<Output = ()> + Send + use<> {
        let done = {
            let state = self.state.lock().expect("reader start/stop lock");
            state.running.store(false, Ordering::Relaxed);
            let _ = state.cancel.send(true);
            state.done.clone()
        };
        async move {
            let mut done = done;
            let _ = done.wait_for(|finished| *finished).await;
        }
    }
}

async fn run_reader(
    connection: &Arc<ConnectionInner>,
    buffer_size: usize,
    running: &AtomicBool,
    ready: oneshot::Receiver<ReaderReady>,
) -> Result<(), Error> {
    // A dropped sender means the session was torn down before the handshake
    // finished; exit without reporting.
    let Ok((mut source, leftover)) = ready.await else {
        return Ok(());
    };
    let mut protocol = Protocol::new();
    let mut buf = leftover;
    buf.reserve(buffer_size);

    while running.load(Ordering::Relaxed) {
        // Drain every complete operation before reading again.
        loop {
            match protocol.parse(&mut buf) {
                Ok(Some(op)) => connection.handle_op(op),
                Ok(None) => break,
                Err(err) => {
                    debug!(error = %err, "protocol error on inbound stream");
                    return Err(err.into());
                }
            }
        }

        match source.read_buf(&mut buf).await {
            Ok(0) => return Err(Error::Disconnected),
            Ok(n) => connection.stats().register_read(n),
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}
