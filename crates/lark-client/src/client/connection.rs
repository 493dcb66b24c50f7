//! Connection runtime: owns the transport sessions, the reader/writer tasks,
//! the subscription registry, and the reconnect loop.
//!
//! # Design notes
//! One supervisor task serializes all recovery. The reader and writer report
//! failures tagged with their session generation; a report from a session
//! that is no longer active is discarded, so one outage never triggers two
//! reconnects and a stale task cannot kill a healthy session.
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};
use uuid::Uuid;

use lark_transport::{Endpoint, Scheme, Transport};
use lark_wire::{
    CRLF, ConnectInfo, Headers, Message, Protocol, ServerInfo, ServerOp, connect_line, ping_line,
    pong_line, pub_prefix, hpub_prefix, sub_line, unsub_line,
};

use crate::config::{EventCallback, Options};
use crate::errors::{Error, Result, classify_server_error, validate_subject};
use crate::events::{ConnectionState, Event};
use crate::stats::{ClientStats, Statistics};

use super::reader::Reader;
use super::reconnect::{EndpointPool, jittered};
use super::subscriptions::{
    Delivery, Dispatcher, Entry, PendingQueue, Subscription, SubscriptionRegistry, Target,
};
use super::write_queue::OutboundMessage;
use super::writer::{CommSender, Writer};

const TEARDOWN_WAIT: Duration = Duration::from_secs(1);

/// A handle to one broker connection. Cheap to clone; all clones share the
/// same runtime.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

pub(crate) struct ConnectionInner {
    options: Options,
    state_tx: watch::Sender<ConnectionState>,
    writer: Arc<Writer>,
    reader: Reader,
    registry: SubscriptionRegistry,
    pool: Mutex<EndpointPool>,
    server_info: Mutex<ServerInfo>,
    connected_endpoint: Mutex<Option<Endpoint>>,
    stats: Arc<ClientStats>,
    sid_counter: AtomicU64,
    session_counter: AtomicU64,
    active_session: AtomicU64,
    pings_out: AtomicU32,
    closed: AtomicBool,
    // Body bytes of user publishes accepted since the current outage began.
    reconnect_buffered: AtomicU64,
    pong_waiters: Mutex<VecDeque<oneshot::Sender<()>>>,
    requests: Mutex<HashMap<String, oneshot::Sender<Message>>>,
    inbox_prefix: String,
    inbox_sid: Mutex<Option<u64>>,
    // Serializes subscribe against the resubscribe replay so a subscription
    // is never both replayed and individually announced, nor lost between.
    resub_lock: Mutex<()>,
    dispatcher_queues: Mutex<Vec<Arc<PendingQueue>>>,
    comm_tx: CommSender,
    events_tx: mpsc::UnboundedSender<Event>,
}

impl Connection {
    /// Connect to the first reachable endpoint in the pool.
    pub async fn connect(options: Options) -> Result<Connection> {
        let (comm_tx, comm_rx) = mpsc::channel(16);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_events(options.event_callback.clone(), events_rx));

        let inner = Arc::new(ConnectionInner::new(options, comm_tx, events_tx));
        inner.initial_connect().await?;

        tokio::spawn(run_supervisor(Arc::clone(&inner), comm_rx));
        tokio::spawn(run_ping_timer(Arc::clone(&inner)));
        Ok(Connection { inner })
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Watch channel mirroring every state transition.
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn statistics(&self) -> Statistics {
        self.inner.stats.snapshot()
    }

    /// The endpoint currently connected, if any.
    pub fn connected_url(&self) -> Option<String> {
        self.inner
            .connected_endpoint
            .lock()
            .expect("endpoint lock")
            .as_ref()
            .map(Endpoint::to_string)
    }

    pub fn server_info(&self) -> ServerInfo {
        self.inner.server_info.lock().expect("server info lock").clone()
    }

    pub async fn publish(&self, subject: &str, payload: impl Into<Bytes>) -> Result<()> {
        self.inner
            .publish_message(subject, None, None, payload.into())
            .await
    }

    pub async fn publish_with_reply(
        &self,
        subject: &str,
        reply_to: &str,
        payload: impl Into<Bytes>,
    ) -> Result<()> {
        self.inner
            .publish_message(subject, Some(reply_to), None, payload.into())
            .await
    }

    pub async fn publish_with_headers(
        &self,
        subject: &str,
        headers: &Headers,
        payload: impl Into<Bytes>,
    ) -> Result<()> {
        self.inner
            .publish_message(subject, None, Some(headers), payload.into())
            .await
    }

    /// Create a pull subscription; messages buffer until `next` is called.
    pub async fn subscribe(&self, subject: &str) -> Result<Subscription> {
        self.subscribe_inner(subject, None).await
    }

    /// Queue-group variant: the server delivers each message to one member.
    pub async fn subscribe_queue(&self, subject: &str, queue_group: &str) -> Result<Subscription> {
        self.subscribe_inner(subject, Some(queue_group)).await
    }

    async fn subscribe_inner(
        &self,
        subject: &str,
        queue_group: Option<&str>,
    ) -> Result<Subscription> {
        let queue = Arc::new(PendingQueue::new(self.inner.options.subscription_capacity));
        let sid = self.inner.register_subscription(
            subject,
            queue_group,
            Target::Queue(Arc::clone(&queue)),
            true,
        )?;
        Ok(Subscription {
            sid,
            subject: subject.to_string(),
            queue_group: queue_group.map(str::to_string),
            queue,
            connection: Arc::downgrade(&self.inner),
        })
    }

    /// Create a dispatcher: a group of push subscriptions sharing one
    /// handler task. The handler runs messages strictly one at a time.
    pub fn create_dispatcher<F, Fut>(&self, handler: F) -> Dispatcher
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let queue = Arc::new(PendingQueue::new(self.inner.options.subscription_capacity));
        self.inner
            .dispatcher_queues
            .lock()
            .expect("dispatcher queues lock")
            .push(Arc::clone(&queue));
        let handler_queue = Arc::clone(&queue);
        tokio::spawn(async move {
            while let Ok(message) = handler_queue.pop(None).await {
                handler(message).await;
            }
        });
        Dispatcher {
            queue,
            sids: Mutex::new(Vec::new()),
            connection: Arc::downgrade(&self.inner),
        }
    }

    /// Publish with a private reply inbox and await the first response.
    pub async fn request(
        &self,
        subject: &str,
        payload: impl Into<Bytes>,
        timeout: Duration,
    ) -> Result<Message> {
        self.inner.ensure_inbox()?;
        let token = Uuid::new_v4().simple().to_string();
        let reply_to = format!("{}.{token}", self.inner.inbox_prefix);
        let (tx, rx) = oneshot::channel();
        self.inner
            .requests
            .lock()
            .expect("requests lock")
            .insert(token.clone(), tx);

        if let Err(err) = self
            .inner
            .publish_message(subject, Some(&reply_to), None, payload.into())
            .await
        {
            self.inner.requests.lock().expect("requests lock").remove(&token);
            return Err(err);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(message)) => Ok(message),
            Ok(Err(_)) => Err(Error::Closed),
            Err(_) => {
                // Expire the slot; a late reply is discarded.
                self.inner.requests.lock().expect("requests lock").remove(&token);
                Err(Error::Timeout)
            }
        }
    }

    /// Round-trip a PING/PONG, proving every prior publish was transmitted.
    pub async fn flush(&self, timeout: Duration) -> Result<()> {
        if self.inner.closed.load(Ordering::Relaxed) {
            return Err(Error::Closed);
        }
        let (tx, rx) = oneshot::channel();
        self.inner
            .pong_waiters
            .lock()
            .expect("pong waiters lock")
            .push_back(tx);
        self.inner
            .writer
            .queue_internal(OutboundMessage::protocol(ping_line()));
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(Error::Disconnected),
            Err(_) => Err(Error::Timeout),
        }
    }

    /// Unsubscribe everything, flush what is queued, then close.
    pub async fn drain(&self, timeout: Duration) -> Result<()> {
        if self.inner.closed.load(Ordering::Relaxed) {
            return Err(Error::Closed);
        }
        for sid in self.inner.registry.all_sids() {
            let _ = self.inner.unsubscribe_sid(sid, None);
        }
        let flushed = self.flush(timeout).await;
        self.close().await;
        flushed
    }

    /// Preemptive shutdown: tasks are cancelled, pending requests fail with
    /// `Closed`, the transport is released.
    pub async fn close(&self) {
        self.inner.close_internal().await;
    }
}

impl ConnectionInner {
    fn new(
        options: Options,
        comm_tx: CommSender,
        events_tx: mpsc::UnboundedSender<Event>,
    ) -> Self {
        let stats = Arc::new(ClientStats::default());
        // `secure` forces a TLS upgrade even on plaintext endpoint schemes.
        let mut servers = options.servers.clone();
        if options.secure {
            for endpoint in &mut servers {
                if endpoint.scheme == Scheme::Plain {
                    endpoint.scheme = Scheme::Tls;
                }
            }
        }
        let pool = EndpointPool::new(&servers, !options.no_randomize);
        let writer = Arc::new(Writer::new(
            options.max_messages_in_outgoing_queue,
            options.discard_messages_when_outgoing_queue_full,
            options.buffer_size,
            Arc::clone(&stats),
        ));
        let reader = Reader::new(options.buffer_size);
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            options,
            state_tx,
            writer,
            reader,
            registry: SubscriptionRegistry::default(),
            pool: Mutex::new(pool),
            server_info: Mutex::new(ServerInfo::default()),
            connected_endpoint: Mutex::new(None),
            stats,
            sid_counter: AtomicU64::new(0),
            session_counter: AtomicU64::new(0),
            active_session: AtomicU64::new(0),
            pings_out: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            reconnect_buffered: AtomicU64::new(0),
            pong_waiters: Mutex::new(VecDeque::new()),
            requests: Mutex::new(HashMap::new()),
            inbox_prefix: format!("_INBOX.{}", Uuid::new_v4().simple()),
            inbox_sid: Mutex::new(None),
            resub_lock: Mutex::new(()),
            dispatcher_queues: Mutex::new(Vec::new()),
            comm_tx,
            events_tx,
        }
    }

    pub(crate) fn stats(&self) -> &ClientStats {
        &self.stats
    }

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        debug!(?state, "connection state");
        self.state_tx.send_replace(state);
    }

    fn emit(&self, event: Event) {
        let _ = self.events_tx.send(event);
    }

    fn notify_error(&self, err: &Error) {
        if let Some(callback) = &self.options.error_callback {
            callback(err);
        }
    }

    async fn initial_connect(self: &Arc<Self>) -> Result<()> {
        self.set_state(ConnectionState::Connecting);
        let candidates = self.pool.lock().expect("pool lock").candidates();
        for endpoint in candidates {
            match self.establish(&endpoint).await {
                Ok((transport, info, leftover)) => {
                    let discovered = self.install_session(transport, info, &endpoint, leftover);
                    self.set_state(ConnectionState::Connected);
                    self.emit(Event::Connected);
                    if discovered {
                        self.emit(Event::DiscoveredServers);
                    }
                    return Ok(());
                }
                Err(err @ (Error::AuthFailed(_) | Error::AuthViolation(_))) => {
                    self.closed.store(true, Ordering::Relaxed);
                    self.set_state(ConnectionState::Closed);
                    return Err(err);
                }
                Err(err) => {
                    debug!(endpoint = %endpoint, error = %err, "connect attempt failed");
                    self.pool.lock().expect("pool lock").record_failure(&endpoint);
                    self.stats.register_exception();
                }
            }
        }
        self.closed.store(true, Ordering::Relaxed);
        self.set_state(ConnectionState::Closed);
        Err(Error::NoServers)
    }

    /// TCP connect, INFO, optional TLS upgrade, CONNECT/PING/PONG — all
    /// bounded by `connection_timeout` and serialized before any task runs.
    async fn establish(
        &self,
        endpoint: &Endpoint,
    ) -> Result<(Transport, ServerInfo, BytesMut)> {
        tokio::time::timeout(
            self.options.connection_timeout,
            self.establish_inner(endpoint),
        )
        .await
        .map_err(|_| Error::Timeout)?
    }

    async fn establish_inner(
        &self,
        endpoint: &Endpoint,
    ) -> Result<(Transport, ServerInfo, BytesMut)> {
        let mut transport =
            Transport::connect(endpoint, self.options.connection_timeout).await?;
        let mut protocol = Protocol::new();
        let mut buf = BytesMut::with_capacity(self.options.buffer_size);

        let info = loop {
            match protocol.parse(&mut buf)? {
                Some(ServerOp::Info(info)) => break info,
                Some(other) => {
                    return Err(Error::Protocol(format!("expected INFO, got {other:?}")));
                }
                None => {
                    if transport.read_buf(&mut buf).await? == 0 {
                        return Err(Error::Disconnected);
                    }
                }
            }
        };

        if info.tls_required && endpoint.scheme == Scheme::Plain {
            return Err(Error::Tls("server requires a tls connection".into()));
        }
        if endpoint.scheme != Scheme::Plain {
            if !buf.is_empty() {
                return Err(Error::Protocol(
                    "unexpected plaintext after INFO before tls upgrade".into(),
                ));
            }
            let roots = self
                .options
                .tls_roots
                .clone()
                .unwrap_or_else(|| Arc::new(rustls::RootCertStore::empty()));
            transport = transport.upgrade_to_secure(roots).await?;
        }

        let connect = self.connect_info(endpoint);
        let mut out = BytesMut::with_capacity(256);
        out.put_slice(&connect_line(&connect));
        out.put_slice(CRLF);
        out.put_slice(&ping_line());
        out.put_slice(CRLF);
        transport.write_all(&out).await?;
        transport.flush().await?;

        loop {
            match protocol.parse(&mut buf)? {
                Some(ServerOp::Pong) => break,
                Some(ServerOp::Ok) | Some(ServerOp::Info(_)) => {}
                Some(ServerOp::Ping) => {
                    transport.write_all(b"PONG\r\n").await?;
                }
                Some(ServerOp::Err(reason)) => {
                    return Err(classify_server_error(&reason)
                        .unwrap_or(Error::Protocol(reason)));
                }
                Some(ServerOp::Msg(_)) => {
                    return Err(Error::Protocol(
                        "message delivered before handshake completed".into(),
                    ));
                }
                None => {
                    if transport.read_buf(&mut buf).await? == 0 {
                        return Err(Error::Disconnected);
                    }
                }
            }
        }
        Ok((transport, info, buf))
    }

    fn connect_info(&self, endpoint: &Endpoint) -> ConnectInfo {
        ConnectInfo {
            verbose: self.options.verbose,
            pedantic: self.options.pedantic,
            tls_required: endpoint.scheme != Scheme::Plain,
            auth_token: self.options.token.clone(),
            user: self.options.username.clone(),
            pass: self.options.password.clone(),
            name: self.options.name.clone(),
            echo: !self.options.no_echo,
            ..ConnectInfo::default()
        }
    }

    /// Wire a fresh transport into reader and writer tasks. Returns whether
    /// the INFO carried previously unknown endpoints.
    fn install_session(
        self: &Arc<Self>,
        transport: Transport,
        info: ServerInfo,
        endpoint: &Endpoint,
        leftover: BytesMut,
    ) -> bool {
        let discovered = {
            let mut pool = self.pool.lock().expect("pool lock");
            pool.record_success(endpoint);
            if info.connect_urls.is_empty() {
                false
            } else {
                pool.merge_discovered(&info.connect_urls, endpoint.scheme)
            }
        };
        *self.server_info.lock().expect("server info lock") = info;
        *self.connected_endpoint.lock().expect("endpoint lock") = Some(endpoint.clone());
        self.pings_out.store(0, Ordering::Relaxed);

        let session = self.session_counter.fetch_add(1, Ordering::Relaxed) + 1;
        self.active_session.store(session, Ordering::Relaxed);

        let (reader_tx, reader_rx) = oneshot::channel();
        let (writer_tx, writer_rx) = oneshot::channel();
        self.reader
            .start(Arc::clone(self), session, reader_rx, self.comm_tx.clone());
        self.writer.start(session, writer_rx, self.comm_tx.clone());

        let (read_half, write_half) = transport.split();
        let _ = reader_tx.send((read_half, leftover));
        let _ = writer_tx.send(write_half);
        discovered
    }

    pub(crate) fn register_subscription(
        &self,
        subject: &str,
        queue_group: Option<&str>,
        target: Target,
        owns_queue: bool,
    ) -> Result<u64> {
        validate_subject(subject)?;
        if let Some(queue_group) = queue_group {
            validate_subject(queue_group)?;
        }
        if self.closed.load(Ordering::Relaxed) {
            return Err(Error::Closed);
        }
        let sid = self.sid_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let entry = Entry {
            subject: subject.to_string(),
            queue_group: queue_group.map(str::to_string),
            target,
            owns_queue,
            max_msgs: None,
            delivered: 0,
        };
        let _guard = self.resub_lock.lock().expect("resub lock");
        self.registry.insert(sid, entry);
        if self.state() == ConnectionState::Connected {
            self.writer
                .queue_internal(OutboundMessage::protocol(sub_line(subject, queue_group, sid)));
        }
        // While reconnecting, the replay announces this subscription.
        Ok(sid)
    }

    pub(crate) fn unsubscribe_sid(&self, sid: u64, after: Option<u64>) -> Result<()> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(Error::Closed);
        }
        let connected = self.state() == ConnectionState::Connected;
        match after {
            None => {
                if let Some(entry) = self.registry.remove(sid) {
                    if entry.owns_queue {
                        if let Target::Queue(queue) = &entry.target {
                            queue.close();
                        }
                    }
                    if connected {
                        self.writer
                            .queue_internal(OutboundMessage::protocol(unsub_line(sid, None)));
                    }
                }
            }
            Some(max) => {
                if let Some(entry) = self.registry.set_max(sid, max) {
                    // Limit already satisfied locally.
                    if entry.owns_queue {
                        if let Target::Queue(queue) = &entry.target {
                            queue.close();
                        }
                    }
                    if connected {
                        self.writer
                            .queue_internal(OutboundMessage::protocol(unsub_line(sid, None)));
                    }
                } else if connected {
                    self.writer
                        .queue_internal(OutboundMessage::protocol(unsub_line(sid, Some(max))));
                }
            }
        }
        Ok(())
    }

    fn ensure_inbox(&self) -> Result<()> {
        let mut inbox_sid = self.inbox_sid.lock().expect("inbox lock");
        if inbox_sid.is_none() {
            let sid = self.register_subscription(
                &format!("{}.*", self.inbox_prefix),
                None,
                Target::Inbox,
                false,
            )?;
            *inbox_sid = Some(sid);
        }
        Ok(())
    }

    pub(crate) async fn publish_message(
        &self,
        subject: &str,
        reply_to: Option<&str>,
        headers: Option<&Headers>,
        payload: Bytes,
    ) -> Result<()> {
        validate_subject(subject)?;
        if let Some(reply_to) = reply_to {
            validate_subject(reply_to)?;
        }
        let state = self.state();
        if state == ConnectionState::Closed {
            return Err(Error::Closed);
        }

        let payload_len = payload.len();
        let headers_block = headers.map(Headers::encode);
        let prefix = match &headers_block {
            Some(block) => hpub_prefix(
                subject,
                reply_to,
                block.len(),
                block.len() + payload_len,
            ),
            None => pub_prefix(subject, reply_to, payload_len),
        };
        let message = OutboundMessage::regular(prefix, headers_block, payload);

        if state == ConnectionState::Connected {
            let max_payload = self
                .server_info
                .lock()
                .expect("server info lock")
                .max_payload;
            if max_payload > 0 && payload_len as i64 > max_payload {
                return Err(Error::MaxPayloadExceeded {
                    size: payload_len,
                    max: max_payload,
                });
            }
        } else {
            // Not connected: the publish lands in the reconnect buffer,
            // subject to the configured byte budget.
            let limit = self.options.reconnect_buffer_size;
            if limit == 0 {
                return Err(Error::IllegalState(
                    "connection is down and reconnect buffering is disabled".into(),
                ));
            }
            if limit > 0 {
                let body = message.body_len() as u64;
                let mut buffered = self.reconnect_buffered.load(Ordering::Relaxed);
                loop {
                    if buffered + body > limit as u64 {
                        return Err(Error::IllegalState(format!(
                            "reconnect buffer exhausted: {buffered} bytes held, limit {limit}"
                        )));
                    }
                    match self.reconnect_buffered.compare_exchange(
                        buffered,
                        buffered + body,
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    ) {
                        Ok(_) => break,
                        Err(actual) => buffered = actual,
                    }
                }
            }
        }

        if !self.writer.queue(message).await {
            self.stats.register_dropped(1);
        }
        Ok(())
    }

    /// Dispatch one inbound operation from the reader.
    pub(crate) fn handle_op(self: &Arc<Self>, op: ServerOp) {
        match op {
            ServerOp::Msg(message) => self.handle_msg(message),
            ServerOp::Ping => {
                self.writer
                    .queue_internal(OutboundMessage::protocol(pong_line()));
            }
            ServerOp::Pong => {
                self.pings_out.store(0, Ordering::Relaxed);
                let waiter = self
                    .pong_waiters
                    .lock()
                    .expect("pong waiters lock")
                    .pop_front();
                if let Some(waiter) = waiter {
                    let _ = waiter.send(());
                }
            }
            ServerOp::Ok => {}
            ServerOp::Err(reason) => self.handle_server_error(reason),
            ServerOp::Info(info) => self.handle_info(info),
        }
    }

    fn handle_msg(&self, message: Message) {
        self.stats.in_msgs.fetch_add(1, Ordering::Relaxed);
        match self.registry.deliver(message) {
            Delivery::Delivered | Delivery::Unknown => {}
            Delivery::Inbox(message) => {
                let Some(token) = message.subject.rsplit('.').next() else {
                    return;
                };
                let waiter = self
                    .requests
                    .lock()
                    .expect("requests lock")
                    .remove(token);
                if let Some(waiter) = waiter {
                    let _ = waiter.send(message);
                }
                // A late reply after the requester timed out is discarded.
            }
            Delivery::SlowConsumer { sid, dropped } => {
                self.stats.register_dropped(1);
                self.notify_error(&Error::SlowConsumer { sid, dropped });
            }
        }
    }

    fn handle_info(&self, info: ServerInfo) {
        let scheme = self
            .connected_endpoint
            .lock()
            .expect("endpoint lock")
            .as_ref()
            .map_or(Scheme::Plain, |endpoint| endpoint.scheme);
        let discovered = if info.connect_urls.is_empty() {
            false
        } else {
            self.pool
                .lock()
                .expect("pool lock")
                .merge_discovered(&info.connect_urls, scheme)
        };
        let lame_duck = info.lame_duck_mode;
        *self.server_info.lock().expect("server info lock") = info;
        if discovered {
            self.emit(Event::DiscoveredServers);
        }
        if lame_duck {
            self.emit(Event::LameDuck);
        }
    }

    fn handle_server_error(self: &Arc<Self>, reason: String) {
        self.stats.register_exception();
        match classify_server_error(&reason) {
            Some(fatal) => {
                warn!(reason = %reason, "fatal server error");
                self.notify_error(&fatal);
                // The close must not run on the reader task it is about to
                // cancel.
                let inner = Arc::clone(self);
                tokio::spawn(async move {
                    inner.close_internal().await;
                });
            }
            None => {
                debug!(reason = %reason, "server error");
                self.notify_error(&Error::Protocol(reason));
            }
        }
    }

    /// Recovery entry point. `session` identifies the transport generation
    /// that observed the failure; stale reports are ignored.
    async fn handle_comm_issue(self: &Arc<Self>, session: u64, err: Error) {
        if self.closed.load(Ordering::Relaxed) {
            return;
        }
        if self
            .active_session
            .compare_exchange(session, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(session, "ignoring failure report from inactive session");
            return;
        }
        warn!(error = %err, "communication issue, recovering");
        self.stats.register_exception();
        self.notify_error(&err);

        self.teardown_tasks().await;
        self.fail_pong_waiters();
        *self.connected_endpoint.lock().expect("endpoint lock") = None;
        self.reconnect_buffered.store(0, Ordering::Relaxed);
        self.set_state(ConnectionState::Disconnected);
        self.emit(Event::Disconnected);

        if self.options.max_reconnects == 0 {
            self.close_internal().await;
            return;
        }
        self.set_state(ConnectionState::Reconnecting);
        self.writer.set_reconnect_mode(true);
        self.run_reconnect_loop().await;
    }

    async fn run_reconnect_loop(self: &Arc<Self>) {
        let max = self.options.max_reconnects;
        let mut attempts: i64 = 0;
        let mut closed_watch = self.state_tx.subscribe();
        loop {
            let candidates = self.pool.lock().expect("pool lock").candidates();
            for endpoint in candidates {
                if self.closed.load(Ordering::Relaxed) {
                    return;
                }
                if max >= 0 && attempts >= max {
                    self.close_internal().await;
                    return;
                }
                let endpoint_failures = self
                    .pool
                    .lock()
                    .expect("pool lock")
                    .failed_attempts(&endpoint);
                if max >= 0 && i64::from(endpoint_failures) >= max {
                    continue;
                }

                let jitter = if endpoint.scheme == Scheme::Plain {
                    self.options.reconnect_jitter
                } else {
                    self.options.reconnect_jitter_tls
                };
                tokio::select! {
                    _ = tokio::time::sleep(jittered(self.options.reconnect_wait, jitter)) => {}
                    _ = closed_watch.wait_for(|state| *state == ConnectionState::Closed) => {
                        return;
                    }
                }
                if self.closed.load(Ordering::Relaxed) {
                    return;
                }

                attempts += 1;
                match self.establish(&endpoint).await {
                    Ok((transport, info, leftover)) => {
                        self.finish_reconnect(transport, info, &endpoint, leftover);
                        return;
                    }
                    Err(err @ (Error::AuthFailed(_) | Error::AuthViolation(_))) => {
                        self.notify_error(&err);
                        self.close_internal().await;
                        return;
                    }
                    Err(err) => {
                        debug!(endpoint = %endpoint, error = %err, "reconnect attempt failed");
                        self.pool
                            .lock()
                            .expect("pool lock")
                            .record_failure(&endpoint);
                        self.stats.register_exception();
                    }
                }
            }
            let pool_exhausted = self.pool.lock().expect("pool lock").exhausted(max);
            if max >= 0 && (attempts >= max || pool_exhausted) {
                self.close_internal().await;
                return;
            }
        }
    }

    fn finish_reconnect(
        self: &Arc<Self>,
        transport: Transport,
        info: ServerInfo,
        endpoint: &Endpoint,
        leftover: BytesMut,
    ) {
        let discovered = self.install_session(transport, info, endpoint, leftover);
        self.stats.register_reconnect();

        // Replay every live subscription onto the reconnect queue so SUBs
        // reach the wire before any buffered user publish.
        {
            let _guard = self.resub_lock.lock().expect("resub lock");
            for replay in self.registry.replay_snapshot() {
                self.writer.queue_internal(OutboundMessage::protocol(sub_line(
                    &replay.subject,
                    replay.queue_group.as_deref(),
                    replay.sid,
                )));
                if let Some(remaining) = replay.remaining {
                    self.writer.queue_internal(OutboundMessage::protocol(unsub_line(
                        replay.sid,
                        Some(remaining),
                    )));
                }
            }
            self.set_state(ConnectionState::Connected);
        }
        self.writer.set_reconnect_mode(false);
        self.reconnect_buffered.store(0, Ordering::Relaxed);

        self.emit(Event::Reconnected);
        self.emit(Event::Resubscribed);
        if discovered {
            self.emit(Event::DiscoveredServers);
        }
    }

    async fn teardown_tasks(&self) {
        let stop_writer = self.writer.stop();
        let stop_reader = self.reader.stop();
        let _ = tokio::time::timeout(TEARDOWN_WAIT, async {
            tokio::join!(stop_writer, stop_reader);
        })
        .await;
    }

    fn fail_pong_waiters(&self) {
        // Dropping the senders resolves every waiter with Disconnected.
        self.pong_waiters
            .lock()
            .expect("pong waiters lock")
            .clear();
    }

    async fn close_internal(self: &Arc<Self>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.active_session.store(0, Ordering::Relaxed);
        self.set_state(ConnectionState::Closed);
        self.teardown_tasks().await;
        self.fail_pong_waiters();
        self.requests.lock().expect("requests lock").clear();
        self.registry.clear();
        for queue in self
            .dispatcher_queues
            .lock()
            .expect("dispatcher queues lock")
            .drain(..)
        {
            queue.close();
        }
        *self.connected_endpoint.lock().expect("endpoint lock") = None;
        self.emit(Event::Closed);
        // Wake the supervisor so it can observe the closed state and exit.
        let _ = self.comm_tx.try_send((0, Error::Closed));
    }
}

async fn run_supervisor(
    inner: Arc<ConnectionInner>,
    mut comm_rx: mpsc::Receiver<(u64, Error)>,
) {
    while let Some((session, err)) = comm_rx.recv().await {
        if inner.closed.load(Ordering::Relaxed) {
            break;
        }
        inner.handle_comm_issue(session, err).await;
        if inner.closed.load(Ordering::Relaxed) {
            break;
        }
    }
}

async fn run_events(callback: Option<EventCallback>, mut events_rx: mpsc::UnboundedReceiver<Event>) {
    while let Some(event) = events_rx.recv().await {
        debug!(?event, "connection event");
        if let Some(callback) = &callback {
            callback(event);
        }
    }
}

async fn run_ping_timer(inner: Arc<ConnectionInner>) {
    if inner.options.ping_interval.is_zero() {
        return;
    }
    let mut interval = tokio::time::interval(inner.options.ping_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.tick().await;
    loop {
        interval.tick().await;
        if inner.closed.load(Ordering::Relaxed) {
            return;
        }
        if inner.state() != ConnectionState::Connected {
            continue;
        }
        let outstanding = inner.pings_out.fetch_add(1, Ordering::Relaxed) + 1;
        if outstanding > inner.options.max_pings_out {
            // The server stopped answering; treat the transport as dead.
            let session = inner.active_session.load(Ordering::Relaxed);
            let _ = inner.comm_tx.send((session, Error::Timeout)).await;
            continue;
        }
        inner
            .writer
            .queue_internal(OutboundMessage::protocol(ping_line()));
    }
}
