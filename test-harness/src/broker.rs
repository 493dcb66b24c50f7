//! In-process mock broker speaking the line protocol over real TCP.
//!
//! Supports the subset the client exercises: INFO on accept, CONNECT,
//! PING/PONG, SUB/UNSUB with wildcard routing, PUB/HPUB fan-out, queue
//! groups, scripted INFO payloads, and a fault mode that answers the first
//! SUB with a malformed frame. `shutdown` releases the port so a test can
//! restart a broker at the same address.
use anyhow::{Context, Result};
use bytes::BytesMut;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::debug;

use crate::ops::{ClientOp, ClientProtocol, subject_matches};

#[derive(Debug, Clone)]
struct SubEntry {
    client: u64,
    sid: u64,
    subject: String,
    queue_group: Option<String>,
    remaining: Option<u64>,
}

#[derive(Default)]
struct SharedState {
    subs: Mutex<Vec<SubEntry>>,
    clients: Mutex<HashMap<u64, mpsc::UnboundedSender<Vec<u8>>>>,
    rr: AtomicUsize,
}

impl SharedState {
    fn route(&self, subject: &str, reply_to: Option<&str>, headers: Option<&[u8]>, payload: &[u8]) {
        let mut targets: Vec<SubEntry> = Vec::new();
        {
            let mut subs = self.subs.lock().expect("subs lock");
            let mut groups: HashMap<String, Vec<SubEntry>> = HashMap::new();
            for entry in subs.iter() {
                if !subject_matches(&entry.subject, subject) {
                    continue;
                }
                match &entry.queue_group {
                    Some(group) => groups.entry(group.clone()).or_default().push(entry.clone()),
                    None => targets.push(entry.clone()),
                }
            }
            // One delivery per queue group.
            for (_, members) in groups {
                let pick = self.rr.fetch_add(1, Ordering::Relaxed) % members.len();
                targets.push(members[pick].clone());
            }
            // Honor auto-unsubscribe budgets.
            for target in &targets {
                if let Some(entry) = subs
                    .iter_mut()
                    .find(|entry| entry.client == target.client && entry.sid == target.sid)
                {
                    if let Some(remaining) = &mut entry.remaining {
                        *remaining = remaining.saturating_sub(1);
                    }
                }
            }
            subs.retain(|entry| entry.remaining != Some(0));
        }

        let clients = self.clients.lock().expect("clients lock");
        for target in targets {
            let Some(sender) = clients.get(&target.client) else {
                continue;
            };
            let mut frame = Vec::with_capacity(64 + payload.len());
            match headers {
                Some(headers) => {
                    frame.extend_from_slice(b"HMSG ");
                    frame.extend_from_slice(subject.as_bytes());
                    frame.extend_from_slice(format!(" {}", target.sid).as_bytes());
                    if let Some(reply_to) = reply_to {
                        frame.extend_from_slice(format!(" {reply_to}").as_bytes());
                    }
                    frame.extend_from_slice(
                        format!(" {} {}\r\n", headers.len(), headers.len() + payload.len())
                            .as_bytes(),
                    );
                    frame.extend_from_slice(headers);
                }
                None => {
                    frame.extend_from_slice(b"MSG ");
                    frame.extend_from_slice(subject.as_bytes());
                    frame.extend_from_slice(format!(" {}", target.sid).as_bytes());
                    if let Some(reply_to) = reply_to {
                        frame.extend_from_slice(format!(" {reply_to}").as_bytes());
                    }
                    frame.extend_from_slice(format!(" {}\r\n", payload.len()).as_bytes());
                }
            }
            frame.extend_from_slice(payload);
            frame.extend_from_slice(b"\r\n");
            let _ = sender.send(frame);
        }
    }

    fn drop_client(&self, client: u64) {
        self.clients.lock().expect("clients lock").remove(&client);
        self.subs
            .lock()
            .expect("subs lock")
            .retain(|entry| entry.client != client);
    }
}

#[derive(Clone, Default)]
pub struct BrokerBuilder {
    port: u16,
    connect_urls: Vec<String>,
    malformed_after_sub: bool,
    verbose_ok: bool,
}

impl BrokerBuilder {
    /// Fixed listen port; 0 picks a free one.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Advertise these addresses in the INFO `connect_urls`.
    pub fn connect_urls(mut self, urls: impl IntoIterator<Item = String>) -> Self {
        self.connect_urls = urls.into_iter().collect();
        self
    }

    /// Answer the first SUB with a frame whose CR is not followed by LF.
    pub fn malformed_after_sub(mut self) -> Self {
        self.malformed_after_sub = true;
        self
    }

    /// Acknowledge CONNECT and publishes with +OK.
    pub fn verbose_ok(mut self) -> Self {
        self.verbose_ok = true;
        self
    }

    pub async fn start(self) -> Result<MockBroker> {
        let listener = TcpListener::bind(("127.0.0.1", self.port))
            .await
            .context("bind mock broker")?;
        let addr = listener.local_addr().context("local addr")?;
        let state = Arc::new(SharedState::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let accept_state = Arc::clone(&state);
        let options = Arc::new(self);
        let accept = tokio::spawn(run_accept_loop(
            listener,
            accept_state,
            options,
            shutdown_rx,
        ));
        debug!(%addr, "mock broker listening");
        Ok(MockBroker {
            addr,
            state,
            shutdown_tx,
            accept: Some(accept),
        })
    }
}

pub struct MockBroker {
    addr: SocketAddr,
    state: Arc<SharedState>,
    shutdown_tx: watch::Sender<bool>,
    accept: Option<JoinHandle<()>>,
}

impl MockBroker {
    pub fn builder() -> BrokerBuilder {
        BrokerBuilder::default()
    }

    /// Start on a random free port.
    pub async fn start() -> Result<Self> {
        Self::builder().start().await
    }

    /// Start on a specific port, e.g. to restart after a kill.
    pub async fn start_on(port: u16) -> Result<Self> {
        Self::builder().port(port).start().await
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Endpoint URL for client options.
    pub fn url(&self) -> String {
        format!("plain://127.0.0.1:{}", self.addr.port())
    }

    pub fn client_count(&self) -> usize {
        self.state.clients.lock().expect("clients lock").len()
    }

    /// Publish from the broker side, as if another client had sent it.
    pub fn inject(&self, subject: &str, payload: &[u8]) {
        self.state.route(subject, None, None, payload);
    }

    /// Send raw protocol bytes to every connected client, e.g. an
    /// asynchronous INFO update.
    pub fn broadcast_raw(&self, bytes: &[u8]) {
        let clients = self.state.clients.lock().expect("clients lock");
        for sender in clients.values() {
            let _ = sender.send(bytes.to_vec());
        }
    }

    /// Kill the broker: stop accepting, sever every client, free the port.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(accept) = self.accept.take() {
            let _ = accept.await;
        }
    }
}

async fn run_accept_loop(
    listener: TcpListener,
    state: Arc<SharedState>,
    options: Arc<BrokerBuilder>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let next_client = AtomicU64::new(1);
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            accepted = listener.accept() => {
                let Ok((stream, _)) = accepted else { break };
                let client = next_client.fetch_add(1, Ordering::Relaxed);
                connections.spawn(serve_client(
                    client,
                    stream,
                    Arc::clone(&state),
                    Arc::clone(&options),
                    shutdown_rx.clone(),
                ));
            }
        }
    }
    // Dropping the JoinSet aborts the per-client tasks and closes sockets.
    connections.abort_all();
    while connections.join_next().await.is_some() {}
}

async fn serve_client(
    client: u64,
    stream: TcpStream,
    state: Arc<SharedState>,
    options: Arc<BrokerBuilder>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let _ = stream.set_nodelay(true);
    let (mut read_half, mut write_half) = stream.into_split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    state
        .clients
        .lock()
        .expect("clients lock")
        .insert(client, out_tx.clone());

    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if write_half.write_all(&frame).await.is_err() {
                break;
            }
        }
    });

    let info = info_json(&options, client);
    let _ = out_tx.send(format!("INFO {info}\r\n").into_bytes());

    let mut protocol = ClientProtocol::default();
    let mut buf = BytesMut::with_capacity(16 * 1024);
    let mut sent_malformed = false;
    'serve: loop {
        loop {
            let op = match protocol.parse(&mut buf) {
                Ok(Some(op)) => op,
                Ok(None) => break,
                Err(err) => {
                    let _ = out_tx.send(
                        format!("-ERR 'Unknown Protocol Operation: {err}'\r\n").into_bytes(),
                    );
                    break 'serve;
                }
            };
            match op {
                ClientOp::Connect(_) => {
                    if options.verbose_ok {
                        let _ = out_tx.send(b"+OK\r\n".to_vec());
                    }
                }
                ClientOp::Ping => {
                    let _ = out_tx.send(b"PONG\r\n".to_vec());
                }
                ClientOp::Pong => {}
                ClientOp::Sub {
                    subject,
                    queue_group,
                    sid,
                } => {
                    state.subs.lock().expect("subs lock").push(SubEntry {
                        client,
                        sid,
                        subject,
                        queue_group,
                        remaining: None,
                    });
                    if options.malformed_after_sub && !sent_malformed {
                        sent_malformed = true;
                        // CR with no LF: un-frameable on purpose.
                        let _ = out_tx.send(b"MSG \rjunk".to_vec());
                    }
                }
                ClientOp::Unsub { sid, max_msgs } => {
                    let mut subs = state.subs.lock().expect("subs lock");
                    match max_msgs {
                        None => subs.retain(|entry| {
                            entry.client != client || entry.sid != sid
                        }),
                        Some(max) => {
                            if let Some(entry) = subs.iter_mut().find(|entry| {
                                entry.client == client && entry.sid == sid
                            }) {
                                entry.remaining = Some(max);
                            }
                        }
                    }
                }
                ClientOp::Pub {
                    subject,
                    reply_to,
                    payload,
                } => {
                    state.route(&subject, reply_to.as_deref(), None, &payload);
                    if options.verbose_ok {
                        let _ = out_tx.send(b"+OK\r\n".to_vec());
                    }
                }
                ClientOp::HPub {
                    subject,
                    reply_to,
                    headers,
                    payload,
                } => {
                    state.route(&subject, reply_to.as_deref(), Some(&headers), &payload);
                    if options.verbose_ok {
                        let _ = out_tx.send(b"+OK\r\n".to_vec());
                    }
                }
            }
        }

        tokio::select! {
            _ = shutdown_rx.changed() => break,
            read = read_half.read_buf(&mut buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            },
        }
    }

    state.drop_client(client);
    writer.abort();
    debug!(client, "mock broker client disconnected");
}

fn info_json(options: &BrokerBuilder, client: u64) -> String {
    let mut info = serde_json::json!({
        "server_id": format!("mock-{client}"),
        "server_name": "lark-mock",
        "version": "0.0.0-mock",
        "host": "127.0.0.1",
        "headers": true,
        "max_payload": 1_048_576,
        "proto": 1,
        "client_id": client,
    });
    if !options.connect_urls.is_empty() {
        info["connect_urls"] = serde_json::json!(options.connect_urls);
    }
    info.to_string()
}
