// Client options and their defaults.
use std::sync::Arc;
use std::time::Duration;

use lark_transport::Endpoint;

use crate::errors::{Error, Result};
use crate::events::Event;

pub(crate) const DEFAULT_MAX_RECONNECTS: i64 = 60;
pub(crate) const DEFAULT_RECONNECT_WAIT: Duration = Duration::from_secs(2);
pub(crate) const DEFAULT_RECONNECT_JITTER: Duration = Duration::from_millis(100);
pub(crate) const DEFAULT_RECONNECT_JITTER_TLS: Duration = Duration::from_secs(1);
pub(crate) const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(2);
pub(crate) const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(120);
pub(crate) const DEFAULT_MAX_PINGS_OUT: u32 = 2;
pub(crate) const DEFAULT_RECONNECT_BUFFER_SIZE: i64 = 8 * 1024 * 1024;
pub(crate) const DEFAULT_MAX_MESSAGES_IN_OUTGOING_QUEUE: usize = 5000;
pub(crate) const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;
pub(crate) const DEFAULT_SUBSCRIPTION_CAPACITY: usize = 64 * 1024;

// Upper bound on messages accumulated into one write batch.
pub(crate) const MAX_MESSAGES_PER_BATCH: usize = 1000;

pub type EventCallback = Arc<dyn Fn(Event) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&Error) + Send + Sync>;

/// Connection configuration.
///
/// Fields are public; `Options::new` fills in the defaults and the few
/// setters below cover the common adjustments.
///
/// ```
/// use lark_client::Options;
///
/// let options = Options::new(["plain://127.0.0.1:4222"]).expect("options");
/// assert_eq!(options.max_reconnects, 60);
/// ```
#[derive(Clone)]
pub struct Options {
    pub servers: Vec<Endpoint>,
    /// Preserve the configured endpoint order instead of shuffling once.
    pub no_randomize: bool,
    /// Total reconnect attempts across the pool before giving up; -1 is
    /// unlimited, 0 disables reconnection.
    pub max_reconnects: i64,
    pub reconnect_wait: Duration,
    pub reconnect_jitter: Duration,
    pub reconnect_jitter_tls: Duration,
    /// Ceiling for one attempt: TCP connect, TLS upgrade, and handshake.
    pub connection_timeout: Duration,
    /// Bytes of user publishes held while disconnected; 0 disables
    /// buffering, -1 is unlimited.
    pub reconnect_buffer_size: i64,
    pub max_messages_in_outgoing_queue: usize,
    pub discard_messages_when_outgoing_queue_full: bool,
    /// Serialized batch bytes before the writer flushes to the transport.
    pub buffer_size: usize,
    pub ping_interval: Duration,
    pub max_pings_out: u32,
    /// Require a TLS upgrade even for plaintext endpoint schemes.
    pub secure: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    pub token: Option<String>,
    /// Client name reported in CONNECT.
    pub name: Option<String>,
    /// Suppress delivery of this client's own publishes.
    pub no_echo: bool,
    pub verbose: bool,
    pub pedantic: bool,
    /// Pending message cap per subscription before the oldest is dropped.
    pub subscription_capacity: usize,
    /// Root certificates for `tls://` endpoints.
    pub tls_roots: Option<Arc<rustls::RootCertStore>>,
    pub event_callback: Option<EventCallback>,
    pub error_callback: Option<ErrorCallback>,
}

impl std::fmt::Debug for Options {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Options").finish_non_exhaustive()
    }
}

impl Options {
    pub fn new<I, S>(servers: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let servers = servers
            .into_iter()
            .map(|server| server.as_ref().parse::<Endpoint>().map_err(Error::from))
            .collect::<Result<Vec<_>>>()?;
        if servers.is_empty() {
            return Err(Error::NoServers);
        }
        Ok(Self {
            servers,
            no_randomize: false,
            max_reconnects: DEFAULT_MAX_RECONNECTS,
            reconnect_wait: DEFAULT_RECONNECT_WAIT,
            reconnect_jitter: DEFAULT_RECONNECT_JITTER,
            reconnect_jitter_tls: DEFAULT_RECONNECT_JITTER_TLS,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            reconnect_buffer_size: DEFAULT_RECONNECT_BUFFER_SIZE,
            max_messages_in_outgoing_queue: DEFAULT_MAX_MESSAGES_IN_OUTGOING_QUEUE,
            discard_messages_when_outgoing_queue_full: false,
            buffer_size: DEFAULT_BUFFER_SIZE,
            ping_interval: DEFAULT_PING_INTERVAL,
            max_pings_out: DEFAULT_MAX_PINGS_OUT,
            secure: false,
            username: None,
            password: None,
            token: None,
            name: None,
            no_echo: false,
            verbose: false,
            pedantic: false,
            subscription_capacity: DEFAULT_SUBSCRIPTION_CAPACITY,
            tls_roots: None,
            event_callback: None,
            error_callback: None,
        })
    }

    pub fn user_info(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn event_callback(mut self, callback: impl Fn(Event) + Send + Sync + 'static) -> Self {
        self.event_callback = Some(Arc::new(callback));
        self
    }

    pub fn error_callback(mut self, callback: impl Fn(&Error) + Send + Sync + 'static) -> Self {
        self.error_callback = Some(Arc::new(callback));
        self
    }

    /// Disable reconnection entirely.
    pub fn no_reconnect(mut self) -> Self {
        self.max_reconnects = 0;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lark_transport::Scheme;

    #[test]
    fn new_parses_endpoints() {
        let options =
            Options::new(["plain://a:4222", "tls://b:4443"]).expect("options");
        assert_eq!(options.servers.len(), 2);
        assert_eq!(options.servers[1].scheme, Scheme::Tls);
    }

    #[test]
    fn new_rejects_empty_server_list() {
        let err = Options::new(Vec::<String>::new()).expect_err("no servers");
        assert!(matches!(err, Error::NoServers));
    }

    #[test]
    fn new_rejects_bad_endpoint() {
        assert!(Options::new(["http://nope:1"]).is_err());
    }

    #[test]
    fn setters_chain() {
        let options = Options::new(["localhost"])
            .expect("options")
            .user_info("svc", "hunter2")
            .token("t0k3n")
            .no_reconnect();
        assert_eq!(options.username.as_deref(), Some("svc"));
        assert_eq!(options.token.as_deref(), Some("t0k3n"));
        assert_eq!(options.max_reconnects, 0);
    }
}
