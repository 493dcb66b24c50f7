// Shared helpers for the integration tests.
use std::time::Duration;
use tokio::sync::mpsc;

use lark_client::{Event, Options};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Receives connection events recorded by the options' event callback.
pub struct Events {
    rx: mpsc::UnboundedReceiver<Event>,
}

impl Events {
    /// Wait until `wanted` arrives, skipping earlier events.
    pub async fn expect(&mut self, wanted: Event, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .unwrap_or_else(|| panic!("timed out waiting for {wanted:?}"));
            match tokio::time::timeout(remaining, self.rx.recv()).await {
                Ok(Some(event)) if event == wanted => return,
                Ok(Some(_)) => {}
                Ok(None) => panic!("event channel closed waiting for {wanted:?}"),
                Err(_) => panic!("timed out waiting for {wanted:?}"),
            }
        }
    }
}

/// Options wired to an event recorder, with test-friendly reconnect timing.
pub fn recording_options<I, S>(servers: I) -> (Options, Events)
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let mut options = Options::new(servers)
        .expect("options")
        .event_callback(move |event| {
            let _ = tx.send(event);
        });
    options.reconnect_wait = Duration::from_millis(100);
    options.reconnect_jitter = Duration::from_millis(10);
    options.connection_timeout = Duration::from_secs(1);
    options.max_reconnects = -1;
    (options, Events { rx })
}
