//! Endpoint pool for connection and reconnection attempts.
//!
//! The pool holds the configured servers plus addresses learned from server
//! INFO. Order is fixed at build time: preserved under `no_randomize`,
//! otherwise shuffled once. Learned entries carry a marker so a later
//! discovery can supersede them without touching configured entries.
use rand::Rng;
use rand::seq::SliceRandom;
use std::time::Duration;

use lark_transport::{Endpoint, Scheme};

#[derive(Debug, Clone)]
pub(crate) struct PoolEntry {
    pub(crate) endpoint: Endpoint,
    pub(crate) learned: bool,
    pub(crate) failed_attempts: u32,
}

pub(crate) struct EndpointPool {
    entries: Vec<PoolEntry>,
}

impl EndpointPool {
    pub(crate) fn new(servers: &[Endpoint], randomize: bool) -> Self {
        let mut entries: Vec<PoolEntry> = servers
            .iter()
            .map(|endpoint| PoolEntry {
                endpoint: endpoint.clone(),
                learned: false,
                failed_attempts: 0,
            })
            .collect();
        if randomize {
            entries.shuffle(&mut rand::thread_rng());
        }
        Self { entries }
    }

    /// Snapshot of candidate endpoints in pool order.
    pub(crate) fn candidates(&self) -> Vec<Endpoint> {
        self.entries
            .iter()
            .map(|entry| entry.endpoint.clone())
            .collect()
    }

    pub(crate) fn failed_attempts(&self, endpoint: &Endpoint) -> u32 {
        self.entries
            .iter()
            .find(|entry| entry.endpoint == *endpoint)
            .map_or(0, |entry| entry.failed_attempts)
    }

    pub(crate) fn record_failure(&mut self, endpoint: &Endpoint) {
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|entry| entry.endpoint == *endpoint)
        {
            entry.failed_attempts += 1;
        }
    }

    pub(crate) fn record_success(&mut self, endpoint: &Endpoint) {
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|entry| entry.endpoint == *endpoint)
        {
            entry.failed_attempts = 0;
        }
    }

    /// Every candidate has hit the per-endpoint attempt ceiling.
    pub(crate) fn exhausted(&self, max_attempts: i64) -> bool {
        if max_attempts < 0 {
            return false;
        }
        self.entries
            .iter()
            .all(|entry| i64::from(entry.failed_attempts) >= max_attempts)
    }

    /// Merge `connect_urls` from a server INFO. Learned entries absent from
    /// the new list are superseded; configured entries are always retained.
    /// Returns true when the pool changed.
    pub(crate) fn merge_discovered(&mut self, urls: &[String], scheme: Scheme) -> bool {
        let mut discovered = Vec::with_capacity(urls.len());
        for url in urls {
            match url.parse::<Endpoint>() {
                Ok(endpoint) => discovered.push(Endpoint { scheme, ..endpoint }),
                Err(err) => {
                    tracing::debug!(url = %url, error = %err, "ignoring unusable discovered url");
                }
            }
        }

        let before = self.entries.len();
        self.entries
            .retain(|entry| !entry.learned || discovered.contains(&entry.endpoint));
        let mut changed = self.entries.len() != before;

        for endpoint in discovered {
            let already_known = self
                .entries
                .iter()
                .any(|entry| entry.endpoint.addr() == endpoint.addr());
            if !already_known {
                self.entries.push(PoolEntry {
                    endpoint,
                    learned: true,
                    failed_attempts: 0,
                });
                changed = true;
            }
        }
        changed
    }

    #[cfg(test)]
    pub(crate) fn entries(&self) -> &[PoolEntry] {
        &self.entries
    }
}

/// Reconnect delay with uniform jitter added.
pub(crate) fn jittered(wait: Duration, jitter: Duration) -> Duration {
    if jitter.is_zero() {
        return wait;
    }
    let extra = rand::thread_rng().gen_range(0..=jitter.as_millis() as u64);
    wait + Duration::from_millis(extra)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints(addrs: &[&str]) -> Vec<Endpoint> {
        addrs.iter().map(|addr| addr.parse().expect("endpoint")).collect()
    }

    #[test]
    fn no_randomize_preserves_order() {
        let servers = endpoints(&["a:1", "b:2", "c:3"]);
        let pool = EndpointPool::new(&servers, false);
        assert_eq!(pool.candidates(), servers);
    }

    #[test]
    fn shuffle_keeps_the_same_members() {
        let servers = endpoints(&["a:1", "b:2", "c:3", "d:4", "e:5"]);
        let pool = EndpointPool::new(&servers, true);
        let mut shuffled = pool.candidates();
        shuffled.sort_by_key(|endpoint| endpoint.addr());
        let mut expected = servers;
        expected.sort_by_key(|endpoint| endpoint.addr());
        assert_eq!(shuffled, expected);
    }

    #[test]
    fn failure_accounting_and_exhaustion() {
        let servers = endpoints(&["a:1", "b:2"]);
        let mut pool = EndpointPool::new(&servers, false);
        assert!(!pool.exhausted(1));
        pool.record_failure(&servers[0]);
        assert_eq!(pool.failed_attempts(&servers[0]), 1);
        assert!(!pool.exhausted(1));
        pool.record_failure(&servers[1]);
        assert!(pool.exhausted(1));
        assert!(!pool.exhausted(-1));
        pool.record_success(&servers[0]);
        assert_eq!(pool.failed_attempts(&servers[0]), 0);
        assert!(!pool.exhausted(1));
    }

    #[test]
    fn merge_adds_learned_and_dedupes() {
        let servers = endpoints(&["a:1"]);
        let mut pool = EndpointPool::new(&servers, false);
        let changed = pool.merge_discovered(
            &["a:1".into(), "b:2".into(), "not a url ::".into()],
            Scheme::Plain,
        );
        assert!(changed);
        let entries = pool.entries();
        assert_eq!(entries.len(), 2);
        assert!(!entries[0].learned);
        assert!(entries[1].learned);
        assert_eq!(entries[1].endpoint.addr(), "b:2");

        // Same list again: nothing changes.
        assert!(!pool.merge_discovered(&["a:1".into(), "b:2".into()], Scheme::Plain));
    }

    #[test]
    fn rediscovery_supersedes_stale_learned_entries() {
        let servers = endpoints(&["a:1"]);
        let mut pool = EndpointPool::new(&servers, false);
        pool.merge_discovered(&["b:2".into()], Scheme::Plain);
        // New discovery no longer lists b:2; it is dropped, a:1 survives.
        let changed = pool.merge_discovered(&["c:3".into()], Scheme::Plain);
        assert!(changed);
        let addrs: Vec<String> = pool
            .candidates()
            .iter()
            .map(|endpoint| endpoint.addr())
            .collect();
        assert_eq!(addrs, vec!["a:1", "c:3"]);
    }

    #[test]
    fn learned_entries_inherit_the_session_scheme() {
        let servers = endpoints(&["tls://a:1"]);
        let mut pool = EndpointPool::new(&servers, false);
        pool.merge_discovered(&["b:2".into()], Scheme::Tls);
        assert_eq!(pool.entries()[1].endpoint.scheme, Scheme::Tls);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let wait = Duration::from_millis(100);
        for _ in 0..50 {
            let delay = jittered(wait, Duration::from_millis(20));
            assert!(delay >= wait);
            assert!(delay <= wait + Duration::from_millis(20));
        }
        assert_eq!(jittered(wait, Duration::ZERO), wait);
    }
}
