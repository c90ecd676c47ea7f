//! The server table.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Entries older than this are considered dead (5 minutes).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Liveness-filtered server table, keyed by service name and address.
///
/// An entry stays alive as long as its last heartbeat is younger than the
/// timeout; expired entries are deleted lazily while listing. A zero
/// timeout disables expiry.
pub struct Registry {
    timeout: Duration,
    servers: Mutex<HashMap<String, HashMap<String, Instant>>>,
}

impl Registry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            servers: Mutex::new(HashMap::new()),
        }
    }

    /// Adds a server or refreshes its last-seen time.
    pub fn register(&self, service: &str, rpc_addr: &str) {
        let mut servers = self.servers.lock();
        servers
            .entry(service.to_string())
            .or_default()
            .insert(rpc_addr.to_string(), Instant::now());
        tracing::debug!("registered {} for {}", rpc_addr, service);
    }

    /// Removes a server.
    pub fn deregister(&self, service: &str, rpc_addr: &str) {
        let mut servers = self.servers.lock();
        if let Some(entries) = servers.get_mut(service) {
            entries.remove(rpc_addr);
        }
        tracing::debug!("deregistered {} for {}", rpc_addr, service);
    }

    /// Live addresses for one service, sorted; expired entries are deleted
    /// in the same pass.
    pub fn alive(&self, service: &str) -> Vec<String> {
        let mut servers = self.servers.lock();
        let Some(entries) = servers.get_mut(service) else {
            return Vec::new();
        };

        let now = Instant::now();
        let timeout = self.timeout;
        let mut list = Vec::with_capacity(entries.len());

        entries.retain(|rpc_addr, last_seen| {
            if timeout.is_zero() || *last_seen + timeout > now {
                list.push(rpc_addr.clone());
                true
            } else {
                false
            }
        });

        list.sort_unstable();
        list
    }
}
