//! Service discovery and backend selection.
//!
//! A [`Discovery`] source produces `network@host:port` addresses for an
//! [`XClient`](crate::XClient): either a fixed list, or a registry-backed
//! list refreshed over HTTP when it grows stale.

use crate::error::ClientError;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// How one address is chosen out of many.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectMode {
    /// Uniformly random.
    Random,
    /// Index modulo size, incremented per call.
    RoundRobin,
}

/// Registry-backed lists are refetched when older than this (10 seconds).
pub const DEFAULT_UPDATE_TTL: Duration = Duration::from_secs(10);

/// A source of backend addresses.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Forces the list up to date from the backing source, if any.
    async fn refresh(&self) -> Result<(), ClientError>;

    /// Replaces the list.
    fn update(&self, rpc_addrs: Vec<String>);

    /// One address, chosen by the selection mode.
    async fn get(&self, mode: SelectMode) -> Result<String, ClientError>;

    /// The whole current list.
    async fn get_all(&self) -> Result<Vec<String>, ClientError>;
}

/// Discovery over a fixed, caller-provided address list.
pub struct MultiServerDiscovery {
    rpc_addrs: RwLock<Vec<String>>,
    /// Round-robin position, starting at a random point.
    index: AtomicUsize,
}

impl MultiServerDiscovery {
    pub fn new(rpc_addrs: Vec<String>) -> Self {
        Self {
            rpc_addrs: RwLock::new(rpc_addrs),
            index: AtomicUsize::new(rand::thread_rng().gen_range(0..u32::MAX as usize)),
        }
    }

    fn pick(&self, mode: SelectMode) -> Result<String, ClientError> {
        let rpc_addrs = self.rpc_addrs.read();
        if rpc_addrs.is_empty() {
            return Err(ClientError::NoAvailableServers);
        }
        let chosen = match mode {
            SelectMode::Random => {
                &rpc_addrs[rand::thread_rng().gen_range(0..rpc_addrs.len())]
            }
            SelectMode::RoundRobin => {
                let i = self.index.fetch_add(1, Ordering::Relaxed);
                &rpc_addrs[i % rpc_addrs.len()]
            }
        };
        Ok(chosen.clone())
    }
}

#[async_trait]
impl Discovery for MultiServerDiscovery {
    async fn refresh(&self) -> Result<(), ClientError> {
        // The list is fixed; nothing to refresh from.
        Ok(())
    }

    fn update(&self, rpc_addrs: Vec<String>) {
        *self.rpc_addrs.write() = rpc_addrs;
    }

    async fn get(&self, mode: SelectMode) -> Result<String, ClientError> {
        self.pick(mode)
    }

    async fn get_all(&self) -> Result<Vec<String>, ClientError> {
        Ok(self.rpc_addrs.read().clone())
    }
}

/// Discovery polling a registry's HTTP surface.
///
/// The cached list is refetched on demand whenever it is older than the
/// update TTL; `update` resets the clock, `refresh` forces a fetch.
pub struct RegistryDiscovery {
    registry_url: String,
    service: String,
    servers: MultiServerDiscovery,
    ttl: Duration,
    last_update: Mutex<Option<Instant>>,
    http: reqwest::Client,
}

impl RegistryDiscovery {
    /// `registry_url` is the full URL of the registry path, e.g.
    /// `http://127.0.0.1:9999/_muxrpc_/registry`.
    pub fn new(
        registry_url: impl Into<String>,
        service: impl Into<String>,
        ttl: Option<Duration>,
    ) -> Self {
        Self {
            registry_url: registry_url.into(),
            service: service.into(),
            servers: MultiServerDiscovery::new(Vec::new()),
            ttl: ttl.unwrap_or(DEFAULT_UPDATE_TTL),
            last_update: Mutex::new(None),
            http: reqwest::Client::new(),
        }
    }

    async fn ensure_fresh(&self) -> Result<(), ClientError> {
        let stale = match *self.last_update.lock() {
            None => true,
            Some(at) => at.elapsed() >= self.ttl,
        };
        if stale {
            self.fetch().await?;
        }
        Ok(())
    }

    async fn fetch(&self) -> Result<(), ClientError> {
        let url = format!("{}?service={}", self.registry_url, self.service);
        tracing::debug!("refreshing server list from {}", url);

        let rpc_addrs: Vec<String> = self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        self.servers.update(rpc_addrs);
        *self.last_update.lock() = Some(Instant::now());
        Ok(())
    }
}

#[async_trait]
impl Discovery for RegistryDiscovery {
    async fn refresh(&self) -> Result<(), ClientError> {
        self.fetch().await
    }

    fn update(&self, rpc_addrs: Vec<String>) {
        self.servers.update(rpc_addrs);
        *self.last_update.lock() = Some(Instant::now());
    }

    async fn get(&self, mode: SelectMode) -> Result<String, ClientError> {
        self.ensure_fresh().await?;
        self.servers.pick(mode)
    }

    async fn get_all(&self) -> Result<Vec<String>, ClientError> {
        self.ensure_fresh().await?;
        self.servers.get_all().await
    }
}


#[cfg(test)]
mod registry_tests {
    use super::*;
    use crate::xclient::XClient;
    use muxrpc_protocol::Options;
    use muxrpc_registry::{heartbeat, run_http, Registry};
    use muxrpc_server::{Server, ServiceBuilder};
    use serde::{Deserialize, Serialize};
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tokio::sync::broadcast;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct SumArgs {
        a: i64,
        b: i64,
    }

    struct Arith;

    async fn spawn_registry(timeout: Duration) -> (String, broadcast::Sender<()>) {
        let registry = Arc::new(Registry::new(timeout));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let path = muxrpc_protocol::DEFAULT_REGISTRY_PATH.to_string();
        tokio::spawn(async move {
            let _ = run_http(registry, listener, path, shutdown_rx).await;
        });
        let url = format!("http://{}{}", addr, muxrpc_protocol::DEFAULT_REGISTRY_PATH);
        (url, shutdown_tx)
    }

    async fn spawn_arith() -> (String, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let rpc_addr = format!("tcp@{}", listener.local_addr().unwrap());
        let server = Server::new();
        server
            .register(
                ServiceBuilder::new(Arith)
                    .method("Sum", |_arith, args: SumArgs| async move {
                        Ok(args.a + args.b)
                    })
                    .build(),
            )
            .unwrap();
        let handle = tokio::spawn(async move {
            let _ = server.run(listener).await;
        });
        (rpc_addr, handle)
    }

    #[tokio::test]
    async fn test_registry_backed_discovery_end_to_end() {
        let (registry_url, _shutdown) = spawn_registry(Duration::from_secs(5)).await;

        let (addr1, h1) = spawn_arith().await;
        let (addr2, h2) = spawn_arith().await;
        let beat1 = heartbeat(&registry_url, "Arith", &addr1, Duration::from_millis(500))
            .await
            .unwrap();
        let beat2 = heartbeat(&registry_url, "Arith", &addr2, Duration::from_millis(500))
            .await
            .unwrap();

        let discovery = Arc::new(RegistryDiscovery::new(
            registry_url.clone(),
            "Arith",
            Some(Duration::from_millis(100)),
        ));

        let mut all = discovery.get_all().await.unwrap();
        all.sort();
        let mut expected = vec![addr1.clone(), addr2.clone()];
        expected.sort();
        assert_eq!(all, expected);

        let xclient = XClient::new(discovery, SelectMode::RoundRobin, Options::default());
        for _ in 0..4 {
            let sum: i64 = xclient.call("Arith.Sum", &SumArgs { a: 2, b: 3 }).await.unwrap();
            assert_eq!(sum, 5);
        }

        let sum: i64 = xclient
            .broadcast("Arith.Sum", &SumArgs { a: 20, b: 22 })
            .await
            .unwrap();
        assert_eq!(sum, 42);

        xclient.close().await;
        beat1.abort();
        beat2.abort();
        h1.abort();
        h2.abort();
    }

    #[tokio::test]
    async fn test_discovery_sees_expiry() {
        let (registry_url, _shutdown) = spawn_registry(Duration::from_millis(300)).await;
        let (addr, h) = spawn_arith().await;

        // One registration, no recurring heartbeat.
        let beat = heartbeat(&registry_url, "Arith", &addr, Duration::from_secs(3600))
            .await
            .unwrap();

        let discovery =
            RegistryDiscovery::new(registry_url, "Arith", Some(Duration::from_millis(50)));
        assert_eq!(discovery.get_all().await.unwrap(), vec![addr.clone()]);

        // Past the registry timeout the entry is gone from fresh fetches.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(discovery.get_all().await.unwrap().is_empty());
        assert!(matches!(
            discovery.get(SelectMode::Random).await,
            Err(ClientError::NoAvailableServers)
        ));

        beat.abort();
        h.abort();
    }

    #[tokio::test]
    async fn test_cached_list_served_within_ttl() {
        let (registry_url, shutdown) = spawn_registry(Duration::from_secs(5)).await;
        let (addr, h) = spawn_arith().await;
        let beat = heartbeat(&registry_url, "Arith", &addr, Duration::from_secs(3600))
            .await
            .unwrap();

        let discovery =
            RegistryDiscovery::new(registry_url, "Arith", Some(Duration::from_secs(30)));
        assert_eq!(discovery.get_all().await.unwrap(), vec![addr.clone()]);

        // Kill the registry; the cache is younger than the TTL, so reads
        // keep working without refetching.
        let _ = shutdown.send(());
        assert_eq!(discovery.get_all().await.unwrap(), vec![addr]);

        beat.abort();
        h.abort();
    }
}
