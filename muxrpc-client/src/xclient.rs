//! Multi-server client facade.
//!
//! An [`XClient`] composes single-connection [`Client`]s by backend address.
//! Addresses come from a [`Discovery`] source and are strings of the form
//! `network@host:port`, e.g. `tcp@127.0.0.1:9999` or `http@10.0.0.7:80`.

use crate::client::Client;
use crate::discovery::{Discovery, SelectMode};
use crate::error::ClientError;
use muxrpc_protocol::Options;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;

/// Dials an `network@host:port` address with the right transport.
pub async fn x_dial(rpc_addr: &str, options: Options) -> Result<Client, ClientError> {
    let (network, addr) = rpc_addr
        .split_once('@')
        .ok_or_else(|| ClientError::BadAddress(rpc_addr.to_string()))?;
    match network {
        "tcp" => Client::dial(addr, options).await,
        "http" => Client::dial_http(addr, options).await,
        _ => Err(ClientError::BadAddress(rpc_addr.to_string())),
    }
}

struct Inner {
    discovery: Arc<dyn Discovery>,
    options: Options,
    /// One cached client per backend address.
    clients: Mutex<HashMap<String, Client>>,
}

impl Inner {
    /// Returns a live cached client for the address, dialing if the cache
    /// holds nothing usable. A dead cached client is closed and replaced.
    async fn dial_cached(&self, rpc_addr: &str) -> Result<Client, ClientError> {
        let mut clients = self.clients.lock().await;

        if let Some(existing) = clients.get(rpc_addr) {
            if existing.is_available() {
                return Ok(existing.clone());
            }
            let dead = clients.remove(rpc_addr).expect("checked above");
            let _ = dead.close().await;
        }

        let client = x_dial(rpc_addr, self.options.clone()).await?;
        clients.insert(rpc_addr.to_string(), client.clone());
        Ok(client)
    }

    async fn call_addr<A, R>(
        &self,
        rpc_addr: &str,
        service_method: &str,
        args: &A,
    ) -> Result<R, ClientError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let client = self.dial_cached(rpc_addr).await?;
        client.call(service_method, args).await
    }
}

/// Multi-server client with pluggable discovery and selection.
pub struct XClient {
    inner: Arc<Inner>,
    mode: SelectMode,
}

impl XClient {
    pub fn new(discovery: Arc<dyn Discovery>, mode: SelectMode, options: Options) -> Self {
        Self {
            inner: Arc::new(Inner {
                discovery,
                options,
                clients: Mutex::new(HashMap::new()),
            }),
            mode,
        }
    }

    /// Calls one backend chosen by the selection mode.
    pub async fn call<A, R>(&self, service_method: &str, args: &A) -> Result<R, ClientError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let rpc_addr = self.inner.discovery.get(self.mode).await?;
        self.inner.call_addr(&rpc_addr, service_method, args).await
    }

    /// Calls every backend; the first successful reply wins.
    ///
    /// One task per address, each decoding into its own reply value. The
    /// first captured reply settles the broadcast and cancels the remaining
    /// calls by aborting their tasks (a dropped call removes its pending
    /// entry); failures are recorded but never cancel a sibling that could
    /// still answer. The aggregate is `Ok` if any backend succeeded,
    /// otherwise the first recorded error.
    pub async fn broadcast<A, R>(&self, service_method: &str, args: &A) -> Result<R, ClientError>
    where
        A: Serialize + Clone + Send + Sync + 'static,
        R: DeserializeOwned + Send + 'static,
    {
        let rpc_addrs = self.inner.discovery.get_all().await?;

        let mut tasks: JoinSet<Result<R, ClientError>> = JoinSet::new();
        for rpc_addr in rpc_addrs {
            let inner = Arc::clone(&self.inner);
            let service_method = service_method.to_string();
            let args = args.clone();
            tasks.spawn(async move {
                inner.call_addr(&rpc_addr, &service_method, &args).await
            });
        }

        let mut reply: Option<R> = None;
        let mut first_err: Option<ClientError> = None;

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(value)) => {
                    if reply.is_none() {
                        reply = Some(value);
                        tasks.abort_all();
                    }
                }
                Ok(Err(e)) => {
                    if first_err.is_none() {
                        tracing::debug!("broadcast {}: first failure: {}", service_method, e);
                        first_err = Some(e);
                    }
                }
                // An aborted sibling, not an outcome.
                Err(_) => {}
            }
        }

        match reply {
            Some(value) => Ok(value),
            None => Err(first_err.unwrap_or(ClientError::NoAvailableServers)),
        }
    }

    /// Closes every cached client.
    pub async fn close(&self) {
        let mut clients = self.inner.clients.lock().await;
        for (_, client) in clients.drain() {
            let _ = client.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::MultiServerDiscovery;
    use muxrpc_server::{Server, ServiceBuilder};
    use serde::Deserialize;
    use tokio::net::TcpListener;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct SumArgs {
        a: i64,
        b: i64,
    }

    struct Arith {
        tag: i64,
    }

    async fn spawn_arith(tag: i64) -> (String, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = format!("tcp@{}", listener.local_addr().unwrap());
        let server = Server::new();
        server
            .register(
                ServiceBuilder::new(Arith { tag })
                    .method("Sum", |_arith, args: SumArgs| async move {
                        Ok(args.a + args.b)
                    })
                    .method("Tag", |arith: Arc<Arith>, _args: ()| async move {
                        Ok(arith.tag)
                    })
                    .build(),
            )
            .unwrap();
        let handle = tokio::spawn(async move {
            let _ = server.run(listener).await;
        });
        (addr, handle)
    }

    #[tokio::test]
    async fn test_unicast_round_robin() {
        let (addr1, h1) = spawn_arith(1).await;
        let (addr2, h2) = spawn_arith(2).await;

        let discovery = Arc::new(MultiServerDiscovery::new(vec![addr1, addr2]));
        let xclient = XClient::new(discovery, SelectMode::RoundRobin, Options::default());

        let mut tags = Vec::new();
        for _ in 0..4 {
            let tag: i64 = xclient.call("Arith.Tag", &()).await.unwrap();
            tags.push(tag);
        }
        // Strict alternation, whatever the starting index.
        assert_eq!(tags[0], tags[2]);
        assert_eq!(tags[1], tags[3]);
        assert_ne!(tags[0], tags[1]);

        xclient.close().await;
        h1.abort();
        h2.abort();
    }

    #[tokio::test]
    async fn test_broadcast_first_reply_wins() {
        let (addr1, h1) = spawn_arith(1).await;
        let (addr2, h2) = spawn_arith(2).await;

        let discovery = Arc::new(MultiServerDiscovery::new(vec![addr1, addr2]));
        let xclient = XClient::new(discovery, SelectMode::Random, Options::default());

        let sum: i64 = xclient
            .broadcast("Arith.Sum", &SumArgs { a: 2, b: 3 })
            .await
            .unwrap();
        assert_eq!(sum, 5);

        xclient.close().await;
        h1.abort();
        h2.abort();
    }

    #[tokio::test]
    async fn test_broadcast_survives_one_dead_backend() {
        let (addr1, h1) = spawn_arith(1).await;

        // A listener that accepts and immediately drops: always fails.
        let dead_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = format!("tcp@{}", dead_listener.local_addr().unwrap());
        let dead = tokio::spawn(async move {
            loop {
                let _ = dead_listener.accept().await;
            }
        });

        let discovery = Arc::new(MultiServerDiscovery::new(vec![addr1.clone(), dead_addr]));
        let xclient = XClient::new(discovery, SelectMode::Random, Options::default());

        // The dead backend fails fast; the live one must still win.
        let sum: i64 = xclient
            .broadcast("Arith.Sum", &SumArgs { a: 2, b: 3 })
            .await
            .unwrap();
        assert_eq!(sum, 5);

        xclient.close().await;
        h1.abort();
        dead.abort();
    }

    #[tokio::test]
    async fn test_cached_client_replaced_after_close() {
        let (addr, h) = spawn_arith(1).await;
        let discovery = Arc::new(MultiServerDiscovery::new(vec![addr]));
        let xclient = XClient::new(discovery, SelectMode::Random, Options::default());

        let sum: i64 = xclient
            .call("Arith.Sum", &SumArgs { a: 1, b: 1 })
            .await
            .unwrap();
        assert_eq!(sum, 2);

        // Kill the cached connection; the next call must redial.
        xclient.close().await;

        let sum: i64 = xclient
            .call("Arith.Sum", &SumArgs { a: 2, b: 2 })
            .await
            .unwrap();
        assert_eq!(sum, 4);

        h.abort();
    }

    #[tokio::test]
    async fn test_bad_address_rejected() {
        let err = x_dial("127.0.0.1:9999", Options::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::BadAddress(_)));

        let err = x_dial("udp@127.0.0.1:9999", Options::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::BadAddress(_)));
    }
}
