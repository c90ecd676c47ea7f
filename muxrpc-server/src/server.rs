//! TCP server implementation.

use crate::error::ServerError;
use crate::service::{Fault, Service};
use bytes::Bytes;
use dashmap::DashMap;
use muxrpc_protocol::{CodecKind, FrameReader, FrameWriter, Header, Options};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinSet;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Maximum concurrent connections.
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_connections: 1000,
        }
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub requests_total: AtomicU64,
    pub errors_total: AtomicU64,
}

/// Multiplexed RPC server.
///
/// Registered services are shared by every connection; requests on one
/// connection are read sequentially and handled concurrently, with response
/// writes serialized by a per-connection send lock.
pub struct Server {
    config: ServerConfig,
    services: Arc<DashMap<String, Arc<Service>>>,
    stats: Arc<ServerStats>,
    shutdown: broadcast::Sender<()>,
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    pub fn new() -> Self {
        Self::with_config(ServerConfig::default())
    }

    pub fn with_config(config: ServerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            services: Arc::new(DashMap::new()),
            stats: Arc::new(ServerStats::default()),
            shutdown: shutdown_tx,
        }
    }

    /// Publishes a service. Duplicate names are rejected; overwriting a live
    /// service is not permitted.
    pub fn register(&self, service: Service) -> Result<(), ServerError> {
        use dashmap::mapref::entry::Entry;

        let name = service.name().to_string();
        match self.services.entry(name) {
            Entry::Occupied(e) => Err(ServerError::DuplicateService(e.key().clone())),
            Entry::Vacant(e) => {
                tracing::info!(
                    "registered service {} with methods {:?}",
                    service.name(),
                    service.method_names()
                );
                e.insert(Arc::new(service));
                Ok(())
            }
        }
    }

    /// Invocation count of one registered method.
    pub fn method_calls(&self, service: &str, method: &str) -> Option<u64> {
        self.services.get(service)?.calls(method)
    }

    /// Accepts connections until shutdown or an accept error.
    pub async fn run(&self, listener: TcpListener) -> Result<(), ServerError> {
        self.accept_loop(listener, false).await
    }

    /// Accepts connections that start with an HTTP CONNECT upgrade.
    pub async fn run_http(&self, listener: TcpListener) -> Result<(), ServerError> {
        self.accept_loop(listener, true).await
    }

    async fn accept_loop(&self, listener: TcpListener, http: bool) -> Result<(), ServerError> {
        let local = listener.local_addr()?;
        tracing::info!("server listening on {} (http={})", local, http);

        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, addr) = match result {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::error!("accept error: {}", e);
                            return Err(e.into());
                        }
                    };

                    if self.stats.connections_active.load(Ordering::Relaxed)
                        >= self.config.max_connections as u64
                    {
                        tracing::warn!("connection limit reached, rejecting {}", addr);
                        continue;
                    }

                    self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
                    self.stats.connections_active.fetch_add(1, Ordering::Relaxed);

                    stream.set_nodelay(true).ok();

                    let services = Arc::clone(&self.services);
                    let stats = Arc::clone(&self.stats);

                    tokio::spawn(async move {
                        tracing::debug!("client connected: {}", addr);

                        let result = if http {
                            crate::http::serve_upgrade(stream, &services, &stats).await
                        } else {
                            serve_connection(stream, &services, &stats).await
                        };

                        if let Err(e) = result {
                            tracing::debug!("connection {} error: {}", addr, e);
                            stats.errors_total.fetch_add(1, Ordering::Relaxed);
                        }
                        stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                        tracing::debug!("client disconnected: {}", addr);
                    });
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("server shutting down");
                    return Ok(());
                }
            }
        }
    }

    /// Serves one already-accepted stream. Used by the accept loops and by
    /// transports that hand over a hijacked connection.
    pub async fn serve_conn<S>(&self, stream: S) -> Result<(), ServerError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        serve_connection(stream, &self.services, &self.stats).await
    }

    /// Stops the accept loops.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }
}

/// Response writer shared by every handler task of one connection.
///
/// One lock spans the whole header+body write, so a response is never
/// interleaved with another.
pub(crate) struct ResponseWriter<W> {
    codec: CodecKind,
    writer: Mutex<FrameWriter<W>>,
}

impl<W: AsyncWrite + Unpin> ResponseWriter<W> {
    fn new(codec: CodecKind, writer: FrameWriter<W>) -> Self {
        Self {
            codec,
            writer: Mutex::new(writer),
        }
    }

    async fn send_reply(
        &self,
        service_method: &str,
        seq: u64,
        body: &[u8],
    ) -> Result<(), ServerError> {
        let header = Header::request(service_method, seq);
        self.send(&header, body).await
    }

    async fn send_error(
        &self,
        service_method: &str,
        seq: u64,
        error: &str,
    ) -> Result<(), ServerError> {
        let mut header = Header::request(service_method, seq);
        header.error = error.to_string();
        let body = match self.codec.empty_body() {
            Ok(b) => b,
            Err(e) => {
                self.close().await;
                return Err(e.into());
            }
        };
        self.send(&header, &body).await
    }

    async fn send(&self, header: &Header, body: &[u8]) -> Result<(), ServerError> {
        let header_bytes = match self.codec.encode_value(header) {
            Ok(b) => b,
            Err(e) => {
                // An encoding failure must make further use of the
                // connection impossible.
                self.close().await;
                return Err(e.into());
            }
        };
        let mut writer = self.writer.lock().await;
        writer.write_frame(&header_bytes, body).await?;
        Ok(())
    }

    async fn close(&self) {
        let _ = self.writer.lock().await.shutdown().await;
    }
}

/// Serves the RPC protocol on one stream: handshake, then the request loop.
pub(crate) async fn serve_connection<S>(
    stream: S,
    services: &DashMap<String, Arc<Service>>,
    stats: &ServerStats,
) -> Result<(), ServerError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = FrameReader::new(read_half);

    // The handshake line is mandatory framing. A bad or missing one closes
    // the connection without a response: no sequence is known yet.
    let line = match reader.read_line().await? {
        Some(line) => line,
        None => return Ok(()),
    };
    let options = match Options::from_line(&line) {
        Ok(options) => options,
        Err(e) => {
            tracing::warn!("rejecting connection: {}", e);
            return Ok(());
        }
    };

    let codec = options.codec;
    let handle_timeout = options.handle_timeout();
    let writer = Arc::new(ResponseWriter::new(codec, FrameWriter::new(write_half)));
    let mut handlers: JoinSet<()> = JoinSet::new();

    loop {
        let header_unit = match reader.read_unit().await {
            Ok(Some(unit)) => unit,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("read header: {}", e);
                break;
            }
        };

        // A header that does not decode leaves no usable sequence; that is
        // fatal for the connection.
        let header: Header = match codec.decode_value(&header_unit) {
            Ok(header) => header,
            Err(e) => {
                tracing::debug!("decode header: {}", e);
                break;
            }
        };

        stats.requests_total.fetch_add(1, Ordering::Relaxed);

        // The body unit always follows, even when the name will not resolve;
        // consuming it keeps the stream aligned.
        let body = match reader.read_unit().await {
            Ok(Some(unit)) => unit,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("read body: {}", e);
                break;
            }
        };

        let invocation = match resolve(services, &header, codec, body) {
            Ok(fut) => fut,
            Err(message) => {
                tracing::debug!("dispatch {}: {}", header.service_method, message);
                if let Err(e) = writer
                    .send_error(&header.service_method, header.seq, &message)
                    .await
                {
                    tracing::debug!("send dispatch error: {}", e);
                }
                continue;
            }
        };

        let writer = Arc::clone(&writer);
        let service_method = header.service_method;
        let seq = header.seq;

        handlers.spawn(async move {
            let outcome = if handle_timeout.is_zero() {
                invocation.await
            } else {
                run_with_timeout(invocation, handle_timeout).await
            };

            let sent = match outcome {
                Ok(reply) => writer.send_reply(&service_method, seq, &reply).await,
                Err(fault) => {
                    writer
                        .send_error(&service_method, seq, fault.message())
                        .await
                }
            };
            if let Err(e) = sent {
                tracing::debug!("send response for seq {}: {}", seq, e);
            }
        });
    }

    // Drain outstanding handlers before closing the connection.
    while handlers.join_next().await.is_some() {}
    writer.close().await;
    Ok(())
}

/// Races an invocation against the handle timeout.
///
/// On timeout the invocation task is abandoned, not killed: it may still
/// finish, but only the race winner responds, so its result is discarded.
async fn run_with_timeout(
    invocation: impl std::future::Future<Output = Result<Vec<u8>, Fault>> + Send + 'static,
    timeout: Duration,
) -> Result<Vec<u8>, Fault> {
    let mut task = tokio::spawn(invocation);
    tokio::select! {
        _ = tokio::time::sleep(timeout) => Err(Fault::new(format!(
            "request handle timeout: expect within {timeout:?}"
        ))),
        joined = &mut task => match joined {
            Ok(result) => result,
            Err(e) => Err(Fault::new(format!("handler aborted: {e}"))),
        },
    }
}

/// Resolves a request header to a started invocation.
///
/// Failures here are per-request: the caller answers them on the request's
/// sequence and the connection stays open.
fn resolve(
    services: &DashMap<String, Arc<Service>>,
    header: &Header,
    codec: CodecKind,
    body: Bytes,
) -> Result<
    std::pin::Pin<Box<dyn std::future::Future<Output = Result<Vec<u8>, Fault>> + Send>>,
    String,
> {
    let (service_name, method_name) = header.split_name().map_err(|e| e.to_string())?;

    let service = services
        .get(service_name)
        .map(|s| Arc::clone(&s))
        .ok_or_else(|| format!("unknown service {service_name}"))?;

    service
        .invoke(method_name, codec, body)
        .ok_or_else(|| format!("unknown method {}", header.service_method))
}
