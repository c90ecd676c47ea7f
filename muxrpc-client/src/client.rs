//! Single-connection call multiplexer.
//!
//! One [`Client`] serves any number of concurrent callers over one stream.
//! Each call is assigned a sequence number and parked in the pending map; a
//! shared receive task reads response frames and completes the matching
//! entry. Sequence assignment and pending insertion strictly precede the
//! frame write, so the receive task can never observe a response for a
//! sequence it does not know about from this client.

use crate::error::ClientError;
use bytes::Bytes;
use muxrpc_protocol::{
    CodecKind, FrameReader, FrameWriter, Header, Options, DEFAULT_RPC_PATH,
};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;

/// Raw outcome of one call, delivered by the receive task.
enum Outcome {
    /// Undecoded reply body; typed decoding happens in [`Call::poll`].
    Reply(Bytes),
    /// Non-empty error string from the response header.
    ServerError(String),
    /// The connection died before a response arrived.
    Aborted(String),
}

struct Shared {
    codec: CodecKind,
    writer: tokio::sync::Mutex<FrameWriter<OwnedWriteHalf>>,
    /// Next sequence number; starts at 1.
    seq: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<Outcome>>>,
    /// User called close.
    closing: AtomicBool,
    /// The peer or the transport failed.
    shutdown: AtomicBool,
}

impl Shared {
    fn remove_pending(&self, seq: u64) -> Option<oneshot::Sender<Outcome>> {
        self.pending.lock().remove(&seq)
    }
}

/// An in-flight call: a future resolving to the typed reply.
///
/// Dropping a `Call` before completion cancels it: the pending entry is
/// removed, and a late response finds no entry and is discarded by the
/// receive task. Combined with `tokio::time::timeout`, this is how callers
/// put a deadline on a call.
pub struct Call<R> {
    seq: u64,
    rx: oneshot::Receiver<Outcome>,
    shared: Arc<Shared>,
    completed: bool,
    _reply: PhantomData<fn() -> R>,
}

impl<R> Call<R> {
    /// Sequence number assigned to this call.
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

impl<R: DeserializeOwned> Future for Call<R> {
    type Output = Result<R, ClientError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(result) => {
                this.completed = true;
                let outcome = match result {
                    Ok(outcome) => outcome,
                    Err(_) => return Poll::Ready(Err(ClientError::Shutdown)),
                };
                Poll::Ready(match outcome {
                    Outcome::Reply(bytes) => this
                        .shared
                        .codec
                        .decode_value(&bytes)
                        .map_err(ClientError::from),
                    Outcome::ServerError(message) => Err(ClientError::Server(message)),
                    Outcome::Aborted(reason) => Err(ClientError::ConnectionLost(reason)),
                })
            }
        }
    }
}

impl<R> Drop for Call<R> {
    fn drop(&mut self) {
        if !self.completed {
            self.shared.remove_pending(self.seq);
        }
    }
}

/// Multiplexing RPC client over one connection.
///
/// Cloneable across tasks; all clones share the connection, the sequence
/// counter, and the pending map.
#[derive(Clone)]
pub struct Client {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

impl Client {
    /// Dials a TCP server and performs the handshake.
    ///
    /// A nonzero connect timeout in the options bounds the whole dial,
    /// handshake included; on expiry the partially constructed connection is
    /// dropped and closed.
    pub async fn dial(addr: &str, options: Options) -> Result<Self, ClientError> {
        let timeout = options.connect_timeout();
        with_connect_timeout(timeout, Self::connect_plain(addr, options)).await
    }

    /// Dials a server behind the HTTP CONNECT upgrade.
    pub async fn dial_http(addr: &str, options: Options) -> Result<Self, ClientError> {
        let timeout = options.connect_timeout();
        with_connect_timeout(timeout, Self::connect_http(addr, options)).await
    }

    async fn connect_plain(addr: &str, options: Options) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true).ok();
        Self::from_stream(stream, options).await
    }

    async fn connect_http(addr: &str, options: Options) -> Result<Self, ClientError> {
        let mut stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true).ok();

        let request = format!("CONNECT {DEFAULT_RPC_PATH} HTTP/1.0\r\n\r\n");
        stream.write_all(request.as_bytes()).await?;

        // The acceptance line ends with a blank line; read byte-wise so no
        // RPC bytes are consumed past it.
        let mut response = Vec::new();
        let mut byte = [0u8; 1];
        while !response.ends_with(b"\n\n") {
            let n = stream.read(&mut byte).await?;
            if n == 0 {
                return Err(ClientError::HttpUpgrade(
                    "connection closed during upgrade".to_string(),
                ));
            }
            response.push(byte[0]);
            if response.len() > 1024 {
                return Err(ClientError::HttpUpgrade("oversized response".to_string()));
            }
        }

        let status = String::from_utf8_lossy(&response);
        if !status.contains("200") {
            return Err(ClientError::HttpUpgrade(
                status.lines().next().unwrap_or("").to_string(),
            ));
        }

        Self::from_stream(stream, options).await
    }

    /// Builds a client on an established stream: sends the handshake line
    /// and spawns the receive task.
    async fn from_stream(stream: TcpStream, options: Options) -> Result<Self, ClientError> {
        let (read_half, write_half) = stream.into_split();

        let mut writer = FrameWriter::new(write_half);
        writer.write_line(&options.to_line()?).await?;

        let shared = Arc::new(Shared {
            codec: options.codec,
            writer: tokio::sync::Mutex::new(writer),
            seq: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            closing: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        });

        let reader = FrameReader::new(read_half);
        tokio::spawn(receive_loop(Arc::clone(&shared), reader));

        Ok(Self { shared })
    }

    /// Starts a call and returns the in-flight handle.
    ///
    /// On a write failure the pending entry is removed and completed with
    /// the error; if the entry is already gone, the response raced the
    /// failure in and nothing more is done.
    pub async fn go<A, R>(&self, service_method: &str, args: &A) -> Result<Call<R>, ClientError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        if !self.is_available() {
            return Err(ClientError::Shutdown);
        }

        let body = self.shared.codec.encode_value(args)?;
        let seq = self.shared.seq.fetch_add(1, Ordering::Relaxed);
        let header_bytes = self
            .shared
            .codec
            .encode_value(&Header::request(service_method, seq))?;

        tracing::debug!("sending request seq={} method={}", seq, service_method);

        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().insert(seq, tx);

        let written = {
            let mut writer = self.shared.writer.lock().await;
            writer.write_frame(&header_bytes, &body).await
        };

        if let Err(e) = written {
            if self.shared.remove_pending(seq).is_some() {
                return Err(e.into());
            }
        }

        Ok(Call {
            seq,
            rx,
            shared: Arc::clone(&self.shared),
            completed: false,
            _reply: PhantomData,
        })
    }

    /// Calls a method and waits for the typed reply.
    ///
    /// Cancellation composes from outside: wrap in `tokio::time::timeout`
    /// (or select against any other signal) and the dropped call cleans up
    /// its pending entry.
    pub async fn call<A, R>(&self, service_method: &str, args: &A) -> Result<R, ClientError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        self.go(service_method, args).await?.await
    }

    /// Closes the connection. A second close reports the shutdown error.
    pub async fn close(&self) -> Result<(), ClientError> {
        if self.shared.closing.swap(true, Ordering::SeqCst) {
            return Err(ClientError::Shutdown);
        }
        self.shared.writer.lock().await.shutdown().await?;
        Ok(())
    }

    /// Whether the client can still issue calls.
    pub fn is_available(&self) -> bool {
        !self.shared.closing.load(Ordering::SeqCst) && !self.shared.shutdown.load(Ordering::SeqCst)
    }

    /// Number of in-flight calls.
    pub fn pending_count(&self) -> usize {
        self.shared.pending.lock().len()
    }
}

async fn with_connect_timeout<F>(timeout: std::time::Duration, fut: F) -> Result<Client, ClientError>
where
    F: Future<Output = Result<Client, ClientError>>,
{
    if timeout.is_zero() {
        return fut.await;
    }
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(ClientError::ConnectTimeout),
    }
}

/// Reads response frames and completes pending calls until the stream dies.
async fn receive_loop(shared: Arc<Shared>, mut reader: FrameReader<OwnedReadHalf>) {
    let reason = loop {
        let header_unit = match reader.read_unit().await {
            Ok(Some(unit)) => unit,
            Ok(None) => break "connection closed by peer".to_string(),
            Err(e) => break e.to_string(),
        };

        let header: Header = match shared.codec.decode_value(&header_unit) {
            Ok(header) => header,
            Err(e) => break e.to_string(),
        };

        let entry = shared.remove_pending(header.seq);

        // The body unit always follows the header; consuming it keeps the
        // stream aligned even when nobody is waiting for it.
        let body = match reader.read_unit().await {
            Ok(Some(unit)) => Ok(unit),
            Ok(None) => Err("connection closed by peer".to_string()),
            Err(e) => Err(e.to_string()),
        };

        match (entry, body) {
            (Some(tx), Ok(body)) => {
                // A dispatch or invocation error is per-call: deliver it and
                // keep serving the other outstanding sequences.
                let outcome = if header.error.is_empty() {
                    Outcome::Reply(body)
                } else {
                    Outcome::ServerError(header.error)
                };
                let _ = tx.send(outcome);
            }
            (Some(tx), Err(reason)) => {
                let _ = tx.send(Outcome::Aborted(reason.clone()));
                break reason;
            }
            (None, Ok(_)) => {
                // Cancelled or unknown sequence; the body has been discarded.
                tracing::debug!("discarding response for unknown seq {}", header.seq);
            }
            (None, Err(reason)) => break reason,
        }
    };

    shared.shutdown.store(true, Ordering::SeqCst);

    let drained: Vec<_> = {
        let mut pending = shared.pending.lock();
        pending.drain().collect()
    };
    if !drained.is_empty() {
        tracing::debug!("terminating {} pending calls: {}", drained.len(), reason);
    }
    for (_, tx) in drained {
        let _ = tx.send(Outcome::Aborted(reason.clone()));
    }
}
