//! HTTP CONNECT upgrade onto the RPC serving loop.
//!
//! A client opens a plain HTTP connection, sends a CONNECT request, and on
//! the fixed acceptance line the same stream switches to the binary
//! protocol. Only CONNECT is accepted; anything else is answered with 405
//! and the connection closes.

use crate::error::ServerError;
use crate::server::serve_connection;
use crate::service::Service;
use crate::ServerStats;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Acceptance line written after a successful CONNECT.
pub const CONNECTED_LINE: &[u8] = b"HTTP/1.0 200 Connected to RPC\n\n";

const METHOD_NOT_ALLOWED: &[u8] = b"HTTP/1.0 405 Method Not Allowed\r\n\
Content-Type: text/plain; charset=utf-8\r\n\r\n405 must CONNECT\n";

/// Upper bound on the request head we are willing to buffer.
const MAX_HEAD_SIZE: usize = 8 * 1024;

/// Reads the HTTP request head, upgrades on CONNECT, then serves RPC.
pub(crate) async fn serve_upgrade<S>(
    mut stream: S,
    services: &DashMap<String, Arc<Service>>,
    stats: &ServerStats,
) -> Result<(), ServerError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];

    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        head.extend_from_slice(&buf[..n]);

        if head.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        if head.len() > MAX_HEAD_SIZE {
            tracing::warn!("http upgrade: request head too large");
            return Ok(());
        }
    }

    let request_line = match head.split(|&b| b == b'\r').next() {
        Some(line) => String::from_utf8_lossy(line).to_string(),
        None => String::new(),
    };
    let method = request_line.split_whitespace().next().unwrap_or("");

    if method != "CONNECT" {
        tracing::debug!("http upgrade: refusing method {:?}", method);
        stream.write_all(METHOD_NOT_ALLOWED).await?;
        stream.flush().await?;
        return Ok(());
    }

    stream.write_all(CONNECTED_LINE).await?;
    stream.flush().await?;

    serve_connection(stream, services, stats).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::ServiceBuilder;
    use crate::Server;
    use muxrpc_protocol::{CodecKind, Header, Options};
    use serde::{Deserialize, Serialize};
    use tokio::io::AsyncReadExt;

    struct Echo;

    #[derive(Serialize, Deserialize)]
    struct Text {
        s: String,
    }

    fn upgrade_server() -> Server {
        let server = Server::new();
        server
            .register(
                ServiceBuilder::new(Echo)
                    .method("Say", |_echo, args: Text| async move { Ok(args.s) })
                    .build(),
            )
            .unwrap();
        server
    }

    async fn read_unit(stream: &mut tokio::net::TcpStream) -> Vec<u8> {
        let mut prefix = [0u8; 4];
        stream.read_exact(&mut prefix).await.unwrap();
        let len = u32::from_be_bytes(prefix) as usize;
        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).await.unwrap();
        payload
    }

    #[tokio::test]
    async fn test_connect_upgrade_then_rpc() {
        let server = upgrade_server();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let serving = tokio::spawn(async move { server.run_http(listener).await });

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"CONNECT /_muxrpc_ HTTP/1.0\r\n\r\n")
            .await
            .unwrap();

        // Acceptance line ends with a blank line.
        let mut accepted = Vec::new();
        let mut byte = [0u8; 1];
        while !accepted.ends_with(b"\n\n") {
            stream.read_exact(&mut byte).await.unwrap();
            accepted.push(byte[0]);
        }
        assert!(String::from_utf8_lossy(&accepted).contains("200 Connected to RPC"));

        // Now the stream speaks the binary protocol.
        let codec = CodecKind::Json;
        stream
            .write_all(&Options::default().to_line().unwrap())
            .await
            .unwrap();
        stream.write_all(b"\n").await.unwrap();

        let header = codec.encode_value(&Header::request("Echo.Say", 1)).unwrap();
        let body = codec
            .encode_value(&Text {
                s: "hi".to_string(),
            })
            .unwrap();
        for unit in [&header, &body] {
            stream
                .write_all(&(unit.len() as u32).to_be_bytes())
                .await
                .unwrap();
            stream.write_all(unit).await.unwrap();
        }

        let response_header = read_unit(&mut stream).await;
        let header: Header = codec.decode_value(&response_header).unwrap();
        assert!(header.error.is_empty());

        let response_body = read_unit(&mut stream).await;
        let echoed: String = codec.decode_value(&response_body).unwrap();
        assert_eq!(echoed, "hi");

        serving.abort();
    }

    #[tokio::test]
    async fn test_non_connect_gets_405() {
        let server = upgrade_server();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let serving = tokio::spawn(async move { server.run_http(listener).await });

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /_muxrpc_ HTTP/1.0\r\n\r\n")
            .await
            .unwrap();

        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        let text = String::from_utf8_lossy(&response);
        assert!(text.starts_with("HTTP/1.0 405"));
        assert!(text.contains("must CONNECT"));

        serving.abort();
    }
}
