//! HTTP surface of the registry.
//!
//! - `GET  <path>?service=NAME` answers a JSON array of live addresses
//! - `POST <path>` with `{"service":...,"addr":...}` registers or refreshes
//! - `DELETE <path>` with the same body removes the entry
//! - any other method answers 405; an unparseable body 412; an empty
//!   required field 500

use crate::error::RegistryError;
use crate::registry::Registry;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// Registration body for POST and DELETE.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registration {
    pub service: String,
    pub addr: String,
}

/// Runs the registry's HTTP server until shutdown.
pub async fn run_http(
    registry: Arc<Registry>,
    listener: TcpListener,
    path: String,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), RegistryError> {
    let local = listener.local_addr()?;
    let path: Arc<str> = path.into();
    tracing::info!("registry listening on http://{}{}", local, path);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, _) = match result {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::error!("registry accept error: {}", e);
                        continue;
                    }
                };

                let registry = Arc::clone(&registry);
                let path = Arc::clone(&path);
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = service_fn(move |req| {
                        let registry = Arc::clone(&registry);
                        let path = Arc::clone(&path);
                        async move { handle(req, registry, &path).await }
                    });
                    if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                        tracing::debug!("registry connection error: {}", e);
                    }
                });
            }
            _ = shutdown.recv() => {
                tracing::info!("registry shutting down");
                return Ok(());
            }
        }
    }
}

async fn handle(
    req: Request<Incoming>,
    registry: Arc<Registry>,
    path: &str,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    if req.uri().path() != path {
        return Ok(plain(StatusCode::NOT_FOUND, "not found"));
    }

    let method = req.method().clone();
    let response = match method {
        Method::GET => {
            let service = req
                .uri()
                .query()
                .and_then(|q| {
                    q.split('&')
                        .find_map(|pair| pair.strip_prefix("service="))
                })
                .unwrap_or("")
                .to_string();

            if service.is_empty() {
                return Ok(plain(StatusCode::INTERNAL_SERVER_ERROR, "service required"));
            }

            let alive = registry.alive(&service);
            let body = serde_json::to_vec(&alive).unwrap();
            Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "application/json")
                .body(Full::new(Bytes::from(body)))
                .unwrap()
        }
        Method::POST => match parse_registration(req).await? {
            Ok(p) => {
                registry.register(&p.service, &p.addr);
                plain(StatusCode::OK, "")
            }
            Err(status) => plain(status, ""),
        },
        Method::DELETE => match parse_registration(req).await? {
            Ok(p) => {
                registry.deregister(&p.service, &p.addr);
                plain(StatusCode::OK, "")
            }
            Err(status) => plain(status, ""),
        },
        _ => plain(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"),
    };

    Ok(response)
}

/// Reads and validates a registration body.
///
/// The outer error is transport-level; the inner one maps straight to a
/// response status: 412 for an unparseable body, 500 for an empty field.
async fn parse_registration(
    req: Request<Incoming>,
) -> Result<Result<Registration, StatusCode>, hyper::Error> {
    let body = req.into_body().collect().await?.to_bytes();
    let registration: Registration = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            tracing::debug!("unparseable registration body: {}", e);
            return Ok(Err(StatusCode::PRECONDITION_FAILED));
        }
    };
    if registration.service.is_empty() || registration.addr.is_empty() {
        return Ok(Err(StatusCode::INTERNAL_SERVER_ERROR));
    }
    Ok(Ok(registration))
}

fn plain(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}
