//! Service registration and method dispatch.
//!
//! A [`Service`] exposes the methods of one receiver object under a service
//! name. Method handlers are typed async closures erased behind a uniform
//! bytes-in/bytes-out signature: the wrapper decodes the argument with the
//! connection's codec, invokes the user function on the shared receiver, and
//! encodes the reply. The argument must deserialize, the reply must
//! serialize, and the result must be `Result<Reply, Fault>`; methods not
//! meeting those bounds do not compile, which is where the eligibility rules
//! are enforced.

use bytes::Bytes;
use muxrpc_protocol::CodecKind;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Error a service method hands back to the remote caller.
///
/// The message travels in the response header's error field; the connection
/// stays open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault(String);

impl Fault {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for Fault {}

impl From<String> for Fault {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for Fault {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

/// Result type for service methods.
pub type MethodResult<R> = Result<R, Fault>;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

type MethodFn = Box<dyn Fn(CodecKind, Bytes) -> BoxFuture<Result<Vec<u8>, Fault>> + Send + Sync>;

/// One callable method: the erased handler plus an invocation counter.
struct Method {
    handler: MethodFn,
    calls: AtomicU64,
}

/// A named set of methods bound to one receiver.
pub struct Service {
    name: String,
    methods: HashMap<String, Method>,
}

impl Service {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_method(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }

    /// Registered method names, sorted.
    pub fn method_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Invocation count of one method.
    pub fn calls(&self, method: &str) -> Option<u64> {
        self.methods
            .get(method)
            .map(|m| m.calls.load(Ordering::Relaxed))
    }

    /// Starts an invocation: decode, call, encode.
    ///
    /// Returns `None` when the method does not exist. The returned future is
    /// `'static`: it owns clones of the receiver and the argument bytes, so
    /// it can be driven on its own task.
    pub fn invoke(
        &self,
        method: &str,
        codec: CodecKind,
        body: Bytes,
    ) -> Option<BoxFuture<Result<Vec<u8>, Fault>>> {
        let m = self.methods.get(method)?;
        m.calls.fetch_add(1, Ordering::Relaxed);
        Some((m.handler)(codec, body))
    }
}

/// Builder assembling a [`Service`] from a receiver and its methods.
///
/// The service name defaults to the receiver's concrete type name.
pub struct ServiceBuilder<S> {
    receiver: Arc<S>,
    name: String,
    methods: HashMap<String, Method>,
}

impl<S: Send + Sync + 'static> ServiceBuilder<S> {
    pub fn new(receiver: S) -> Self {
        Self {
            receiver: Arc::new(receiver),
            name: short_type_name::<S>().to_string(),
            methods: HashMap::new(),
        }
    }

    /// Overrides the service name.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Registers one method.
    ///
    /// Re-registering a name replaces the previous handler; duplicate
    /// *service* names are rejected at server registration instead.
    pub fn method<A, R, F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(Arc<S>, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = MethodResult<R>> + Send + 'static,
    {
        let receiver = Arc::clone(&self.receiver);
        let f = Arc::new(f);

        let handler: MethodFn = Box::new(move |codec, body| {
            let receiver = Arc::clone(&receiver);
            let f = Arc::clone(&f);
            Box::pin(async move {
                let args: A = codec
                    .decode_value(&body)
                    .map_err(|e| Fault::new(format!("decode arguments: {e}")))?;
                let reply = f(receiver, args).await?;
                codec
                    .encode_value(&reply)
                    .map_err(|e| Fault::new(format!("encode reply: {e}")))
            })
        });

        self.methods.insert(
            name.into(),
            Method {
                handler,
                calls: AtomicU64::new(0),
            },
        );
        self
    }

    pub fn build(self) -> Service {
        Service {
            name: self.name,
            methods: self.methods,
        }
    }
}

/// Last segment of `std::any::type_name`, the analogue of taking the
/// concrete type name of a registered receiver.
fn short_type_name<T>() -> &'static str {
    let full = std::any::type_name::<T>();
    full.rsplit("::").next().unwrap_or(full)
}
