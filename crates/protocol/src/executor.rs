//! Reference in-guest executor.
//!
//! The guest side of the stream is a small daemon: it announces readiness
//! with the handshake byte, then serves one framed request at a time.
//! Failures raised by user functions are data, not control flow; they are
//! serialized back to the host and the daemon keeps serving. Only a
//! protocol violation tears the connection down, which the host observes
//! as a crash.
//!
//! Production guests embed this loop around their own function registry
//! and package installer; the mock runner drives it over an in-memory
//! stream.

use crate::codec::{Codec, TaggedCodec, TrustedCodec};
use crate::frame::{FrameError, HANDSHAKE_BYTE, read_frame, write_frame};
use crate::message::{
    Outcome, RemoteFailure, Request, Response, decode_request, encode_response,
};
use crate::value::Value;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// What a guest function returns: a portable value or a raised failure.
pub type FunctionResult = Result<Value, FunctionFault>;

/// A failure raised by a guest function, before serialization.
#[derive(Debug, Clone)]
pub struct FunctionFault {
    pub kind: String,
    pub message: String,
}

impl FunctionFault {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

pub type GuestFunction = Arc<
    dyn Fn(Vec<Value>, Vec<(String, Value)>) -> BoxFuture<'static, FunctionResult> + Send + Sync,
>;

/// Resolves stable function identifiers to callables.
pub trait FunctionRegistry: Send + Sync {
    fn resolve(&self, function_ref: &str) -> Option<GuestFunction>;
}

/// Installs packages into the guest environment during provisioning.
#[async_trait]
pub trait PackageInstaller: Send + Sync {
    async fn install(&self, packages: &[String]) -> Result<(), String>;
}

/// A fixed function table keyed by `module:qualname`.
#[derive(Default)]
pub struct StaticRegistry {
    functions: HashMap<String, GuestFunction>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an async function.
    pub fn register<F, Fut>(&mut self, function_ref: impl Into<String>, f: F)
    where
        F: Fn(Vec<Value>, Vec<(String, Value)>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = FunctionResult> + Send + 'static,
    {
        self.functions.insert(
            function_ref.into(),
            Arc::new(move |args, kwargs| Box::pin(f(args, kwargs))),
        );
    }

    /// Registers a synchronous function.
    pub fn register_fn<F>(&mut self, function_ref: impl Into<String>, f: F)
    where
        F: Fn(Vec<Value>, Vec<(String, Value)>) -> FunctionResult + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        self.register(function_ref, move |args, kwargs| {
            let f = Arc::clone(&f);
            async move { f(args, kwargs) }
        });
    }
}

impl FunctionRegistry for StaticRegistry {
    fn resolve(&self, function_ref: &str) -> Option<GuestFunction> {
        self.functions.get(function_ref).cloned()
    }
}

impl<R: FunctionRegistry + ?Sized> FunctionRegistry for Arc<R> {
    fn resolve(&self, function_ref: &str) -> Option<GuestFunction> {
        (**self).resolve(function_ref)
    }
}

/// Installer for guests with no package manager; every install fails.
pub struct NoInstaller;

#[async_trait]
impl PackageInstaller for NoInstaller {
    async fn install(&self, _packages: &[String]) -> Result<(), String> {
        Err("no package installer configured".to_string())
    }
}

/// Serves one connection until the peer closes it.
///
/// Arguments arrive host-trusted and are decoded with the trusted
/// codec; results are guest-originated and must fit the portable
/// tagged space.
pub struct Executor<R, I> {
    registry: R,
    installer: I,
    args_codec: TrustedCodec,
    result_codec: TaggedCodec,
}

impl<R, I> Executor<R, I>
where
    R: FunctionRegistry,
    I: PackageInstaller,
{
    pub fn new(registry: R, installer: I) -> Self {
        Self {
            registry,
            installer,
            args_codec: TrustedCodec,
            result_codec: TaggedCodec,
        }
    }

    /// Writes the handshake byte, then answers framed requests until the
    /// host closes the stream.
    ///
    /// A malformed frame or payload is a protocol violation: the stream
    /// is dropped without a response and the host sees a crash. If a
    /// call outlives its soft timer the executor abandons it and goes
    /// quiet; the host's authoritative deadline fires and the VM is
    /// recycled.
    pub async fn serve<S>(&self, mut stream: S) -> Result<(), FrameError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        stream.write_u8(HANDSHAKE_BYTE).await?;
        stream.flush().await?;

        loop {
            let payload = match read_frame(&mut stream).await {
                Ok(payload) => payload,
                Err(FrameError::Closed) => return Ok(()),
                Err(e) => return Err(e),
            };

            let request = match decode_request(&payload) {
                Ok(request) => request,
                Err(e) => {
                    tracing::warn!("dropping connection on malformed request: {e}");
                    return Ok(());
                }
            };

            let call_id = request.call_id();
            let outcome = match request {
                Request::Invoke {
                    function_ref,
                    args,
                    kwargs,
                    deadline_ms,
                    ..
                } => {
                    match self
                        .invoke(&function_ref, &args, &kwargs, deadline_ms)
                        .await
                    {
                        Some(outcome) => outcome,
                        None => {
                            // Soft timer expired. The call may have left
                            // guest state inconsistent, so no further
                            // requests are served; the host deadline will
                            // expire and taint this VM.
                            tracing::warn!(
                                %function_ref,
                                deadline_ms,
                                "soft timer expired, going quiet"
                            );
                            futures::future::pending::<()>().await;
                            unreachable!()
                        }
                    }
                }
                Request::Install { packages, .. } => {
                    match self.installer.install(&packages).await {
                        Ok(()) => Outcome::Ok { result: Vec::new() },
                        Err(message) => Outcome::Err(RemoteFailure {
                            kind: "InstallError".to_string(),
                            remote_trace: synth_trace("install", "InstallError", &message),
                            message,
                        }),
                    }
                }
            };

            let response = Response { call_id, outcome };
            let bytes = encode_response(&response)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            write_frame(&mut stream, &bytes).await?;
        }
    }

    /// Runs one invocation under the soft timer. `None` means the timer
    /// expired.
    async fn invoke(
        &self,
        function_ref: &str,
        args: &[u8],
        kwargs: &[u8],
        deadline_ms: u32,
    ) -> Option<Outcome> {
        let Some(function) = self.registry.resolve(function_ref) else {
            return Some(failure_outcome(
                function_ref,
                "ImportError",
                format!("cannot resolve '{function_ref}'"),
            ));
        };

        let args = match self.args_codec.decode(args).map(into_seq) {
            Ok(Some(args)) => args,
            _ => {
                return Some(failure_outcome(
                    function_ref,
                    "DeserializationError",
                    "arguments are not a sequence".to_string(),
                ));
            }
        };
        let kwargs = match self.args_codec.decode(kwargs).map(into_map) {
            Ok(Some(kwargs)) => kwargs,
            _ => {
                return Some(failure_outcome(
                    function_ref,
                    "DeserializationError",
                    "keyword arguments are not a mapping".to_string(),
                ));
            }
        };

        let soft_timer = Duration::from_millis(u64::from(deadline_ms));
        let result = tokio::time::timeout(soft_timer, function(args, kwargs))
            .await
            .ok()?;

        Some(match result {
            Ok(value) => match self.result_codec.encode(&value) {
                Ok(result) => Outcome::Ok { result },
                Err(e) => failure_outcome(function_ref, "EncodingError", e.to_string()),
            },
            Err(fault) => failure_outcome(function_ref, &fault.kind, fault.message),
        })
    }
}

fn into_seq(value: Value) -> Option<Vec<Value>> {
    match value {
        Value::Seq(items) => Some(items),
        _ => None,
    }
}

fn into_map(value: Value) -> Option<Vec<(String, Value)>> {
    match value {
        Value::Map(entries) => Some(entries),
        _ => None,
    }
}

fn failure_outcome(function_ref: &str, kind: &str, message: String) -> Outcome {
    Outcome::Err(RemoteFailure {
        kind: kind.to_string(),
        remote_trace: synth_trace(function_ref, kind, &message),
        message,
    })
}

fn synth_trace(function_ref: &str, kind: &str, message: &str) -> String {
    format!("guest trace (most recent call last):\n  in {function_ref}\n{kind}: {message}")
}
