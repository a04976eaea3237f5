//! Framed request/response client over one guest stream.
//!
//! Exactly one call is in flight per stream; `&mut self` on every call
//! makes that structural. Parallelism comes from using more VMs, never
//! from multiplexing a stream. Within one stream, calls are serialized
//! in submission order.

use cordon_core::{Error, GuestStream, Result};
use cordon_protocol::{
    FrameError, Outcome, RemoteFailure, Request, decode_response, encode_request, read_frame,
    write_frame,
};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Host side of one VM's guest channel.
pub struct RpcClient {
    stream: GuestStream,
    next_call_id: u64,
}

impl RpcClient {
    /// Wraps a stream whose handshake byte has already been consumed.
    pub fn new(stream: GuestStream) -> Self {
        Self {
            stream,
            next_call_id: 1,
        }
    }

    /// Invokes a guest function, bounded by `deadline`.
    ///
    /// `deadline_ms` is the guest-side soft timer; `deadline` is the
    /// authoritative host-side bound and covers the write and the read.
    ///
    /// # Errors
    ///
    /// [`Error::Timeout`] when the deadline expires,
    /// [`Error::RemoteCrash`] when the guest closes the stream,
    /// [`Error::ProtocolError`] on framing damage or a call id mismatch,
    /// and [`Error::RemoteException`] when the guest function raised.
    pub async fn invoke(
        &mut self,
        function_ref: &str,
        args: Vec<u8>,
        kwargs: Vec<u8>,
        deadline_ms: u32,
        deadline: Duration,
    ) -> Result<Vec<u8>> {
        self.invoke_cancellable(
            function_ref,
            args,
            kwargs,
            deadline_ms,
            deadline,
            &CancellationToken::new(),
        )
        .await
    }

    /// [`invoke`](Self::invoke) with a caller-supplied cancellation
    /// signal. Cancellation mid-call leaves the stream with an
    /// unconsumed response, so the owning VM must be tainted.
    pub async fn invoke_cancellable(
        &mut self,
        function_ref: &str,
        args: Vec<u8>,
        kwargs: Vec<u8>,
        deadline_ms: u32,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let request = Request::Invoke {
            call_id: self.next_id(),
            function_ref: function_ref.to_string(),
            args,
            kwargs,
            deadline_ms,
        };
        match self.exchange(request, deadline, cancel).await? {
            Outcome::Ok { result } => Ok(result),
            Outcome::Err(failure) => Err(remote_exception(failure)),
        }
    }

    /// Sends an install command during provisioning.
    ///
    /// # Errors
    ///
    /// A guest-reported install failure surfaces as
    /// [`Error::ProvisioningError`]; transport failures as in
    /// [`invoke`](Self::invoke).
    pub async fn install(&mut self, packages: &[String], deadline: Duration) -> Result<()> {
        let request = Request::Install {
            call_id: self.next_id(),
            packages: packages.to_vec(),
        };
        match self
            .exchange(request, deadline, &CancellationToken::new())
            .await?
        {
            Outcome::Ok { .. } => Ok(()),
            Outcome::Err(failure) => Err(Error::ProvisioningError(format!(
                "{}: {}",
                failure.kind, failure.message
            ))),
        }
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_call_id;
        self.next_call_id += 1;
        id
    }

    async fn exchange(
        &mut self,
        request: Request,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<Outcome> {
        let call_id = request.call_id();
        let bytes =
            encode_request(&request).map_err(|e| Error::ProtocolError(e.to_string()))?;

        let stream = &mut self.stream;
        let exchange = async move {
            write_frame(stream, &bytes).await.map_err(frame_error)?;
            let payload = read_frame(stream).await.map_err(frame_error)?;
            let response =
                decode_response(&payload).map_err(|e| Error::ProtocolError(e.to_string()))?;
            if response.call_id != call_id {
                return Err(Error::ProtocolError(format!(
                    "response for call {} while call {} in flight",
                    response.call_id, call_id
                )));
            }
            Ok(response.outcome)
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = tokio::time::timeout(deadline, exchange) => match result {
                Ok(outcome) => outcome,
                Err(_) => Err(Error::Timeout),
            },
        }
    }
}

fn frame_error(e: FrameError) -> Error {
    match e {
        FrameError::Closed => Error::RemoteCrash,
        other => Error::ProtocolError(other.to_string()),
    }
}

fn remote_exception(failure: RemoteFailure) -> Error {
    Error::RemoteException {
        kind: failure.kind,
        message: failure.message,
        remote_trace: failure.remote_trace,
    }
}
