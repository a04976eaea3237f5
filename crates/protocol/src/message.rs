//! Request and response messages exchanged over the framed stream.
//!
//! Dispatch is by tagged variant; the host never sees guest types beyond
//! these shapes. One request is in flight per stream at a time, and each
//! response echoes the `call_id` of the request it answers.

use serde::{Deserialize, Serialize};

use crate::codec::CodecError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// Invoke a function resolved by its stable identifier.
    Invoke {
        call_id: u64,
        /// `module:qualname` identifier pinned at shim registration.
        function_ref: String,
        /// Codec-encoded positional arguments (a sequence).
        args: Vec<u8>,
        /// Codec-encoded keyword arguments (a string-keyed mapping).
        kwargs: Vec<u8>,
        /// Guest-side soft timer budget, milliseconds.
        deadline_ms: u32,
    },
    /// Install packages into the guest environment (host-trusted,
    /// provisioning only).
    Install {
        call_id: u64,
        packages: Vec<String>,
    },
}

impl Request {
    pub fn call_id(&self) -> u64 {
        match self {
            Request::Invoke { call_id, .. } | Request::Install { call_id, .. } => *call_id,
        }
    }
}

/// A failure raised inside the guest, carried as data.
///
/// `kind` is the original type name of the failure; equality of kind
/// strings is the contract, the host never rematerializes guest types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFailure {
    pub kind: String,
    pub message: String,
    pub remote_trace: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Outcome {
    Ok { result: Vec<u8> },
    Err(RemoteFailure),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub call_id: u64,
    pub outcome: Outcome,
}

pub fn encode_request(request: &Request) -> Result<Vec<u8>, CodecError> {
    postcard::to_allocvec(request).map_err(|e| CodecError::Unencodable(e.to_string()))
}

pub fn decode_request(bytes: &[u8]) -> Result<Request, CodecError> {
    postcard::from_bytes(bytes).map_err(|e| CodecError::Malformed(e.to_string()))
}

pub fn encode_response(response: &Response) -> Result<Vec<u8>, CodecError> {
    postcard::to_allocvec(response).map_err(|e| CodecError::Unencodable(e.to_string()))
}

pub fn decode_response(bytes: &[u8]) -> Result<Response, CodecError> {
    postcard::from_bytes(bytes).map_err(|e| CodecError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invoke_roundtrip() {
        let request = Request::Invoke {
            call_id: 7,
            function_ref: "m:f".into(),
            args: vec![1, 2],
            kwargs: vec![],
            deadline_ms: 200,
        };
        let bytes = encode_request(&request).unwrap();
        match decode_request(&bytes).unwrap() {
            Request::Invoke {
                call_id,
                function_ref,
                deadline_ms,
                ..
            } => {
                assert_eq!(call_id, 7);
                assert_eq!(function_ref, "m:f");
                assert_eq!(deadline_ms, 200);
            }
            other => panic!("expected invoke, got {other:?}"),
        }
    }

    #[test]
    fn install_roundtrip() {
        let request = Request::Install {
            call_id: 1,
            packages: vec!["requests>=2.31".into()],
        };
        let bytes = encode_request(&request).unwrap();
        match decode_request(&bytes).unwrap() {
            Request::Install { packages, .. } => assert_eq!(packages, vec!["requests>=2.31"]),
            other => panic!("expected install, got {other:?}"),
        }
    }

    #[test]
    fn error_response_roundtrip() {
        let response = Response {
            call_id: 3,
            outcome: Outcome::Err(RemoteFailure {
                kind: "ValueError".into(),
                message: "bad".into(),
                remote_trace: "trace".into(),
            }),
        };
        let bytes = encode_response(&response).unwrap();
        let back = decode_response(&bytes).unwrap();
        assert_eq!(back.call_id, 3);
        match back.outcome {
            Outcome::Err(failure) => {
                assert_eq!(failure.kind, "ValueError");
                assert_eq!(failure.message, "bad");
            }
            Outcome::Ok { .. } => panic!("expected error outcome"),
        }
    }

    #[test]
    fn malformed_response_rejected() {
        assert!(decode_response(&[0xde, 0xad]).is_err());
    }
}
