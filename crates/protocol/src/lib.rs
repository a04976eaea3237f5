//! Wire contract between a cordon host and its guest executors.
//!
//! This crate defines everything both sides of the host↔guest stream
//! agree on: the length-prefixed framing, the portable value space and
//! its codecs, the tagged request/response messages, and a reference
//! implementation of the in-guest executor loop.

pub mod codec;
pub mod executor;
pub mod frame;
pub mod message;
pub mod value;

pub use codec::{Codec, CodecError, MAX_VALUE_DEPTH, TaggedCodec, TrustedCodec};
pub use executor::{
    Executor, FunctionFault, FunctionRegistry, FunctionResult, GuestFunction, NoInstaller,
    PackageInstaller, StaticRegistry,
};
pub use frame::{FrameError, HANDSHAKE_BYTE, MAX_FRAME_SIZE, read_frame, write_frame};
pub use message::{
    Outcome, RemoteFailure, Request, Response, decode_request, decode_response, encode_request,
    encode_response,
};
pub use value::Value;
