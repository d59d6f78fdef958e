//! Wire protocol for service-worker communication.
//!
//! The `taskpipe-protocol` crate defines the records exchanged between a
//! caller-side [`Service`](https://docs.rs/taskpipe) and the worker process
//! it drives. The transport is deliberately primitive: one JSON object per
//! line over the worker's stdin (requests) and stdout (responses), UTF-8,
//! newline terminated, flushed after every write so the peer sees each
//! message promptly.
//!
//! Requests are correlated with their response stream by an opaque `task`
//! token. A task's life on the wire is a sequence of responses ending in
//! exactly one terminal type (COMPLETION, CANCELATION, FAILURE, or CRASH).
//!
//! This crate is pure data: no I/O, no threads. The [`codec`] module turns
//! records into lines and back; everything else lives in [`message`].

pub mod codec;
pub mod message;

pub use self::codec::{
    ProtocolError, decode_request, decode_response, encode_request, encode_response,
};
pub use self::message::{Request, RequestType, Response, ResponseType};
