//! Line codec for wire messages.
//!
//! Encoding produces a single JSON line without the trailing newline; the
//! transport layer appends it and flushes. Decoding trims surrounding
//! whitespace and returns [`ProtocolError::Decode`] for anything that is not
//! a well-formed record. Decode failures are recoverable by contract: reader
//! loops record the offending line and keep going, so one corrupt line never
//! terminates a stream.

use thiserror::Error;

use crate::message::{Request, Response};

/// Errors arising from message encoding and decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The in-memory record could not be serialised.
    #[error("failed to serialise message: {0}")]
    Encode(#[source] serde_json::Error),

    /// The line is not a well-formed wire record.
    #[error("failed to parse message line: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Encodes a request as a JSON line.
///
/// # Errors
///
/// Returns [`ProtocolError::Encode`] if serialisation fails. This does not
/// happen for well-formed records; the variant exists so callers propagate
/// instead of panicking.
pub fn encode_request(request: &Request) -> Result<String, ProtocolError> {
    serde_json::to_string(request).map_err(ProtocolError::Encode)
}

/// Decodes a request from a JSON line.
///
/// # Errors
///
/// Returns [`ProtocolError::Decode`] if the line is not a well-formed
/// request record.
pub fn decode_request(line: &str) -> Result<Request, ProtocolError> {
    serde_json::from_str(line.trim()).map_err(ProtocolError::Decode)
}

/// Encodes a response as a JSON line.
///
/// # Errors
///
/// Returns [`ProtocolError::Encode`] if serialisation fails.
pub fn encode_response(response: &Response) -> Result<String, ProtocolError> {
    serde_json::to_string(response).map_err(ProtocolError::Encode)
}

/// Decodes a response from a JSON line.
///
/// # Errors
///
/// Returns [`ProtocolError::Decode`] if the line is not a well-formed
/// response record.
pub fn decode_response(line: &str) -> Result<Response, ProtocolError> {
    serde_json::from_str(line.trim()).map_err(ProtocolError::Decode)
}

#[cfg(test)]
mod tests;
