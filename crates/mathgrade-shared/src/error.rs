//! Error types shared by the endpoint and its callers.

use crate::rpc::EndpointAddress;
use std::time::Duration;
use thiserror::Error;

/// JSON-RPC error codes used on the wire
pub mod codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
}

/// Failures of the caller-side transport and correlator.
///
/// This layer never retries; the orchestrator decides what a failure means.
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("timed out connecting to {0}")]
    ConnectTimeout(EndpointAddress),

    #[error("connection to {addr} refused: {reason}")]
    ConnectionRefused {
        addr: EndpointAddress,
        reason: String,
    },

    #[error("handshake with {addr} failed: {reason}")]
    Handshake {
        addr: EndpointAddress,
        reason: String,
    },

    #[error("request {id} timed out after {timeout:?}")]
    RequestTimeout { id: u64, timeout: Duration },

    #[error("remote error {code}: {message}")]
    Remote { code: i64, message: String },

    #[error("response id mismatch: expected {expected}, received {received}")]
    ResponseMismatch { expected: u64, received: String },

    #[error("transport closed")]
    Closed,
}

impl TransportError {
    /// Endpoint unreachable or never completed the welcome exchange
    pub fn is_connect_failure(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectTimeout(_)
                | TransportError::ConnectionRefused { .. }
                | TransportError::Handshake { .. }
        )
    }

    /// The peer broke the envelope contract; the connection is suspect
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, TransportError::ResponseMismatch { .. })
    }

    pub fn code(&self) -> i64 {
        match self {
            TransportError::Remote { code, .. } => *code,
            TransportError::ResponseMismatch { .. } => codes::INVALID_REQUEST,
            _ => codes::INTERNAL_ERROR,
        }
    }
}

/// Failures reported by the tool endpoint's dispatcher
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ToolError {
    #[error("unknown capability: {0}")]
    UnknownCapability(String),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("{0}")]
    Handler(String),
}

impl ToolError {
    pub fn code(&self) -> i64 {
        match self {
            ToolError::UnknownCapability(_) => codes::METHOD_NOT_FOUND,
            ToolError::InvalidArguments(_) => codes::INVALID_PARAMS,
            ToolError::Handler(_) => codes::INTERNAL_ERROR,
        }
    }
}
