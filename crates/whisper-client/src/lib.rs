//! Whisper Client -- JSON-RPC over HTTP to a single shh_* node.
//!
//! `RpcTransport` moves one request/response pair per call; `WhisperClient`
//! is the typed facade the harness uses. Neither retries.

pub mod client;
pub mod transport;

pub use client::WhisperClient;
pub use transport::RpcTransport;

use whisper_protocol::ProtocolError;

/// Broad failure class, for callers that branch on what went wrong
/// rather than on the exact error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The node could not be reached or did not answer in time.
    Transport,
    /// The node answered with a well-formed JSON-RPC error object.
    Rpc,
    /// The node answered with something that is not the expected response.
    Decode,
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("http status {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("rpc error {code}: {message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },
    #[error("decode error: {0}")]
    Decode(#[from] ProtocolError),
}

impl ClientError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::Transport(_) | ClientError::HttpStatus { .. } => ErrorKind::Transport,
            ClientError::Rpc { .. } => ErrorKind::Rpc,
            ClientError::Decode(_) => ErrorKind::Decode,
        }
    }

    /// JSON-RPC error code, if the node answered with one.
    pub fn rpc_code(&self) -> Option<i64> {
        match self {
            ClientError::Rpc { code, .. } => Some(*code),
            _ => None,
        }
    }
}
