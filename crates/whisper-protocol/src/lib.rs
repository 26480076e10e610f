//! Whisper Protocol -- wire types and JSON-RPC codec for the shh_* API.
//!
//! JSON-RPC 2.0 over HTTP POST. One request per call, no batching.
//! Binary fields (key material, payloads, topics) travel as 0x-prefixed hex.

pub mod codec;
pub mod messages;

pub use codec::{decode_response, decode_result, Method, Reply, RpcErrorObject, RpcRequest};
pub use messages::*;

/// JSON-RPC protocol version string sent and expected on every frame.
pub const JSONRPC_VERSION: &str = "2.0";

/// Topic length in bytes.
pub const TOPIC_LENGTH: usize = 4;

/// Default proof-of-work target used when posting.
pub const DEFAULT_POW_TARGET: f64 = 0.001;

/// Default proof-of-work time budget in seconds.
pub const DEFAULT_POW_TIME: u32 = 2;

/// Default message time-to-live in seconds.
pub const DEFAULT_TTL: u32 = 20;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unsupported jsonrpc version: expected {expected:?}, got {got:?}")]
    VersionMismatch { expected: &'static str, got: String },
    #[error("response id mismatch: expected {expected}, got {got}")]
    IdMismatch { expected: u64, got: serde_json::Value },
    #[error("unexpected result for {method}: {reason}")]
    UnexpectedResult { method: String, reason: String },
    #[error("invalid hex: {0}")]
    InvalidHex(String),
    #[error("invalid topic: expected {expected} bytes, got {got}")]
    InvalidTopicLength { expected: usize, got: usize },
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
