//! JSON-RPC 2.0 framing for single request/response exchanges.
//!
//! Wire format: `{"jsonrpc":"2.0","method":..,"params":[..],"id":N}` out,
//! `{"jsonrpc":"2.0","result":..,"id":N}` or `{.., "error":{code,message}}` in.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ProtocolError, JSONRPC_VERSION};

/// The shh_* methods this crate speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    NewSymKey,
    GetSymKey,
    AddSymKey,
    NewMessageFilter,
    Post,
    GetFilterMessages,
    Version,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::NewSymKey => "shh_newSymKey",
            Method::GetSymKey => "shh_getSymKey",
            Method::AddSymKey => "shh_addSymKey",
            Method::NewMessageFilter => "shh_newMessageFilter",
            Method::Post => "shh_post",
            Method::GetFilterMessages => "shh_getFilterMessages",
            Method::Version => "shh_version",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single outbound call.
#[derive(Debug, Clone, Serialize)]
pub struct RpcRequest<'a> {
    pub jsonrpc: &'static str,
    pub method: &'a str,
    pub params: Value,
    pub id: u64,
}

impl<'a> RpcRequest<'a> {
    /// `params` must be an array or object; `null` is sent as `[]`.
    pub fn new(method: &'a str, params: Value, id: u64) -> Self {
        let params = if params.is_null() {
            Value::Array(Vec::new())
        } else {
            params
        };
        Self {
            jsonrpc: JSONRPC_VERSION,
            method,
            params,
            id,
        }
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Error object of a well-formed error response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Decoded response body: either the raw result or the node's error object.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Result(Value),
    Error(RpcErrorObject),
}

#[derive(Deserialize)]
struct RpcResponse {
    jsonrpc: String,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
    #[serde(default)]
    id: Value,
}

/// Decode a response body and check it answers request `expected_id`.
///
/// Error responses may carry a `null` id (parse errors on the node side);
/// those are accepted as-is. A missing or `null` result decodes as `Value::Null`.
pub fn decode_response(body: &[u8], expected_id: u64) -> Result<Reply, ProtocolError> {
    let resp: RpcResponse = serde_json::from_slice(body)?;

    if resp.jsonrpc != JSONRPC_VERSION {
        return Err(ProtocolError::VersionMismatch {
            expected: JSONRPC_VERSION,
            got: resp.jsonrpc,
        });
    }

    let id_matches = resp.id.as_u64() == Some(expected_id);
    if let Some(error) = resp.error {
        if !id_matches && !resp.id.is_null() {
            return Err(ProtocolError::IdMismatch {
                expected: expected_id,
                got: resp.id,
            });
        }
        return Ok(Reply::Error(error));
    }

    if !id_matches {
        return Err(ProtocolError::IdMismatch {
            expected: expected_id,
            got: resp.id,
        });
    }

    Ok(Reply::Result(resp.result.unwrap_or(Value::Null)))
}

/// Decode a raw result into the shape `method` is documented to return.
pub fn decode_result<T: DeserializeOwned>(method: &str, value: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(value).map_err(|e| ProtocolError::UnexpectedResult {
        method: method.to_string(),
        reason: e.to_string(),
    })
}
