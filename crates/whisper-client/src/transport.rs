//! Single-shot JSON-RPC over HTTP POST.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::Value;
use whisper_protocol::{decode_response, Reply, RpcRequest};

use crate::ClientError;

/// Longest slice of a non-JSON error body kept in `ClientError::HttpStatus`.
const MAX_ERROR_BODY: usize = 512;

/// One node endpoint plus the HTTP client used to reach it.
pub struct RpcTransport {
    http: reqwest::Client,
    endpoint: String,
    next_id: AtomicU64,
}

impl RpcTransport {
    /// Build a transport with a per-request timeout covering connect,
    /// send and the full body read.
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Send `method(params)` and return the raw `result` value.
    ///
    /// Non-2xx responses are still decoded when the body is a JSON-RPC
    /// response; otherwise they surface as `ClientError::HttpStatus`.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, ClientError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = RpcRequest::new(method, params, id);

        tracing::debug!(endpoint = %self.endpoint, method, id, "rpc call");

        let resp = self
            .http
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await?;
        let status = resp.status();
        let body = resp.bytes().await?;

        tracing::trace!(
            method,
            id,
            status = status.as_u16(),
            body = %String::from_utf8_lossy(&body),
            "rpc response"
        );

        let reply = match decode_response(&body, id) {
            Ok(reply) => reply,
            Err(e) if !status.is_success() => {
                tracing::debug!(method, id, status = status.as_u16(), "non-rpc error body: {e}");
                let text = String::from_utf8_lossy(&body);
                return Err(ClientError::HttpStatus {
                    status: status.as_u16(),
                    body: text.chars().take(MAX_ERROR_BODY).collect(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        match reply {
            Reply::Result(value) => Ok(value),
            Reply::Error(err) => {
                tracing::debug!(method, id, code = err.code, message = %err.message, "rpc error");
                Err(ClientError::Rpc {
                    code: err.code,
                    message: err.message,
                    data: err.data,
                })
            }
        }
    }
}
