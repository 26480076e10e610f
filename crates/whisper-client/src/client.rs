//! Typed shh_* operations bound to one node.
//!
//! Each operation decodes its result into the shape the method returns;
//! a mismatch is a decode error naming the method, never a panic.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use whisper_protocol::{
    decode_result, Envelope, FilterId, MessageFilterCriteria, Method, PostAck, ProtocolError,
    ReceivedMessage, SymKey, SymKeyId, Topic,
};

use crate::transport::RpcTransport;
use crate::ClientError;

pub struct WhisperClient {
    transport: RpcTransport,
}

impl WhisperClient {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, ClientError> {
        Ok(Self {
            transport: RpcTransport::new(endpoint, timeout)?,
        })
    }

    pub fn endpoint(&self) -> &str {
        self.transport.endpoint()
    }

    /// Ask the node to generate and hold a new symmetric key.
    pub async fn create_sym_key(&self) -> Result<SymKeyId, ClientError> {
        let id: SymKeyId = self.request(Method::NewSymKey, json!([])).await?;
        non_empty(Method::NewSymKey, &id.0)?;
        Ok(id)
    }

    /// Raw key material for a handle this node owns.
    pub async fn fetch_sym_key(&self, id: &SymKeyId) -> Result<SymKey, ClientError> {
        let key: SymKey = self.request(Method::GetSymKey, json!([id])).await?;
        if key.as_bytes().is_empty() {
            return Err(unexpected(Method::GetSymKey, "empty key material"));
        }
        Ok(key)
    }

    /// Register external key material; returns a handle local to this node.
    pub async fn install_sym_key(&self, key: &SymKey) -> Result<SymKeyId, ClientError> {
        let id: SymKeyId = self
            .request(Method::AddSymKey, json!([key.to_hex()]))
            .await?;
        non_empty(Method::AddSymKey, &id.0)?;
        Ok(id)
    }

    /// Subscribe to `topics` under key handle `id`.
    pub async fn register_filter(
        &self,
        id: &SymKeyId,
        topics: &[Topic],
    ) -> Result<FilterId, ClientError> {
        let criteria = MessageFilterCriteria {
            sym_key_id: id.clone(),
            topics: topics.to_vec(),
        };
        let filter: FilterId = self
            .request(Method::NewMessageFilter, json!([criteria]))
            .await?;
        non_empty(Method::NewMessageFilter, &filter.0)?;
        Ok(filter)
    }

    /// Encrypt and submit `envelope` under key handle `id`.
    pub async fn post_message(
        &self,
        id: &SymKeyId,
        envelope: &Envelope,
    ) -> Result<PostAck, ClientError> {
        let message = envelope.clone().into_post(id);
        self.request(Method::Post, json!([message])).await
    }

    /// Messages matched by `filter` since the previous poll.
    ///
    /// Nothing pending is an empty vec, not an error.
    pub async fn poll_filter(&self, filter: &FilterId) -> Result<Vec<ReceivedMessage>, ClientError> {
        let messages: Option<Vec<ReceivedMessage>> = self
            .request(Method::GetFilterMessages, json!([filter]))
            .await?;
        Ok(messages.unwrap_or_default())
    }

    /// Protocol version reported by the node. Cheap; used for readiness.
    pub async fn version(&self) -> Result<String, ClientError> {
        let value = self.transport.call(Method::Version.as_str(), json!([])).await?;
        match value {
            Value::String(s) => Ok(s),
            Value::Number(n) => Ok(n.to_string()),
            other => Err(unexpected(
                Method::Version,
                &format!("expected string or number, got {other}"),
            )),
        }
    }

    /// Untyped escape hatch for methods outside the typed surface.
    pub async fn call_raw(&self, method: &str, params: Value) -> Result<Value, ClientError> {
        self.transport.call(method, params).await
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        params: Value,
    ) -> Result<T, ClientError> {
        let value = self.transport.call(method.as_str(), params).await?;
        Ok(decode_result(method.as_str(), value)?)
    }
}

fn non_empty(method: Method, handle: &str) -> Result<(), ClientError> {
    if handle.is_empty() {
        return Err(unexpected(method, "empty handle"));
    }
    Ok(())
}

fn unexpected(method: Method, reason: &str) -> ClientError {
    ClientError::Decode(ProtocolError::UnexpectedResult {
        method: method.as_str().to_string(),
        reason: reason.to_string(),
    })
}
