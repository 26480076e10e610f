//! Wire types for the shh_* methods.
//!
//! Field names follow the node's JSON (`symKeyID`, `powTarget`, `TTL`, ...).
//! Handles are opaque strings and only meaningful to the node that issued them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{ProtocolError, DEFAULT_POW_TARGET, DEFAULT_POW_TIME, DEFAULT_TTL, TOPIC_LENGTH};

// ============================================================================
// Handles
// ============================================================================

/// Node-local symmetric key handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SymKeyId(pub String);

/// Node-local message filter handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FilterId(pub String);

impl fmt::Display for SymKeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for FilterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Key material
// ============================================================================

/// Raw symmetric key material, transferred between nodes by value.
///
/// `Debug` never prints the bytes.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SymKey(#[serde(with = "hex_bytes")] Vec<u8>);

impl SymKey {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// 0x-prefixed hex, the form `shh_addSymKey` expects.
    pub fn to_hex(&self) -> String {
        encode_hex(&self.0)
    }
}

impl fmt::Debug for SymKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SymKey(<redacted {} bytes>)", self.0.len())
    }
}

// ============================================================================
// Topic
// ============================================================================

/// 4-byte message topic, `0xe00123a5` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Topic(pub [u8; TOPIC_LENGTH]);

impl FromStr for Topic {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = decode_hex(s)?;
        let arr: [u8; TOPIC_LENGTH] =
            bytes
                .as_slice()
                .try_into()
                .map_err(|_| ProtocolError::InvalidTopicLength {
                    expected: TOPIC_LENGTH,
                    got: bytes.len(),
                })?;
        Ok(Topic(arr))
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&encode_hex(&self.0))
    }
}

impl Serialize for Topic {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Topic {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Envelope (outbound)
// ============================================================================

/// A message to publish, before it is bound to a key handle.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub topic: Topic,
    pub payload: Vec<u8>,
    /// Proof-of-work difficulty the sender must reach.
    pub pow_target: f64,
    /// Seconds the node may spend on proof of work.
    pub pow_time: u32,
    /// Seconds the message lives in the network.
    pub ttl: u32,
}

impl Envelope {
    pub fn new(topic: Topic, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic,
            payload: payload.into(),
            pow_target: DEFAULT_POW_TARGET,
            pow_time: DEFAULT_POW_TIME,
            ttl: DEFAULT_TTL,
        }
    }

    pub fn with_pow(mut self, target: f64, time_secs: u32) -> Self {
        self.pow_target = target;
        self.pow_time = time_secs;
        self
    }

    pub fn with_ttl(mut self, ttl_secs: u32) -> Self {
        self.ttl = ttl_secs;
        self
    }

    /// Bind this envelope to a sender-side key handle for `shh_post`.
    pub fn into_post(self, key: &SymKeyId) -> NewMessage {
        NewMessage {
            sym_key_id: key.clone(),
            topic: self.topic,
            payload: self.payload,
            pow_target: self.pow_target,
            pow_time: self.pow_time,
            ttl: self.ttl,
        }
    }
}

/// `shh_post` parameter object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMessage {
    #[serde(rename = "symKeyID")]
    pub sym_key_id: SymKeyId,
    pub topic: Topic,
    #[serde(with = "hex_bytes")]
    pub payload: Vec<u8>,
    #[serde(rename = "powTarget")]
    pub pow_target: f64,
    #[serde(rename = "powTime")]
    pub pow_time: u32,
    #[serde(rename = "TTL")]
    pub ttl: u32,
}

/// `shh_post` result. Older nodes answer `true`, newer ones the message hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PostAck {
    Flag(bool),
    Hash(String),
}

impl PostAck {
    pub fn accepted(&self) -> bool {
        match self {
            PostAck::Flag(ok) => *ok,
            PostAck::Hash(hash) => !hash.is_empty(),
        }
    }
}

// ============================================================================
// Filters
// ============================================================================

/// `shh_newMessageFilter` parameter object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageFilterCriteria {
    #[serde(rename = "symKeyID")]
    pub sym_key_id: SymKeyId,
    pub topics: Vec<Topic>,
}

/// One message returned by `shh_getFilterMessages`.
///
/// Only topic and payload are required; the rest is node-reported metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceivedMessage {
    pub topic: Topic,
    #[serde(with = "hex_bytes")]
    pub payload: Vec<u8>,
    #[serde(default)]
    pub ttl: u32,
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default)]
    pub pow: f64,
    #[serde(default)]
    pub hash: String,
}

impl ReceivedMessage {
    /// True when topic and payload equal what was posted.
    pub fn matches(&self, envelope: &Envelope) -> bool {
        self.topic == envelope.topic && self.payload == envelope.payload
    }
}

// ============================================================================
// Hex helpers
// ============================================================================

/// Encode bytes as 0x-prefixed lowercase hex.
pub fn encode_hex(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

/// Decode hex with or without the 0x prefix.
pub fn decode_hex(s: &str) -> Result<Vec<u8>, ProtocolError> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    hex::decode(digits).map_err(|e| ProtocolError::InvalidHex(format!("{s:?}: {e}")))
}

/// Serialize/deserialize Vec<u8> as 0x-prefixed hex string.
mod hex_bytes {
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&super::encode_hex(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        super::decode_hex(&s).map_err(serde::de::Error::custom)
    }
}
