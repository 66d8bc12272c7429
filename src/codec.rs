use crate::errors::DecodeError;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use uuid::Uuid;

/// Routing key for one callable operation: `<package>.<Service>/<Method>`,
/// e.g. `rox.interaction.ClientSideUI/PerformUIAction`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MethodKey {
    service: String,
    method: String,
}

impl MethodKey {
    pub fn new(service: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            method: method.into(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn method(&self) -> &str {
        &self.method
    }
}

impl fmt::Display for MethodKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.service, self.method)
    }
}

impl FromStr for MethodKey {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, DecodeError> {
        match s.split_once('/') {
            Some((service, method)) if !service.is_empty() && !method.is_empty() => {
                Ok(Self::new(service, method))
            }
            _ => Err(DecodeError::new(
                s.len(),
                format!("method key {s:?} is not of the form Service/Method"),
            )),
        }
    }
}

/// Unique token binding a response to the request that produced it.
/// Generated once per outbound call, never reused within a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn fresh() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One logical remote procedure call on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallEnvelope {
    pub service: String,
    pub method: String,
    pub correlation_id: CorrelationId,
    #[serde(with = "b64")]
    pub payload: Vec<u8>,
}

/// Answer to exactly one [`CallEnvelope`]. Echoes the request's
/// `correlation_id`; on transports without addressed delivery that echo is
/// the only binding between request and response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub service: String,
    pub method: String,
    pub correlation_id: CorrelationId,
    pub success: bool,
    #[serde(with = "b64")]
    pub payload: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// The pub/sub wire frame: both directions travel on the same shared topic,
/// so a discriminator tells a request apart from a response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Frame {
    Request(CallEnvelope),
    Response(ResponseEnvelope),
}

impl Frame {
    /// Deterministic for identical input: serde_json writes struct fields in
    /// declaration order.
    pub fn encode(&self) -> Vec<u8> {
        // Envelope structs contain nothing unserializable.
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn decode(bytes: &[u8]) -> Result<Frame, DecodeError> {
        serde_json::from_slice(bytes).map_err(|e| DecodeError::new(bytes.len(), e.to_string()))
    }
}

/// Payloads cross text-only transports as standard base64.
pub mod b64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn encode(bytes: &[u8]) -> String {
        STANDARD.encode(bytes)
    }

    pub fn decode(text: &str) -> Result<Vec<u8>, crate::errors::DecodeError> {
        STANDARD
            .decode(text)
            .map_err(|e| crate::errors::DecodeError::new(text.len(), e.to_string()))
    }

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        encode(bytes).serialize(ser)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(de)?;
        decode(&text).map_err(serde::de::Error::custom)
    }
}
