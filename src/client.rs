use crate::{
    codec::{CorrelationId, MethodKey},
    errors::{CallError, DecodeError},
    transport::Transport,
};
use serde::{de::DeserializeOwned, Serialize};
use std::{sync::Arc, time::Duration};

/// Default response window for an outbound call.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(10_000);

/// The outbound call path: builds a request with a fresh correlation id,
/// hands it to the transport, and decodes the correlated response.
///
/// Any number of calls may be in flight at once; each owns its own pending
/// state, so one call's timeout or failure never touches another's.
#[derive(Clone)]
pub struct RpcClient {
    transport: Arc<dyn Transport>,
    destination: String,
    timeout: Duration,
}

impl RpcClient {
    pub fn new(transport: Arc<dyn Transport>, destination: impl Into<String>) -> Self {
        Self {
            transport,
            destination: destination.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// One raw call: request bytes out, correlated response bytes back.
    pub async fn request(&self, key: &MethodKey, payload: &[u8]) -> Result<Vec<u8>, CallError> {
        self.request_with_timeout(key, payload, self.timeout).await
    }

    pub async fn request_with_timeout(
        &self,
        key: &MethodKey,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, CallError> {
        self.transport
            .send_request(
                &self.destination,
                key,
                CorrelationId::fresh(),
                payload,
                timeout,
            )
            .await
    }

    /// Typed call: serializes the request as JSON and decodes the response
    /// payload into `Resp`.
    pub async fn call<Req, Resp>(&self, key: &MethodKey, request: &Req) -> Result<Resp, CallError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        // An unencodable request never reaches the wire; report it on the
        // send path, not as a payload-decode violation.
        let payload = serde_json::to_vec(request)
            .map_err(|e| CallError::Transport(format!("request encode failed: {e}")))?;
        let bytes = self.request(key, &payload).await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| CallError::Decode(DecodeError::new(bytes.len(), e.to_string())))
    }
}
