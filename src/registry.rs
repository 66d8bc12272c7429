use crate::codec::MethodKey;
use futures::future::BoxFuture;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    sync::{Arc, RwLock},
};
use tracing::warn;

/// Structured result of one inbound call handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ActionOutcome {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: None,
        }
    }

    pub fn ok_with(message: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
        }
    }
}

/// An inbound-call handler with a typed request payload.
pub trait Handler: Send + Sync + 'static {
    type Request: DeserializeOwned + Send;

    fn call(&self, request: Self::Request) -> BoxFuture<'_, ActionOutcome>;
}

/// Type-erased version of [`Handler`], taking raw payload bytes. This is the
/// form handlers take inside the registry and across the transport seam.
pub trait RawHandler: Send + Sync {
    fn call_raw(&self, payload: Vec<u8>) -> BoxFuture<'_, ActionOutcome>;
}

struct TypedHandler<H>(H);

impl<H> RawHandler for TypedHandler<H>
where
    H: Handler,
{
    fn call_raw(&self, payload: Vec<u8>) -> BoxFuture<'_, ActionOutcome> {
        Box::pin(async move {
            let request: H::Request = match serde_json::from_slice(&payload) {
                Ok(request) => request,
                Err(e) => {
                    return ActionOutcome::failed(format!(
                        "malformed request payload ({} bytes): {e}",
                        payload.len()
                    ))
                }
            };
            self.0.call(request).await
        })
    }
}

/// Erase a typed [`Handler`] for registration through a `dyn Transport`.
pub fn erase<H: Handler>(handler: H) -> Arc<dyn RawHandler> {
    Arc::new(TypedHandler(handler))
}

/// Maps method-key strings to handlers for agent-initiated inbound calls.
///
/// Registration is idempotent: a duplicate key keeps the existing handler
/// and logs a warning, so reconnect and hot-reload races stay non-fatal.
#[derive(Default)]
pub struct MethodRegistry {
    handlers: RwLock<BTreeMap<String, Arc<dyn RawHandler>>>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, key: &MethodKey, handler: Arc<dyn RawHandler>) {
        let mut handlers = self.handlers.write().unwrap();
        let key = key.to_string();
        if handlers.contains_key(&key) {
            warn!(method_key = %key, "handler already registered, keeping existing");
            return;
        }
        handlers.insert(key, handler);
    }

    /// Removing an absent key is a no-op.
    pub fn unregister(&self, key: &MethodKey) {
        self.handlers.write().unwrap().remove(&key.to_string());
    }

    pub fn clear(&self) {
        self.handlers.write().unwrap().clear();
    }

    pub fn registered_count(&self) -> usize {
        self.handlers.read().unwrap().len()
    }

    /// Executes the handler for `method_key` against `payload`. An unknown
    /// key or a failing handler yields a failure outcome, never a crash of
    /// the receive path.
    pub async fn dispatch(&self, method_key: &str, payload: Vec<u8>) -> ActionOutcome {
        let handler = self.handlers.read().unwrap().get(method_key).cloned();
        match handler {
            Some(handler) => handler.call_raw(payload).await,
            None => {
                warn!(method_key, "inbound call for unregistered method");
                ActionOutcome::failed(format!("Unknown action_type/method: {method_key}"))
            }
        }
    }
}
