use crate::{
    codec::{b64, CallEnvelope, CorrelationId, Frame, MethodKey, ResponseEnvelope},
    correlation::CorrelationTable,
    errors::CallError,
    registry::{ActionOutcome, MethodRegistry, RawHandler},
};
use async_trait::async_trait;
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::{JoinError, JoinHandle},
    time::Instant,
};
use tracing::{error, warn};

/// The shared broadcast topic of a real-time room, as seen by the pub/sub
/// strategy. Peer addressing and delivery are the session's concern; this
/// layer only publishes opaque frames.
#[async_trait]
pub trait MessageChannel: Send + Sync + 'static {
    async fn publish(&self, bytes: Vec<u8>) -> Result<(), SendError>;
}

/// Publishing on the underlying channel failed.
#[derive(Debug, Error)]
#[error("channel send failed: {0}")]
pub struct SendError(pub String);

/// A transport with a native paired request/response primitive, as seen by
/// the direct strategy. The channel itself routes the reply back to the
/// caller, so no correlation table is needed on top of it. Payloads cross
/// as base64 text.
#[async_trait]
pub trait RpcChannel: Send + Sync + 'static {
    async fn perform_rpc(
        &self,
        destination: &str,
        method_key: &str,
        payload: String,
        timeout: Duration,
    ) -> Result<String, RpcChannelError>;
}

/// Failure reported by the native RPC primitive.
#[derive(Debug, Error)]
pub enum RpcChannelError {
    #[error("no response before deadline")]
    Timeout,
    #[error("peer unavailable: {0}")]
    Unavailable(String),
    #[error("{0}")]
    Remote(String),
}

/// An inbound call surfaced by a native-RPC channel. The channel awaits
/// `reply`; an `Err` travels back to the caller as a remote failure.
pub struct InboundRpc {
    pub caller: String,
    pub method_key: String,
    pub payload: String,
    pub reply: oneshot::Sender<Result<String, String>>,
}

/// The one component that touches the data channel. Outbound requests and
/// inbound handler registration both go through here; the two strategies
/// ([`PubSubTransport`], [`DirectTransport`]) are interchangeable behind it.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Sends one request addressed to `destination` and waits for its
    /// correlated response payload.
    async fn send_request(
        &self,
        destination: &str,
        key: &MethodKey,
        correlation_id: CorrelationId,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, CallError>;

    /// Registers a handler for inbound calls on `key`. Idempotent: a
    /// duplicate registration keeps the existing handler.
    fn register_handler(&self, key: &MethodKey, handler: Arc<dyn RawHandler>);

    /// Removes the handler for `key`; a no-op when none is registered.
    fn unregister_handler(&self, key: &MethodKey);

    /// Tears the session down: rejects every pending call with
    /// [`CallError::ConnectionClosed`] and discards every handler.
    async fn close(&self);
}

/// Pub/sub strategy: every frame is broadcast as JSON on a shared topic and
/// the adapter does its own request/response pairing through a
/// [`CorrelationTable`]. Responses reuse the request's service/method pair
/// on the wire but are matched by correlation id alone, so concurrent calls
/// to the same method cannot misroute.
pub struct PubSubTransport {
    channel: Arc<dyn MessageChannel>,
    table: Arc<CorrelationTable>,
    registry: Arc<MethodRegistry>,
    recv_loop: Mutex<Option<JoinHandle<()>>>,
}

impl PubSubTransport {
    /// Takes ownership of the inbound side of the topic and starts the
    /// receive loop. The loop is the only consumer of inbound frames.
    pub fn new(channel: Arc<dyn MessageChannel>, inbound: mpsc::Receiver<Vec<u8>>) -> Arc<Self> {
        let table = CorrelationTable::new();
        let registry = Arc::new(MethodRegistry::new());
        let recv_loop = tokio::spawn(receive_loop(
            Arc::clone(&channel),
            Arc::clone(&table),
            Arc::clone(&registry),
            inbound,
        ));
        Arc::new(Self {
            channel,
            table,
            registry,
            recv_loop: Mutex::new(Some(recv_loop)),
        })
    }

    pub fn pending_count(&self) -> usize {
        self.table.pending_count()
    }

    pub fn registered_count(&self) -> usize {
        self.registry.registered_count()
    }
}

async fn receive_loop(
    channel: Arc<dyn MessageChannel>,
    table: Arc<CorrelationTable>,
    registry: Arc<MethodRegistry>,
    mut inbound: mpsc::Receiver<Vec<u8>>,
) {
    while let Some(bytes) = inbound.recv().await {
        match Frame::decode(&bytes) {
            Ok(Frame::Request(envelope)) => {
                // Each inbound call runs as its own task so one slow handler
                // cannot stall unrelated traffic on the receive path.
                let channel = Arc::clone(&channel);
                let registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    let response = serve_call(registry, envelope).await;
                    if let Err(e) = channel.publish(Frame::Response(response).encode()).await {
                        warn!(error = %e, "failed to publish response frame");
                    }
                });
            }
            Ok(Frame::Response(envelope)) => {
                if envelope.success {
                    table.resolve(&envelope.correlation_id, envelope.payload);
                } else {
                    let message = envelope
                        .error_message
                        .unwrap_or_else(|| "unspecified remote failure".to_owned());
                    table.reject(&envelope.correlation_id, CallError::Remote(message));
                }
            }
            Err(e) => {
                // Protocol violation; drop the frame, keep the loop alive.
                error!(len = e.len, reason = %e.reason, "discarding malformed frame");
            }
        }
    }
}

/// Runs the handler on its own task so a panic unwinds that task alone, and
/// converts the panic into a failure response instead of leaving the caller
/// to burn its timeout window.
async fn serve_call(registry: Arc<MethodRegistry>, envelope: CallEnvelope) -> ResponseEnvelope {
    let service = envelope.service;
    let method = envelope.method;
    let correlation_id = envelope.correlation_id;
    let payload = envelope.payload;

    let work = {
        let registry = Arc::clone(&registry);
        let method_key = format!("{service}/{method}");
        tokio::spawn(async move { registry.dispatch(&method_key, payload).await })
    };
    let outcome = match work.await {
        Ok(outcome) => outcome,
        Err(e) => ActionOutcome::failed(panic_message(e)),
    };

    ResponseEnvelope {
        service,
        method,
        correlation_id,
        success: outcome.success,
        error_message: (!outcome.success).then(|| outcome.message.clone()),
        payload: serde_json::to_vec(&outcome).unwrap_or_default(),
    }
}

fn panic_message(e: JoinError) -> String {
    if !e.is_panic() {
        return "handler cancelled".to_owned();
    }
    let payload = e.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("handler panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("handler panicked: {s}")
    } else {
        "handler panicked".to_owned()
    }
}

#[async_trait]
impl Transport for PubSubTransport {
    async fn send_request(
        &self,
        _destination: &str,
        key: &MethodKey,
        correlation_id: CorrelationId,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, CallError> {
        let reply = self
            .table
            .register(correlation_id.clone(), key.to_string(), timeout);
        let frame = Frame::Request(CallEnvelope {
            service: key.service().to_owned(),
            method: key.method().to_owned(),
            correlation_id,
            payload: payload.to_vec(),
        });
        if let Err(e) = self.channel.publish(frame.encode()).await {
            // Dropping the reply removes the pending entry and its timer.
            return Err(CallError::Transport(e.to_string()));
        }
        reply.recv().await
    }

    fn register_handler(&self, key: &MethodKey, handler: Arc<dyn RawHandler>) {
        self.registry.register(key, handler);
    }

    fn unregister_handler(&self, key: &MethodKey) {
        self.registry.unregister(key);
    }

    async fn close(&self) {
        if let Some(task) = self.recv_loop.lock().unwrap().take() {
            task.abort();
        }
        self.table.close();
        self.registry.clear();
    }
}

impl Drop for PubSubTransport {
    fn drop(&mut self) {
        if let Some(task) = self.recv_loop.lock().unwrap().take() {
            task.abort();
        }
    }
}

/// Direct strategy: the channel's native call primitive pairs each response
/// with its request, so correlation is implicit and the supplied id is only
/// carried for logging parity with the pub/sub wire.
pub struct DirectTransport {
    channel: Arc<dyn RpcChannel>,
    registry: Arc<MethodRegistry>,
    closed: watch::Sender<bool>,
    recv_loop: Mutex<Option<JoinHandle<()>>>,
}

impl DirectTransport {
    pub fn new(channel: Arc<dyn RpcChannel>, inbound: mpsc::Receiver<InboundRpc>) -> Arc<Self> {
        let registry = Arc::new(MethodRegistry::new());
        let recv_loop = tokio::spawn(direct_receive_loop(Arc::clone(&registry), inbound));
        let (closed, _) = watch::channel(false);
        Arc::new(Self {
            channel,
            registry,
            closed,
            recv_loop: Mutex::new(Some(recv_loop)),
        })
    }

    pub fn registered_count(&self) -> usize {
        self.registry.registered_count()
    }
}

async fn direct_receive_loop(registry: Arc<MethodRegistry>, mut inbound: mpsc::Receiver<InboundRpc>) {
    while let Some(call) = inbound.recv().await {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            let InboundRpc {
                caller,
                method_key,
                payload,
                reply,
            } = call;
            let payload = match b64::decode(&payload) {
                Ok(payload) => payload,
                Err(e) => {
                    error!(%caller, %method_key, %e, "malformed inbound payload");
                    let _ = reply.send(Err(e.to_string()));
                    return;
                }
            };
            // Handler runs on its own task; a panic becomes an error reply
            // rather than a silently dropped one.
            let work = {
                let registry = Arc::clone(&registry);
                let method_key = method_key.clone();
                tokio::spawn(async move { registry.dispatch(&method_key, payload).await })
            };
            let result = match work.await {
                Ok(outcome) if outcome.success => {
                    Ok(b64::encode(&serde_json::to_vec(&outcome).unwrap_or_default()))
                }
                Ok(outcome) => Err(outcome.message),
                Err(e) => Err(panic_message(e)),
            };
            let _ = reply.send(result);
        });
    }
}

#[async_trait]
impl Transport for DirectTransport {
    async fn send_request(
        &self,
        destination: &str,
        key: &MethodKey,
        _correlation_id: CorrelationId,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, CallError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(CallError::ConnectionClosed);
        }
        let started = Instant::now();
        let method_key = key.to_string();
        let call = self
            .channel
            .perform_rpc(destination, &method_key, b64::encode(payload), timeout);
        tokio::select! {
            result = call => match result {
                Ok(text) => Ok(b64::decode(&text)?),
                Err(RpcChannelError::Timeout) => Err(CallError::Timeout {
                    method_key: method_key.clone(),
                    elapsed: started.elapsed(),
                }),
                Err(RpcChannelError::Unavailable(message)) => Err(CallError::Transport(message)),
                Err(RpcChannelError::Remote(message)) => Err(CallError::Remote(message)),
            },
            _ = closed.changed() => Err(CallError::ConnectionClosed),
        }
    }

    fn register_handler(&self, key: &MethodKey, handler: Arc<dyn RawHandler>) {
        self.registry.register(key, handler);
    }

    fn unregister_handler(&self, key: &MethodKey) {
        self.registry.unregister(key);
    }

    async fn close(&self) {
        // send_replace updates the value even with no live receivers.
        self.closed.send_replace(true);
        if let Some(task) = self.recv_loop.lock().unwrap().take() {
            task.abort();
        }
        self.registry.clear();
    }
}

impl Drop for DirectTransport {
    fn drop(&mut self) {
        if let Some(task) = self.recv_loop.lock().unwrap().take() {
            task.abort();
        }
    }
}
