//! Control-channel RPC bridge between a browser client and a remote agent
//! sharing one message-oriented real-time data channel.
//!
//! The channel offers best-effort delivery and nothing else, so this crate
//! supplies the rest of a request/response protocol: method addressing
//! (`package.Service/Method` keys), envelope encoding, correlation of
//! responses to requests, per-call timeouts, and bidirectional dispatch:
//! client-initiated service calls out, agent-initiated UI action calls in.
//!
//! Exactly two logical peers per session, no streaming, no retries, no
//! service discovery.

pub mod client;
pub mod codec;
pub mod correlation;
pub mod errors;
pub mod registry;
pub mod service;
pub mod transport;
pub mod ui;

pub use client::{RpcClient, DEFAULT_TIMEOUT};
pub use codec::{CallEnvelope, CorrelationId, Frame, MethodKey, ResponseEnvelope};
pub use correlation::CorrelationTable;
pub use errors::{CallError, DecodeError};
pub use registry::{erase, ActionOutcome, Handler, MethodRegistry, RawHandler};
pub use transport::{
    DirectTransport, InboundRpc, MessageChannel, PubSubTransport, RpcChannel, RpcChannelError,
    SendError, Transport,
};
