use std::time::Duration;
use thiserror::Error;

/// Failure of a single outbound call.
///
/// Every variant is returned to the immediate caller; nothing in this crate
/// swallows a failure except the deliberately-discarded late/duplicate
/// response, which is logged at debug level by the correlation table.
#[derive(Debug, Error)]
pub enum CallError {
    /// No response arrived within the configured window.
    #[error("call to {method_key} timed out after {elapsed:?}")]
    Timeout {
        method_key: String,
        elapsed: Duration,
    },

    /// The send itself failed (peer unknown, channel not connected).
    #[error("transport failure: {0}")]
    Transport(String),

    /// The remote handler ran and explicitly reported failure. The message
    /// is authored by the remote side and is intended to be human-readable.
    #[error("remote failure: {0}")]
    Remote(String),

    /// Response bytes could not be parsed into the expected structure.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// The session was torn down while this call was still pending.
    #[error("connection closed")]
    ConnectionClosed,
}

/// Malformed payload bytes, treated as a protocol violation. Carries the
/// original length so truncation shows up in diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed payload ({len} bytes): {reason}")]
pub struct DecodeError {
    pub len: usize,
    pub reason: String,
}

impl DecodeError {
    pub fn new(len: usize, reason: impl Into<String>) -> Self {
        Self {
            len,
            reason: reason.into(),
        }
    }
}
