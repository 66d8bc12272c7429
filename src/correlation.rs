use crate::{codec::CorrelationId, errors::CallError};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::{
    sync::oneshot,
    task::JoinHandle,
    time::{self, Instant},
};
use tracing::debug;

/// Tracks in-flight outbound requests by correlation id and settles each one
/// exactly once: with the response payload, with a remote/transport error,
/// by timeout, or with [`CallError::ConnectionClosed`] when the table is
/// closed.
///
/// Required when the transport is pub/sub (the channel gives no pairing of
/// responses to requests); the direct strategy gets this for free from its
/// channel primitive.
#[derive(Default)]
pub struct CorrelationTable {
    pending: Mutex<HashMap<CorrelationId, PendingCall>>,
    closed: AtomicBool,
}

struct PendingCall {
    tx: oneshot::Sender<Result<Vec<u8>, CallError>>,
    // None only in the window between insertion and timer arming.
    timer: Option<JoinHandle<()>>,
}

impl PendingCall {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

impl CorrelationTable {
    pub fn new() -> Arc<Self> {
        Arc::default()
    }

    /// Creates a PendingCall for `id`, arms its timeout timer, and returns
    /// the reply future. Dropping the reply without awaiting it removes the
    /// entry and cancels the timer, leaving other calls untouched.
    pub fn register(
        self: &Arc<Self>,
        id: CorrelationId,
        method_key: String,
        timeout: Duration,
    ) -> PendingReply {
        let (tx, rx) = oneshot::channel();

        // The closed check and the insert share one critical section with
        // close()'s drain, so a call can never slip in between the flag
        // store and the drain and survive teardown. The entry also goes in
        // before the timer is spawned: with a zero timeout the timer can
        // fire immediately, and it must find its entry.
        {
            let mut pending = self.pending.lock().unwrap();
            if self.closed.load(Ordering::Acquire) {
                drop(pending);
                let _ = tx.send(Err(CallError::ConnectionClosed));
                return PendingReply {
                    id,
                    table: Arc::clone(self),
                    rx,
                };
            }
            let replaced = pending.insert(id.clone(), PendingCall { tx, timer: None });
            // Ids are UUIDs; a collision would misroute a response.
            debug_assert!(replaced.is_none(), "correlation id reused: {id}");
        }

        let timer = {
            let table = Arc::clone(self);
            let id = id.clone();
            let started = Instant::now();
            tokio::spawn(async move {
                time::sleep(timeout).await;
                table.expire(&id, &method_key, started.elapsed());
            })
        };

        match self.pending.lock().unwrap().get_mut(&id) {
            Some(call) => call.timer = Some(timer),
            // Settled or torn down while the timer was being armed.
            None => timer.abort(),
        }

        PendingReply {
            id,
            table: Arc::clone(self),
            rx,
        }
    }

    /// Settles the matching call with a successful payload. A late,
    /// duplicate, or spoofed id is discarded; it can never settle an
    /// unrelated or already-settled call.
    pub fn resolve(&self, id: &CorrelationId, payload: Vec<u8>) {
        self.settle(id, Ok(payload));
    }

    /// Settles the matching call with a failure, same removal discipline as
    /// [`resolve`](Self::resolve).
    pub fn reject(&self, id: &CorrelationId, error: CallError) {
        self.settle(id, Err(error));
    }

    fn settle(&self, id: &CorrelationId, outcome: Result<Vec<u8>, CallError>) {
        let removed = self.pending.lock().unwrap().remove(id);
        match removed {
            Some(mut call) => {
                call.cancel_timer();
                let _ = call.tx.send(outcome);
            }
            None => debug!(correlation_id = %id, "discarding late or duplicate response"),
        }
    }

    fn expire(&self, id: &CorrelationId, method_key: &str, elapsed: Duration) {
        if let Some(call) = self.pending.lock().unwrap().remove(id) {
            debug!(correlation_id = %id, method_key, ?elapsed, "call timed out");
            let _ = call.tx.send(Err(CallError::Timeout {
                method_key: method_key.to_owned(),
                elapsed,
            }));
        }
    }

    /// Rejects every pending call with [`CallError::ConnectionClosed`] and
    /// cancels every timer. Calls registered afterwards settle the same way
    /// immediately.
    pub fn close(&self) {
        let drained: Vec<_> = {
            let mut pending = self.pending.lock().unwrap();
            self.closed.store(true, Ordering::Release);
            pending.drain().collect()
        };
        for (_, mut call) in drained {
            call.cancel_timer();
            let _ = call.tx.send(Err(CallError::ConnectionClosed));
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

/// The caller's half of one PendingCall.
pub struct PendingReply {
    id: CorrelationId,
    table: Arc<CorrelationTable>,
    rx: oneshot::Receiver<Result<Vec<u8>, CallError>>,
}

impl PendingReply {
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.id
    }

    /// Waits for the call to settle.
    pub async fn recv(mut self) -> Result<Vec<u8>, CallError> {
        match (&mut self.rx).await {
            Ok(outcome) => outcome,
            // Sender dropped without settling: only possible during teardown.
            Err(_) => Err(CallError::ConnectionClosed),
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        if let Some(mut call) = self.table.pending.lock().unwrap().remove(&self.id) {
            call.cancel_timer();
        }
    }
}
