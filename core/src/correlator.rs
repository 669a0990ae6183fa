/// Request/response correlation.
///
/// Each pending request owns a oneshot sender and a deadline timer. Exactly
/// one of three things settles it: a matching response (resolved or remote
/// error), the deadline (timeout), or shutdown. Whichever comes first removes
/// the entry, so anything arriving later finds nothing to match and is
/// dropped.
use crate::errors::{BridgeError, BridgeResult};
use crate::message::Message;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

struct PendingRequest {
    tx: oneshot::Sender<BridgeResult<Value>>,
    deadline: Instant,
    timer: JoinHandle<()>,
}

/// Future resolving to the settled outcome of one request
pub struct PendingResponse {
    request_id: String,
    rx: oneshot::Receiver<BridgeResult<Value>>,
}

impl PendingResponse {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }
}

impl Future for PendingResponse {
    type Output = BridgeResult<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|settled| settled.unwrap_or(Err(BridgeError::ShuttingDown)))
    }
}

#[derive(Default)]
pub struct Correlator {
    pending: Arc<DashMap<String, PendingRequest>>,
    closed: AtomicBool,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new request. Fails without touching the existing entry if
    /// `request_id` is already pending.
    pub fn register(&self, request_id: &str, timeout: Duration) -> BridgeResult<PendingResponse> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BridgeError::ShuttingDown);
        }

        match self.pending.entry(request_id.to_string()) {
            Entry::Occupied(_) => Err(BridgeError::DuplicateRequestId(request_id.to_string())),
            Entry::Vacant(slot) => {
                let (tx, rx) = oneshot::channel();
                let deadline = Instant::now() + timeout;
                let timer = tokio::spawn(expire(
                    Arc::clone(&self.pending),
                    request_id.to_string(),
                    deadline,
                    timeout,
                ));
                slot.insert(PendingRequest {
                    tx,
                    deadline,
                    timer,
                });
                debug!("Request {} pending for {:?}", request_id, timeout);
                Ok(PendingResponse {
                    request_id: request_id.to_string(),
                    rx,
                })
            }
        }
    }

    /// Settle the pending request matching a response message. Returns
    /// false if the message is not a response or nothing is waiting for it.
    pub fn settle(&self, message: &Message) -> bool {
        if !message.is_response() {
            return false;
        }
        let Some(request_id) = message.request_id() else {
            return false;
        };
        let Some((_, pending)) = self.pending.remove(request_id) else {
            debug!("Dropping response for unknown or expired request {}", request_id);
            return false;
        };

        pending.timer.abort();
        let outcome = match message.error() {
            Some(error) if !error.is_null() => Err(BridgeError::Remote(error.clone())),
            _ => Ok(message.result().cloned().unwrap_or(Value::Null)),
        };
        if pending.tx.send(outcome).is_err() {
            debug!("Requester for {} went away before the response", request_id);
        }
        true
    }

    /// Reject one pending request with `error`.
    pub fn cancel(&self, request_id: &str, error: BridgeError) -> bool {
        match self.pending.remove(request_id) {
            Some((_, pending)) => {
                pending.timer.abort();
                let _ = pending.tx.send(Err(error));
                true
            }
            None => false,
        }
    }

    /// Drop a pending request without notifying its waiter.
    pub fn forget(&self, request_id: &str) {
        if let Some((_, pending)) = self.pending.remove(request_id) {
            pending.timer.abort();
        }
    }

    /// Reject every pending request with `ShuttingDown` and refuse new ones.
    /// Returns the number rejected.
    pub fn shutdown(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        let rejected = ids
            .iter()
            .filter(|id| self.cancel(id, BridgeError::ShuttingDown))
            .count();
        if rejected > 0 {
            warn!("Rejected {} pending request(s) on shutdown", rejected);
        }
        rejected
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, request_id: &str) -> bool {
        self.pending.contains_key(request_id)
    }

    /// Time left before `request_id` times out
    pub fn remaining(&self, request_id: &str) -> Option<Duration> {
        self.pending
            .get(request_id)
            .map(|p| p.deadline.saturating_duration_since(Instant::now()))
    }
}

async fn expire(
    pending: Arc<DashMap<String, PendingRequest>>,
    request_id: String,
    deadline: Instant,
    timeout: Duration,
) {
    tokio::time::sleep_until(deadline).await;
    if let Some((_, entry)) = pending.remove(&request_id) {
        debug!("Request {} timed out after {:?}", request_id, timeout);
        let _ = entry.tx.send(Err(BridgeError::Timeout {
            waited: timeout,
            operation: format!("response to {}", request_id),
        }));
    }
}
