//! Pending request table and reply handles.
//!
//! Whoever removes an entry resolves it, and the completion is sent while the
//! table lock is held. A waiter that finds its entry already gone can therefore
//! rely on the outcome being in its channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::envelope::Envelope;
use crate::types::{Error, ProcessId, RequestId, Result};

/// Terminal outcome of a request: the `Response` envelope, or why there is none.
pub type ReplyOutcome = Result<Envelope>;

#[derive(Debug)]
struct PendingRequest {
    tx: oneshot::Sender<ReplyOutcome>,
    requester: ProcessId,
    recipient: ProcessId,
    message_type: String,
    submitted_at: Instant,
}

/// What happened to a reply offered to the table. Unmatched replies are
/// handed back.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Correlation {
    /// Matched a pending request and resolved it.
    Resolved,
    /// No pending request with that id and requester.
    NotPending(Envelope),
    /// Pending, but the reply came from a process other than the recipient.
    WrongSender(Envelope),
}

#[derive(Debug, Default)]
pub(crate) struct PendingTable {
    entries: Mutex<HashMap<RequestId, PendingRequest>>,
    timeouts: AtomicU64,
    cancelled: AtomicU64,
}

impl PendingTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<RequestId, PendingRequest>> {
        // A poisoned table still holds consistent entries: every mutation is a
        // single insert or remove.
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub(crate) fn insert(
        &self,
        request_id: RequestId,
        requester: ProcessId,
        recipient: ProcessId,
        message_type: &str,
    ) -> oneshot::Receiver<ReplyOutcome> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(
            request_id,
            PendingRequest {
                tx,
                requester,
                recipient,
                message_type: message_type.to_string(),
                submitted_at: Instant::now(),
            },
        );
        rx
    }

    /// Offer a `Response`/`Error` envelope.
    pub(crate) fn correlate(&self, reply: Envelope) -> Correlation {
        let (Some(request_id), Some(requester)) = (reply.request_id, reply.recipient_process())
        else {
            return Correlation::NotPending(reply);
        };

        let mut entries = self.lock();
        match entries.get(&request_id) {
            None => return Correlation::NotPending(reply),
            Some(pending) if pending.requester != requester => {
                return Correlation::NotPending(reply)
            }
            Some(pending) if pending.recipient != reply.sender_id => {
                return Correlation::WrongSender(reply)
            }
            Some(_) => {}
        }
        if let Some(pending) = entries.remove(&request_id) {
            tracing::trace!(
                request_id = %request_id,
                message_type = %pending.message_type,
                elapsed_ms = pending.submitted_at.elapsed().as_millis() as u64,
                "request resolved"
            );
            let _ = pending.tx.send(reply.into_response());
        }
        Correlation::Resolved
    }

    /// Remove without resolving. Returns whether the entry was still pending.
    pub(crate) fn remove(&self, request_id: RequestId) -> bool {
        self.lock().remove(&request_id).is_some()
    }

    /// Resolve with an error if still pending.
    pub(crate) fn fail(&self, request_id: RequestId, error: Error) -> bool {
        match self.lock().remove(&request_id) {
            Some(pending) => {
                let _ = pending.tx.send(Err(error));
                true
            }
            None => false,
        }
    }

    /// Resolve every request addressed to `pid` with `RecipientGone`, and drop
    /// requests issued by it. Returns the number resolved.
    pub(crate) fn fail_process(&self, pid: ProcessId, reason: &str) -> usize {
        let mut entries = self.lock();
        let affected: Vec<RequestId> = entries
            .iter()
            .filter(|(_, p)| p.recipient == pid || p.requester == pid)
            .map(|(id, _)| *id)
            .collect();
        let mut resolved = 0;
        for id in affected {
            if let Some(pending) = entries.remove(&id) {
                if pending.recipient == pid {
                    let _ = pending.tx.send(Err(Error::RecipientGone(format!(
                        "process {} terminated: {}",
                        pid, reason
                    ))));
                    resolved += 1;
                }
            }
        }
        resolved
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    pub(crate) fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    pub(crate) fn cancelled(&self) -> u64 {
        self.cancelled.load(Ordering::Relaxed)
    }
}

/// Handle to an in-flight request.
///
/// Dropping the handle frees the pending entry; a reply arriving afterwards is
/// treated as late.
#[derive(Debug)]
pub struct ReplyHandle {
    request_id: RequestId,
    recipient: ProcessId,
    deadline: Instant,
    rx: oneshot::Receiver<ReplyOutcome>,
    table: Arc<PendingTable>,
}

impl ReplyHandle {
    pub(crate) fn new(
        request_id: RequestId,
        recipient: ProcessId,
        deadline: Instant,
        rx: oneshot::Receiver<ReplyOutcome>,
        table: Arc<PendingTable>,
    ) -> Self {
        Self {
            request_id,
            recipient,
            deadline,
            rx,
            table,
        }
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn recipient(&self) -> ProcessId {
        self.recipient
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Cancel the request. A concurrent or later `wait` returns `Cancelled`.
    pub fn cancel(&self) -> bool {
        cancel_pending(&self.table, self.request_id)
    }

    /// Detached canceller usable from another task.
    pub fn canceller(&self) -> RequestCanceller {
        RequestCanceller {
            request_id: self.request_id,
            table: Arc::clone(&self.table),
        }
    }

    /// Wait for the reply or the deadline.
    pub async fn wait(mut self) -> Result<Envelope> {
        tokio::select! {
            biased;
            outcome = &mut self.rx => {
                outcome.unwrap_or_else(|_| Err(Error::internal("reply channel closed")))
            }
            _ = tokio::time::sleep_until(self.deadline) => {
                if self.table.remove(self.request_id) {
                    self.table.timeouts.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(
                        request_id = %self.request_id,
                        recipient = %self.recipient,
                        "request timed out"
                    );
                    Err(Error::timeout(format!(
                        "request {} to process {} timed out",
                        self.request_id, self.recipient
                    )))
                } else {
                    // Resolved concurrently with the deadline; the outcome is already sent.
                    self.rx
                        .try_recv()
                        .unwrap_or_else(|_| Err(Error::internal("reply channel closed")))
                }
            }
        }
    }
}

impl Drop for ReplyHandle {
    fn drop(&mut self) {
        self.table.remove(self.request_id);
    }
}

/// Cancels one request from anywhere.
#[derive(Debug, Clone)]
pub struct RequestCanceller {
    request_id: RequestId,
    table: Arc<PendingTable>,
}

impl RequestCanceller {
    pub fn cancel(&self) -> bool {
        cancel_pending(&self.table, self.request_id)
    }
}

fn cancel_pending(table: &PendingTable, request_id: RequestId) -> bool {
    let cancelled = table.fail(
        request_id,
        Error::cancelled(format!("request {} cancelled", request_id)),
    );
    if cancelled {
        table.cancelled.fetch_add(1, Ordering::Relaxed);
    }
    cancelled
}
