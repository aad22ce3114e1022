//! Cross-process message router.
//!
//! Every envelope between processes flows through the router, which provides:
//!   - Admission control (validation, role allow-lists, rate limiting)
//!   - Request/response correlation with deadlines and cancellation
//!   - Topic pub/sub with per-subscription delivery tasks
//!   - Ordered streams between two processes
//!
//! Each registered process owns a mailbox: an ordered channel of envelopes
//! addressed to it. Whatever drives the process (a wire connection or an
//! in-process worker) takes the receiving end with [`Router::take_mailbox`].

pub mod batcher;
pub mod handler;
mod pending;
pub mod stream;

pub use batcher::Batcher;
pub use handler::{FnHandler, FnSubscriber, HostHandler, TopicHandler};
pub use pending::{ReplyHandle, ReplyOutcome, RequestCanceller};
pub use stream::{StreamEvent, StreamHandle};

use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::envelope::{Envelope, MessageKind, Recipient, StreamEnd};
use crate::kernel::rate_limiter::{RateLimitConfig, RateLimiter};
use crate::kernel::recovery::recover_async;
use crate::kernel::types::{ProcessRole, RoleProfiles};
use crate::types::{
    Error, IdAllocator, LateReplyPolicy, ProcessId, RequestId, Result, RouterConfig, StreamId,
    SubscriptionId,
};
use crate::validation::Validator;
use pending::{Correlation, PendingTable};
use stream::{StreamBuffer, StreamCloser, StreamEntry};

// =============================================================================
// Routing tables
// =============================================================================

#[derive(Debug)]
struct ProcessEntry {
    role: ProcessRole,
    mailbox: Option<mpsc::UnboundedSender<Envelope>>,
    receiver: Option<mpsc::UnboundedReceiver<Envelope>>,
    /// Termination reason once the process is gone.
    gone: Option<String>,
}

#[derive(Debug)]
struct SubscriptionEntry {
    id: SubscriptionId,
    subscriber: ProcessId,
    tx: mpsc::UnboundedSender<Envelope>,
}

#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    delivered: AtomicU64,
    published: AtomicU64,
    event_deliveries: AtomicU64,
    requests: AtomicU64,
    responses: AtomicU64,
    late_replies: AtomicU64,
    rejected: Mutex<BTreeMap<&'static str, u64>>,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn reject(&self, code: &'static str) {
        let mut rejected = self.rejected.lock().unwrap_or_else(|p| p.into_inner());
        *rejected.entry(code).or_insert(0) += 1;
    }
}

/// Router statistics snapshot.
#[derive(Debug, Default, Clone, Serialize)]
pub struct RouterStats {
    pub sent: u64,
    pub delivered: u64,
    pub published: u64,
    pub event_deliveries: u64,
    pub requests: u64,
    pub responses: u64,
    pub timeouts: u64,
    pub cancelled: u64,
    pub late_replies: u64,
    /// Rejections keyed by error code.
    pub rejected: BTreeMap<String, u64>,
    pub registered_processes: usize,
    pub live_processes: usize,
    pub pending_requests: usize,
    pub subscriptions: usize,
    pub open_streams: usize,
}

struct Shared {
    config: RouterConfig,
    validator: Validator,
    rate_limiter: Mutex<RateLimiter>,
    processes: RwLock<HashMap<ProcessId, ProcessEntry>>,
    /// Terminated processes whose entries were dropped.
    retired: RwLock<HashSet<ProcessId>>,
    handlers: RwLock<HashMap<String, Arc<dyn HostHandler>>>,
    subscriptions: RwLock<HashMap<String, Vec<SubscriptionEntry>>>,
    streams: Mutex<HashMap<StreamId, StreamEntry>>,
    pending: Arc<PendingTable>,
    request_ids: IdAllocator,
    subscription_ids: IdAllocator,
    stream_ids: IdAllocator,
    counters: Counters,
}

impl fmt::Debug for Shared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("validator", &self.validator)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

// Poisoned locks still guard consistent tables: every critical section is a
// single insert, remove or retain.
fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|p| p.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|p| p.into_inner())
}

fn lock<T>(lock: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(|p| p.into_inner())
}

impl Shared {
    fn missing(&self, pid: ProcessId) -> Error {
        if read(&self.retired).contains(&pid) {
            Error::RecipientGone(format!("process {}: terminated", pid))
        } else {
            Error::UnknownRecipient(format!("process {}", pid))
        }
    }

    fn check_recipient(&self, pid: ProcessId) -> Result<()> {
        match read(&self.processes).get(&pid) {
            None => Err(self.missing(pid)),
            Some(ProcessEntry {
                gone: Some(reason), ..
            }) => Err(Error::RecipientGone(format!("process {}: {}", pid, reason))),
            Some(_) => Ok(()),
        }
    }

    /// Put an envelope in a mailbox, bypassing admission.
    fn push_mailbox(&self, pid: ProcessId, envelope: Envelope) -> Result<()> {
        let processes = read(&self.processes);
        let entry = processes.get(&pid).ok_or_else(|| self.missing(pid))?;
        if let Some(reason) = &entry.gone {
            return Err(Error::RecipientGone(format!("process {}: {}", pid, reason)));
        }
        let mailbox = entry
            .mailbox
            .as_ref()
            .ok_or_else(|| Error::RecipientGone(format!("process {}: mailbox closed", pid)))?;
        mailbox
            .send(envelope)
            .map_err(|_| Error::RecipientGone(format!("process {}: mailbox closed", pid)))?;
        Counters::bump(&self.counters.delivered);
        Ok(())
    }
}

impl StreamCloser for Shared {
    fn close_stream(&self, stream_id: StreamId, notify_peer: bool) {
        let Some(entry) = lock(&self.streams).remove(&stream_id) else {
            return;
        };
        if !notify_peer {
            return;
        }
        let close = Envelope::stream_control(
            MessageKind::StreamClose,
            entry.owner,
            entry.peer,
            entry.message_type,
            stream_id,
            serde_json::to_value(StreamEnd::Clean).unwrap_or(Value::Null),
        );
        if let Err(e) = self.push_mailbox(entry.peer, close) {
            tracing::debug!(stream_id = %stream_id, error = %e, "stream close not delivered");
        }
    }
}

// =============================================================================
// Router
// =============================================================================

/// Cross-process message router. Cheap to clone; clones share state.
#[derive(Debug, Clone)]
pub struct Router {
    shared: Arc<Shared>,
}

impl Router {
    /// Create a router. The host process is registered with id 0.
    pub fn new(
        config: RouterConfig,
        rate_limit: RateLimitConfig,
        roles: RoleProfiles,
    ) -> Result<Self> {
        let validator = Validator::new(&config, roles)?;
        let router = Self {
            shared: Arc::new(Shared {
                config,
                validator,
                rate_limiter: Mutex::new(RateLimiter::new(Some(rate_limit))),
                processes: RwLock::new(HashMap::new()),
                retired: RwLock::new(HashSet::new()),
                handlers: RwLock::new(HashMap::new()),
                subscriptions: RwLock::new(HashMap::new()),
                streams: Mutex::new(HashMap::new()),
                pending: Arc::new(PendingTable::new()),
                request_ids: IdAllocator::default(),
                subscription_ids: IdAllocator::default(),
                stream_ids: IdAllocator::default(),
                counters: Counters::default(),
            }),
        };
        router.register_process(ProcessId::HOST, ProcessRole::Host)?;
        Ok(router)
    }

    pub fn config(&self) -> &RouterConfig {
        &self.shared.config
    }

    // =========================================================================
    // Process registration
    // =========================================================================

    /// Create the mailbox of a process. Ids are never reused.
    pub fn register_process(&self, pid: ProcessId, role: ProcessRole) -> Result<()> {
        let mut processes = write(&self.shared.processes);
        if processes.contains_key(&pid) || read(&self.shared.retired).contains(&pid) {
            return Err(Error::validation(format!(
                "process {} already registered",
                pid
            )));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        processes.insert(
            pid,
            ProcessEntry {
                role,
                mailbox: Some(tx),
                receiver: Some(rx),
                gone: None,
            },
        );
        tracing::debug!(pid = %pid, role = %role, "process registered");
        Ok(())
    }

    /// Hand out the receiving end of a mailbox. Only once per process.
    pub fn take_mailbox(&self, pid: ProcessId) -> Result<mpsc::UnboundedReceiver<Envelope>> {
        let mut processes = write(&self.shared.processes);
        let entry = processes
            .get_mut(&pid)
            .ok_or_else(|| Error::not_found(format!("process {}", pid)))?;
        if let Some(reason) = &entry.gone {
            return Err(Error::RecipientGone(format!("process {}: {}", pid, reason)));
        }
        entry
            .receiver
            .take()
            .ok_or_else(|| Error::validation(format!("mailbox of process {} already taken", pid)))
    }

    pub fn role_of(&self, pid: ProcessId) -> Option<ProcessRole> {
        read(&self.shared.processes).get(&pid).map(|e| e.role)
    }

    pub fn is_live(&self, pid: ProcessId) -> bool {
        self.shared.check_recipient(pid).is_ok()
    }

    /// Drop the entry of a terminated process. Later sends to it still fail
    /// with `RecipientGone`. Returns false unless the process was gone.
    pub fn forget_process(&self, pid: ProcessId) -> bool {
        let mut processes = write(&self.shared.processes);
        if !matches!(processes.get(&pid), Some(entry) if entry.gone.is_some()) {
            return false;
        }
        processes.remove(&pid);
        write(&self.shared.retired).insert(pid);
        tracing::trace!(pid = %pid, "process forgotten");
        true
    }

    /// Mark a process terminated.
    ///
    /// Later sends fail with `RecipientGone`, its pending requests resolve with
    /// `RecipientGone`, its subscriptions are removed and its streams end
    /// abnormally. Returns false if it was unknown or already gone.
    pub fn mark_gone(&self, pid: ProcessId, reason: &str) -> bool {
        {
            let mut processes = write(&self.shared.processes);
            match processes.get_mut(&pid) {
                Some(entry) if entry.gone.is_none() => {
                    entry.gone = Some(reason.to_string());
                    entry.mailbox = None;
                    entry.receiver = None;
                }
                _ => return false,
            }
        }

        let failed = self.shared.pending.fail_process(pid, reason);

        let mut unsubscribed = 0;
        for entries in write(&self.shared.subscriptions).values_mut() {
            let before = entries.len();
            entries.retain(|s| s.subscriber != pid);
            unsubscribed += before - entries.len();
        }

        let ended: Vec<StreamEntry> = {
            let mut streams = lock(&self.shared.streams);
            let ids: Vec<StreamId> = streams
                .iter()
                .filter(|(_, s)| s.owner == pid || s.peer == pid)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| streams.remove(&id)).collect()
        };
        for entry in &ended {
            entry.buffer.abort(StreamEnd::Abnormal(format!(
                "process {} terminated: {}",
                pid, reason
            )));
        }

        lock(&self.shared.rate_limiter).clear_process(pid);

        tracing::info!(
            pid = %pid,
            reason = reason,
            failed_requests = failed,
            subscriptions = unsubscribed,
            streams = ended.len(),
            "process marked gone"
        );
        true
    }

    // =========================================================================
    // Sending
    // =========================================================================

    /// Admit and deliver an envelope.
    pub fn send(&self, envelope: Envelope) -> Result<()> {
        let sender = envelope.sender_id;
        let message_type = envelope.message_type.clone();
        self.route(envelope).map_err(|e| {
            self.record_rejection(sender, &message_type, &e);
            e
        })
    }

    /// Entry point for envelopes arriving from processes.
    ///
    /// Like [`send`](Self::send), but a rejected `Request` is also answered
    /// with an `Error` reply so the sender does not wait for its deadline.
    pub fn dispatch(&self, envelope: Envelope) -> Result<()> {
        let rejected_request = (envelope.kind == MessageKind::Request)
            .then(|| {
                envelope.request_id.map(|id| {
                    let mut header = Envelope::request(
                        envelope.sender_id,
                        envelope.recipient_process().unwrap_or(ProcessId::HOST),
                        envelope.message_type.clone(),
                        Value::Null,
                    );
                    header.request_id = Some(id);
                    header
                })
            })
            .flatten();

        let result = self.send(envelope);
        if let (Err(e), Some(header)) = (&result, rejected_request) {
            let reply = header.error_reply(e);
            if let Err(push_err) = self.shared.push_mailbox(header.sender_id, reply) {
                tracing::debug!(error = %push_err, "rejection reply not delivered");
            }
        }
        result
    }

    /// Send a request and return a handle to its reply.
    ///
    /// `timeout` defaults to the configured request timeout and is capped at
    /// the configured maximum.
    pub fn send_request(
        &self,
        mut envelope: Envelope,
        timeout: Option<Duration>,
    ) -> Result<ReplyHandle> {
        if envelope.kind != MessageKind::Request {
            return Err(Error::malformed(format!(
                "send_request needs a request envelope, got {:?}",
                envelope.kind
            )));
        }
        let recipient = envelope
            .recipient_process()
            .ok_or_else(|| Error::malformed("requests must be addressed to a process"))?;

        let request_id: RequestId = self.shared.request_ids.next();
        envelope.request_id = Some(request_id);

        let config = &self.shared.config;
        let timeout = timeout
            .unwrap_or(config.default_request_timeout)
            .min(config.max_request_timeout);
        let deadline = Instant::now() + timeout;
        let rx = self.shared.pending.insert(
            request_id,
            envelope.sender_id,
            recipient,
            &envelope.message_type,
        );

        if let Err(e) = self.send(envelope) {
            self.shared.pending.remove(request_id);
            return Err(e);
        }
        Counters::bump(&self.shared.counters.requests);

        Ok(ReplyHandle::new(
            request_id,
            recipient,
            deadline,
            rx,
            Arc::clone(&self.shared.pending),
        ))
    }

    /// Send a request and wait for its reply.
    pub async fn request(&self, envelope: Envelope, timeout: Option<Duration>) -> Result<Envelope> {
        self.send_request(envelope, timeout)?.wait().await
    }

    fn route(&self, envelope: Envelope) -> Result<()> {
        if let Recipient::Process(pid) = envelope.recipient {
            self.shared.check_recipient(pid)?;
        }
        self.admit(&envelope)?;
        Counters::bump(&self.shared.counters.sent);

        match envelope.kind {
            MessageKind::Response | MessageKind::Error => self.route_reply(envelope),
            MessageKind::Event => {
                self.fan_out(envelope);
                Ok(())
            }
            MessageKind::StreamData | MessageKind::StreamClose => self.route_stream(envelope),
            MessageKind::Notify | MessageKind::Request | MessageKind::StreamOpen => {
                self.deliver(envelope)
            }
        }
    }

    /// Sender checks, validation and rate limiting.
    fn admit(&self, envelope: &Envelope) -> Result<()> {
        let sender = envelope.sender_id;
        let role = match read(&self.shared.processes).get(&sender) {
            None => {
                return Err(Error::Unauthorized(format!(
                    "sender {} is not registered",
                    sender
                )))
            }
            Some(ProcessEntry { gone: Some(_), .. }) => {
                return Err(Error::Unauthorized(format!(
                    "sender {} has terminated",
                    sender
                )))
            }
            Some(entry) => entry.role,
        };

        self.shared.validator.validate(envelope, role)?;

        // Replies are bounded by the requests they answer.
        if !envelope.kind.is_reply() {
            lock(&self.shared.rate_limiter).check_rate_limit(sender, &envelope.message_type)?;
        }
        Ok(())
    }

    fn deliver(&self, envelope: Envelope) -> Result<()> {
        let Some(pid) = envelope.recipient_process() else {
            return Err(Error::malformed("expected a process recipient"));
        };

        if pid.is_host() && matches!(envelope.kind, MessageKind::Request | MessageKind::Notify) {
            let handler = read(&self.shared.handlers)
                .get(&envelope.message_type)
                .cloned();
            if let Some(handler) = handler {
                self.spawn_handler(handler, envelope);
                Counters::bump(&self.shared.counters.delivered);
                return Ok(());
            }
        }

        self.shared.push_mailbox(pid, envelope)
    }

    fn spawn_handler(&self, handler: Arc<dyn HostHandler>, envelope: Envelope) {
        let router = self.clone();
        tokio::spawn(async move {
            let outcome = recover_async(handler.handle(&envelope), "host handler").await;
            if envelope.kind != MessageKind::Request {
                if let Err(e) = outcome {
                    tracing::warn!(
                        message_type = %envelope.message_type,
                        sender = %envelope.sender_id,
                        error = %e,
                        "host handler failed"
                    );
                }
                return;
            }
            let reply = match outcome {
                Ok(payload) => envelope.reply(payload),
                Err(e) => envelope.error_reply(&e),
            };
            if let Err(e) = router.send(reply) {
                tracing::debug!(
                    message_type = %envelope.message_type,
                    error = %e,
                    "host handler reply not delivered"
                );
            }
        });
    }

    fn route_reply(&self, reply: Envelope) -> Result<()> {
        match self.shared.pending.correlate(reply) {
            Correlation::Resolved => {
                Counters::bump(&self.shared.counters.responses);
                Ok(())
            }
            Correlation::WrongSender(reply) => Err(Error::Unauthorized(format!(
                "process {} cannot answer request {:?}",
                reply.sender_id, reply.request_id
            ))),
            Correlation::NotPending(reply) if reply.recipient == Recipient::Process(ProcessId::HOST) => {
                Counters::bump(&self.shared.counters.late_replies);
                if self.shared.config.late_reply_policy == LateReplyPolicy::Log {
                    tracing::warn!(
                        request_id = ?reply.request_id,
                        sender = %reply.sender_id,
                        message_type = %reply.message_type,
                        "late reply dropped"
                    );
                }
                Ok(())
            }
            // Replies between worker processes pass through.
            Correlation::NotPending(reply) => self.deliver_raw(reply),
        }
    }

    fn deliver_raw(&self, envelope: Envelope) -> Result<()> {
        match envelope.recipient_process() {
            Some(pid) => self.shared.push_mailbox(pid, envelope),
            None => Err(Error::malformed("expected a process recipient")),
        }
    }

    // =========================================================================
    // Host handlers
    // =========================================================================

    /// Handle `Request`/`Notify` envelopes of `message_type` addressed to the host.
    pub fn register_handler(
        &self,
        message_type: impl Into<String>,
        handler: Arc<dyn HostHandler>,
    ) -> Result<()> {
        let message_type = message_type.into();
        let mut handlers = write(&self.shared.handlers);
        if handlers.contains_key(&message_type) {
            return Err(Error::validation(format!(
                "handler already registered: {}",
                message_type
            )));
        }
        tracing::debug!(message_type = %message_type, "host handler registered");
        handlers.insert(message_type, handler);
        Ok(())
    }

    pub fn unregister_handler(&self, message_type: &str) -> bool {
        write(&self.shared.handlers).remove(message_type).is_some()
    }

    // =========================================================================
    // Publish / subscribe
    // =========================================================================

    /// Publish on a topic. Returns the number of subscriptions it was queued to.
    pub fn publish(&self, sender: ProcessId, topic: &str, payload: Value) -> Result<usize> {
        let envelope = Envelope::event(sender, topic, payload);
        let message_type = envelope.message_type.clone();
        self.admit(&envelope).map_err(|e| {
            self.record_rejection(sender, &message_type, &e);
            e
        })?;
        Counters::bump(&self.shared.counters.sent);
        Ok(self.fan_out(envelope))
    }

    fn fan_out(&self, envelope: Envelope) -> usize {
        let topic = match &envelope.recipient {
            Recipient::Topic { topic } => topic.clone(),
            Recipient::Process(_) => return 0,
        };
        let subscriptions = read(&self.shared.subscriptions);
        let queued = subscriptions
            .get(&topic)
            .map(|subs| {
                subs.iter()
                    .filter(|s| s.tx.send(envelope.clone()).is_ok())
                    .count()
            })
            .unwrap_or(0);

        Counters::bump(&self.shared.counters.published);
        self.shared
            .counters
            .event_deliveries
            .fetch_add(queued as u64, Ordering::Relaxed);
        tracing::debug!(topic = %topic, subscribers = queued, "event published");
        queued
    }

    /// Subscribe with a handler running on its own delivery task.
    pub fn subscribe(
        &self,
        topic: &str,
        subscriber: ProcessId,
        handler: Arc<dyn TopicHandler>,
    ) -> Result<SubscriptionId> {
        let (id, mut rx) = self.subscribe_channel(topic, subscriber)?;
        let topic = topic.to_string();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(e) = recover_async(handler.on_event(&event), "topic subscriber").await {
                    tracing::warn!(
                        subscription_id = %id,
                        topic = %topic,
                        error = %e,
                        "subscriber failed"
                    );
                }
            }
            tracing::trace!(subscription_id = %id, "subscription delivery ended");
        });
        Ok(id)
    }

    /// Subscribe and receive events on a channel.
    pub fn subscribe_channel(
        &self,
        topic: &str,
        subscriber: ProcessId,
    ) -> Result<(SubscriptionId, mpsc::UnboundedReceiver<Envelope>)> {
        if topic.is_empty() {
            return Err(Error::validation("topic cannot be empty"));
        }
        self.shared.check_recipient(subscriber)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let id: SubscriptionId = self.shared.subscription_ids.next();
        write(&self.shared.subscriptions)
            .entry(topic.to_string())
            .or_default()
            .push(SubscriptionEntry { id, subscriber, tx });

        tracing::debug!(subscription_id = %id, topic = topic, subscriber = %subscriber, "subscribed");
        Ok((id, rx))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscriptions = write(&self.shared.subscriptions);
        let mut removed = false;
        for entries in subscriptions.values_mut() {
            let before = entries.len();
            entries.retain(|s| s.id != id);
            removed |= entries.len() != before;
        }
        subscriptions.retain(|_, entries| !entries.is_empty());
        removed
    }

    // =========================================================================
    // Streams
    // =========================================================================

    /// Open a stream on which `peer` sends ordered data to `owner`.
    pub fn open_stream(
        &self,
        owner: ProcessId,
        peer: ProcessId,
        message_type: &str,
    ) -> Result<StreamHandle> {
        let stream_id: StreamId = self.shared.stream_ids.next();
        let open = Envelope::stream_control(
            MessageKind::StreamOpen,
            owner,
            peer,
            message_type,
            stream_id,
            Value::Null,
        );

        let buffer = Arc::new(StreamBuffer::default());
        lock(&self.shared.streams).insert(
            stream_id,
            StreamEntry {
                owner,
                peer,
                message_type: message_type.to_string(),
                next_seq: 0,
                buffer: Arc::clone(&buffer),
            },
        );

        if let Err(e) = self.send(open) {
            lock(&self.shared.streams).remove(&stream_id);
            return Err(e);
        }
        tracing::debug!(stream_id = %stream_id, owner = %owner, peer = %peer, "stream opened");

        let closer: Arc<dyn StreamCloser> = self.shared.clone();
        Ok(StreamHandle::new(stream_id, owner, peer, buffer, closer))
    }

    fn route_stream(&self, envelope: Envelope) -> Result<()> {
        let Some(stream_id) = envelope.stream_id else {
            return Err(Error::malformed("stream envelope without a stream id"));
        };

        let mut streams = lock(&self.shared.streams);
        let Some(entry) = streams.get_mut(&stream_id) else {
            drop(streams);
            return self.deliver(envelope);
        };
        if envelope.recipient != Recipient::Process(entry.owner) {
            drop(streams);
            return self.deliver(envelope);
        }
        if envelope.sender_id != entry.peer {
            return Err(Error::Unauthorized(format!(
                "process {} is not the peer of stream {}",
                envelope.sender_id, stream_id
            )));
        }

        match envelope.kind {
            MessageKind::StreamData => {
                let seq = envelope.seq.unwrap_or(u64::MAX);
                if seq != entry.next_seq {
                    let expected = entry.next_seq;
                    if let Some(entry) = streams.remove(&stream_id) {
                        entry.buffer.abort(StreamEnd::Abnormal(format!(
                            "sequence gap: expected {}, got {}",
                            expected, seq
                        )));
                    }
                    return Err(Error::malformed(format!(
                        "stream {} sequence gap: expected {}, got {}",
                        stream_id, expected, seq
                    )));
                }
                entry.next_seq += 1;
                entry.buffer.push_data(envelope);
                Counters::bump(&self.shared.counters.delivered);
                Ok(())
            }
            _ => {
                let end: StreamEnd =
                    serde_json::from_value(envelope.payload).unwrap_or(StreamEnd::Clean);
                if let Some(entry) = streams.remove(&stream_id) {
                    match end {
                        StreamEnd::Clean => entry.buffer.finish(StreamEnd::Clean),
                        abnormal => entry.buffer.abort(abnormal),
                    }
                }
                tracing::debug!(stream_id = %stream_id, "stream closed by peer");
                Ok(())
            }
        }
    }

    // =========================================================================
    // Statistics
    // =========================================================================

    fn record_rejection(&self, sender: ProcessId, message_type: &str, error: &Error) {
        self.shared.counters.reject(error.to_ipc_error_code());
        tracing::warn!(
            sender = %sender,
            message_type = message_type,
            code = error.to_ipc_error_code(),
            error = %error,
            "envelope rejected"
        );
    }

    pub fn stats(&self) -> RouterStats {
        let counters = &self.shared.counters;
        let (registered_processes, live_processes) = {
            let processes = read(&self.shared.processes);
            (
                processes.len(),
                processes.values().filter(|e| e.gone.is_none()).count(),
            )
        };
        RouterStats {
            sent: counters.sent.load(Ordering::Relaxed),
            delivered: counters.delivered.load(Ordering::Relaxed),
            published: counters.published.load(Ordering::Relaxed),
            event_deliveries: counters.event_deliveries.load(Ordering::Relaxed),
            requests: counters.requests.load(Ordering::Relaxed),
            responses: counters.responses.load(Ordering::Relaxed),
            timeouts: self.shared.pending.timeouts(),
            cancelled: self.shared.pending.cancelled(),
            late_replies: counters.late_replies.load(Ordering::Relaxed),
            rejected: lock(&counters.rejected)
                .iter()
                .map(|(code, n)| (code.to_string(), *n))
                .collect(),
            registered_processes,
            live_processes,
            pending_requests: self.shared.pending.len(),
            subscriptions: read(&self.shared.subscriptions)
                .values()
                .map(Vec::len)
                .sum(),
            open_streams: lock(&self.shared.streams).len(),
        }
    }

    /// Drop rate-limit windows idle for a full window.
    pub fn cleanup_rate_limits(&self) -> usize {
        lock(&self.shared.rate_limiter).cleanup_expired()
    }
}

// =============================================================================
// Tests
// =============================================================================
