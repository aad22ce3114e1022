//! Ordered multi-message channels between two processes.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use crate::envelope::{Envelope, StreamEnd};
use crate::types::{ProcessId, StreamId};

/// One item observed by a stream consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Data(Envelope),
    End(StreamEnd),
}

#[derive(Debug, Default)]
struct BufferState {
    queue: VecDeque<StreamEvent>,
    /// Set once the stream ended; further pushes are ignored.
    closed: bool,
    /// Terminal state already observed by the consumer (or forced by abort).
    end: Option<StreamEnd>,
}

/// Single-consumer buffer behind a [`StreamHandle`].
#[derive(Debug, Default)]
pub(crate) struct StreamBuffer {
    state: Mutex<BufferState>,
    notify: Notify,
}

impl StreamBuffer {
    fn lock(&self) -> std::sync::MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Queue a data item. Returns false once the stream has ended.
    pub(crate) fn push_data(&self, envelope: Envelope) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        state.queue.push_back(StreamEvent::Data(envelope));
        drop(state);
        self.notify.notify_one();
        true
    }

    /// In-band end marker: observed after everything queued before it.
    pub(crate) fn finish(&self, end: StreamEnd) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        state.queue.push_back(StreamEvent::End(end));
        drop(state);
        self.notify.notify_one();
    }

    /// End immediately, discarding undelivered items.
    pub(crate) fn abort(&self, end: StreamEnd) {
        let mut state = self.lock();
        if state.end.is_some() {
            return;
        }
        let discarded = state.queue.len();
        state.queue.clear();
        state.closed = true;
        state.end = Some(end);
        drop(state);
        if discarded > 0 {
            tracing::debug!(discarded, "stream aborted with undelivered items");
        }
        self.notify.notify_one();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.lock().closed
    }

    async fn next(&self) -> StreamEvent {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.lock();
                if let Some(end) = &state.end {
                    return StreamEvent::End(end.clone());
                }
                if let Some(event) = state.queue.pop_front() {
                    if let StreamEvent::End(end) = &event {
                        state.end = Some(end.clone());
                    }
                    return event;
                }
            }
            notified.await;
        }
    }
}

/// Routing-table entry for an open stream.
#[derive(Debug)]
pub(crate) struct StreamEntry {
    pub(crate) owner: ProcessId,
    pub(crate) peer: ProcessId,
    pub(crate) message_type: String,
    pub(crate) next_seq: u64,
    pub(crate) buffer: Arc<StreamBuffer>,
}

/// Close request a handle hands back to the router.
pub(crate) trait StreamCloser: Send + Sync + std::fmt::Debug {
    fn close_stream(&self, stream_id: StreamId, notify_peer: bool);
}

/// Consumer side of a stream opened with `Router::open_stream`.
///
/// After the end is observed, `next` keeps returning it.
#[derive(Debug)]
pub struct StreamHandle {
    id: StreamId,
    owner: ProcessId,
    peer: ProcessId,
    buffer: Arc<StreamBuffer>,
    closer: Arc<dyn StreamCloser>,
}

impl StreamHandle {
    pub(crate) fn new(
        id: StreamId,
        owner: ProcessId,
        peer: ProcessId,
        buffer: Arc<StreamBuffer>,
        closer: Arc<dyn StreamCloser>,
    ) -> Self {
        Self {
            id,
            owner,
            peer,
            buffer,
            closer,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn owner(&self) -> ProcessId {
        self.owner
    }

    pub fn peer(&self) -> ProcessId {
        self.peer
    }

    /// Next item in send order, or the end of the stream.
    pub async fn next(&mut self) -> StreamEvent {
        self.buffer.next().await
    }

    /// Collect data payloads until the stream ends.
    pub async fn collect(mut self) -> (Vec<Envelope>, StreamEnd) {
        let mut items = Vec::new();
        loop {
            match self.next().await {
                StreamEvent::Data(envelope) => items.push(envelope),
                StreamEvent::End(end) => return (items, end),
            }
        }
    }

    /// Close locally. Undelivered items are discarded and the peer is told.
    pub fn close(&self) {
        self.buffer.abort(StreamEnd::Clean);
        self.closer.close_stream(self.id, true);
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        if !self.buffer.is_closed() {
            self.buffer.abort(StreamEnd::Clean);
            self.closer.close_stream(self.id, true);
        } else {
            self.closer.close_stream(self.id, false);
        }
    }
}
