//! Outbound batching for wire-attached processes.
//!
//! Coalesces a mailbox into batches. A batch is flushed when it reaches
//! `max_envelopes` or `max_bytes`, or when `flush_interval` has elapsed since
//! its first envelope was buffered. Order is preserved.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

use crate::envelope::Envelope;
use crate::types::BatchConfig;

/// Batches in flight between the batcher task and its consumer.
const BATCH_CHANNEL_DEPTH: usize = 16;

#[derive(Debug)]
pub struct Batcher;

impl Batcher {
    /// Spawn the batching task. It ends when the mailbox closes (after a final
    /// flush) or when the returned receiver is dropped.
    pub fn spawn(
        mailbox: mpsc::UnboundedReceiver<Envelope>,
        config: BatchConfig,
    ) -> mpsc::Receiver<Vec<Envelope>> {
        let (tx, rx) = mpsc::channel(BATCH_CHANNEL_DEPTH);
        let _task: JoinHandle<()> = tokio::spawn(run(mailbox, tx, config));
        rx
    }
}

async fn run(
    mut mailbox: mpsc::UnboundedReceiver<Envelope>,
    out: mpsc::Sender<Vec<Envelope>>,
    config: BatchConfig,
) {
    let max_envelopes = config.max_envelopes.max(1);
    let mut batch: Vec<Envelope> = Vec::new();
    let mut batch_bytes = 0usize;
    let mut deadline: Option<Instant> = None;

    loop {
        let received = match deadline {
            Some(at) => tokio::select! {
                biased;
                msg = mailbox.recv() => Some(msg),
                _ = sleep_until(at) => None,
            },
            None => Some(mailbox.recv().await),
        };

        match received {
            Some(Some(envelope)) => {
                if batch.is_empty() {
                    deadline = Some(Instant::now() + config.flush_interval);
                }
                batch_bytes += envelope.encoded_len();
                batch.push(envelope);
                if batch.len() >= max_envelopes || batch_bytes >= config.max_bytes {
                    if !flush(&out, &mut batch).await {
                        return;
                    }
                    batch_bytes = 0;
                    deadline = None;
                }
            }
            Some(None) => {
                if !batch.is_empty() {
                    flush(&out, &mut batch).await;
                }
                tracing::trace!("mailbox closed, batcher exiting");
                return;
            }
            None => {
                if !flush(&out, &mut batch).await {
                    return;
                }
                batch_bytes = 0;
                deadline = None;
            }
        }
    }
}

async fn flush(out: &mpsc::Sender<Vec<Envelope>>, batch: &mut Vec<Envelope>) -> bool {
    let ready = std::mem::take(batch);
    tracing::trace!(envelopes = ready.len(), "flushing batch");
    out.send(ready).await.is_ok()
}
