//! TCP IPC server: accept loop and per-connection handler.
//!
//! A worker connects, sends `HELLO {processId}` and is bound to that process's
//! mailbox. Inbound envelopes go through `Router::dispatch`; the mailbox is
//! drained through a `Batcher` into `ENVELOPE`/`BATCH` frames. A live process
//! whose connection drops is reported to the supervisor as crashed.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::envelope::{Envelope, MessageKind};
use crate::ipc::codec::{self, write_frame, Frame, WireError};
use crate::kernel::supervisor::Supervisor;
use crate::router::{Batcher, Router};
use crate::types::{Error, ProcessId, Result, ServerConfig};

/// Control frames queued for the writer task.
const CONTROL_CHANNEL_DEPTH: usize = 16;

/// IPC server for worker processes.
#[derive(Debug)]
pub struct IpcServer {
    router: Router,
    supervisor: Arc<Supervisor>,
    config: ServerConfig,
    cancel: CancellationToken,
}

/// Why a connection ended.
#[derive(Debug, PartialEq, Eq)]
enum Disconnect {
    /// Server or host shutdown.
    Shutdown,
    /// The router closed the mailbox; the process is already gone.
    MailboxClosed,
    /// The worker went away or broke the protocol.
    Lost(String),
}

impl IpcServer {
    /// The server stops when the host shuts down or on [`shutdown`](Self::shutdown).
    pub fn new(router: Router, supervisor: Arc<Supervisor>, config: ServerConfig) -> Self {
        let cancel = supervisor.shutdown_token().child_token();
        Self {
            router,
            supervisor,
            config,
            cancel,
        }
    }

    /// Bind `listen_addr` and serve until cancelled.
    pub async fn serve(&self) -> Result<()> {
        let listener = self.bind().await?;
        self.serve_on(listener).await
    }

    /// Bind the configured listen address. Workers may connect before
    /// `serve_on` starts accepting.
    pub async fn bind(&self) -> Result<TcpListener> {
        let addr: SocketAddr = self
            .config
            .listen_addr
            .parse()
            .map_err(|e| Error::config(format!("invalid listen_addr {}: {}", self.config.listen_addr, e)))?;
        Ok(TcpListener::bind(addr).await?)
    }

    /// Serve on an already bound listener until cancelled.
    pub async fn serve_on(&self, listener: TcpListener) -> Result<()> {
        let conn_semaphore = Arc::new(Semaphore::new(self.config.max_connections));
        tracing::info!(
            addr = ?listener.local_addr().ok(),
            max_connections = self.config.max_connections,
            "ipc_server_listening"
        );

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("ipc_server_shutting_down");
                    break;
                }
                accept = listener.accept() => {
                    let (stream, peer) = accept?;

                    // Backpressure when at capacity.
                    let permit = match conn_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            tracing::warn!(
                                peer = %peer,
                                max_connections = self.config.max_connections,
                                "connection rejected: at max_connections"
                            );
                            drop(stream);
                            continue;
                        }
                    };

                    tracing::debug!(
                        peer = %peer,
                        active = self.config.max_connections - conn_semaphore.available_permits(),
                        "ipc connection accepted"
                    );
                    let connection = Connection {
                        router: self.router.clone(),
                        supervisor: Arc::clone(&self.supervisor),
                        config: self.config.clone(),
                        cancel: self.cancel.clone(),
                    };
                    tokio::spawn(async move {
                        connection.run(stream, peer, permit).await;
                    });
                }
            }
        }
        Ok(())
    }

    /// Request graceful shutdown.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

struct Connection {
    router: Router,
    supervisor: Arc<Supervisor>,
    config: ServerConfig,
    cancel: CancellationToken,
}

impl Connection {
    async fn run(self, stream: TcpStream, peer: SocketAddr, _permit: OwnedSemaphorePermit) {
        let (mut reader, mut writer) = stream.into_split();

        let (pid, mailbox) = match self.handshake(&mut reader, &mut writer).await {
            Ok(bound) => bound,
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "ipc handshake failed");
                let _ = timed_write(&mut writer, &Frame::Error(WireError::from(&e)), self.config.write_timeout).await;
                let _ = writer.shutdown().await;
                return;
            }
        };
        tracing::info!(peer = %peer, pid = %pid, "worker_attached");

        match self.serve_worker(pid, mailbox, reader, writer).await {
            Disconnect::Lost(reason) if self.router.is_live(pid) => {
                tracing::warn!(pid = %pid, reason = %reason, "worker_connection_lost");
                if let Err(e) = self.supervisor.handle_crash(pid, &reason).await {
                    tracing::error!(pid = %pid, error = %e, "crash_handling_failed");
                }
            }
            other => tracing::info!(pid = %pid, reason = ?other, "worker_detached"),
        }
    }

    /// Wait for `HELLO`, take the process mailbox and echo the hello back.
    async fn handshake(
        &self,
        reader: &mut OwnedReadHalf,
        writer: &mut OwnedWriteHalf,
    ) -> Result<(ProcessId, mpsc::UnboundedReceiver<Envelope>)> {
        let first = tokio::time::timeout(
            self.config.hello_timeout,
            codec::read(reader, self.config.max_frame_bytes),
        )
        .await
        .map_err(|_| Error::timeout("no HELLO within hello_timeout"))??;

        let hello = match first {
            Some(Frame::Hello(hello)) => hello,
            Some(other) => {
                return Err(Error::malformed(format!(
                    "expected HELLO, got frame type 0x{:02X}",
                    other.frame_type()
                )))
            }
            None => return Err(Error::cancelled("connection closed before HELLO")),
        };
        let pid = hello.process_id;
        if pid.is_host() || !self.router.is_live(pid) {
            return Err(Error::UnknownRecipient(format!("process {} is not live", pid)));
        }

        let mailbox = self.router.take_mailbox(pid)?;
        timed_write(writer, &Frame::Hello(hello), self.config.write_timeout).await?;
        Ok((pid, mailbox))
    }

    async fn serve_worker(
        &self,
        pid: ProcessId,
        mailbox: mpsc::UnboundedReceiver<Envelope>,
        mut reader: OwnedReadHalf,
        writer: OwnedWriteHalf,
    ) -> Disconnect {
        let (control_tx, control_rx) = mpsc::channel(CONTROL_CHANNEL_DEPTH);
        let batches = Batcher::spawn(mailbox, self.router.config().batch.clone());
        let mut write_task = tokio::spawn(write_loop(
            writer,
            batches,
            control_rx,
            self.config.write_timeout,
        ));

        let reason = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break Disconnect::Shutdown,
                written = &mut write_task => {
                    break written.unwrap_or_else(|e| Disconnect::Lost(format!("writer task failed: {}", e)));
                }
                frame = codec::read(&mut reader, self.config.max_frame_bytes) => match frame {
                    Ok(Some(Frame::Envelope(envelope))) => self.inbound(pid, *envelope, &control_tx).await,
                    Ok(Some(Frame::Batch(envelopes))) => {
                        for envelope in envelopes {
                            self.inbound(pid, envelope, &control_tx).await;
                        }
                    }
                    Ok(Some(other)) => {
                        let e = Error::malformed(format!(
                            "unexpected frame type 0x{:02X} after HELLO",
                            other.frame_type()
                        ));
                        let _ = control_tx.send(Frame::Error(WireError::from(&e))).await;
                    }
                    Ok(None) => break Disconnect::Lost("connection closed".to_string()),
                    // The frame was consumed whole; the stream is still in sync.
                    Err(e @ (Error::Serialization(_) | Error::MalformedMessage(_))) => {
                        tracing::debug!(pid = %pid, error = %e, "undecodable frame");
                        let _ = control_tx.send(Frame::Error(WireError::from(&e))).await;
                    }
                    Err(e) => break Disconnect::Lost(e.to_string()),
                },
            }
        };
        write_task.abort();
        reason
    }

    /// Route one envelope from the worker. Rejected requests are answered with
    /// an `Error` reply by the router; other rejections get an `ERROR` frame.
    async fn inbound(&self, pid: ProcessId, envelope: Envelope, control: &mpsc::Sender<Frame>) {
        if envelope.sender_id != pid {
            let e = Error::Unauthorized(format!(
                "connection of process {} cannot send as {}",
                pid, envelope.sender_id
            ));
            let _ = control.send(Frame::Error(WireError::from(&e))).await;
            return;
        }

        let answered = envelope.kind == MessageKind::Request && envelope.request_id.is_some();
        if let Err(e) = self.router.dispatch(envelope) {
            if !answered {
                let _ = control.send(Frame::Error(WireError::from(&e))).await;
            }
        }
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut batches: mpsc::Receiver<Vec<Envelope>>,
    mut control: mpsc::Receiver<Frame>,
    write_timeout: Duration,
) -> Disconnect {
    loop {
        let frame = tokio::select! {
            biased;
            Some(frame) = control.recv() => frame,
            batch = batches.recv() => match batch {
                Some(batch) => outbound(batch),
                None => return Disconnect::MailboxClosed,
            },
        };
        if let Err(e) = timed_write(&mut writer, &frame, write_timeout).await {
            return Disconnect::Lost(format!("write failed: {}", e));
        }
    }
}

fn outbound(mut batch: Vec<Envelope>) -> Frame {
    if batch.len() == 1 {
        if let Some(envelope) = batch.pop() {
            return Frame::Envelope(Box::new(envelope));
        }
    }
    Frame::Batch(batch)
}

/// Write a frame with a timeout. Slow consumers are dropped instead of
/// holding the connection indefinitely.
async fn timed_write<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    frame: &Frame,
    timeout: Duration,
) -> Result<()> {
    let payload = frame.encode_payload()?;
    tokio::time::timeout(timeout, write_frame(writer, frame.frame_type(), &payload))
        .await
        .map_err(|_| {
            tracing::warn!(timeout_ms = timeout.as_millis() as u64, "write timeout, dropping connection");
            Error::timeout("write timeout")
        })??;
    Ok(())
}
