//! Queue-driven client transport.
//!
//! A [`RaftClient`] owns one connection and a dedicated send loop. Callers
//! enqueue exchanges (directly or through the typed helpers); the loop
//! drives them strictly one at a time, which is what makes response
//! correlation trivial: the only packets arriving are for the single
//! in-flight exchange. Concurrency across a cluster comes from opening one
//! client per peer, not from multiplexing a connection.
//!
//! Cancellation is observed between packets, never inside a write, so a
//! canceled exchange cannot corrupt the framing of the next one. When a
//! cancellation strikes while a response is pending, the loop remembers to
//! drain the late response (the server always finishes writing it) before
//! the next exchange starts.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::buffer::BufferPool;
use crate::config::TransportConfig;
use crate::connection::Connection;
use crate::entry::Entry;
use crate::error::TransportError;
use crate::exchange::{
    AppendEntriesExchange, Exchange, Flow, HeartbeatExchange, MetadataExchange, ResignExchange,
    SnapshotExchange, VoteExchange,
};
use crate::member::MemberResponse;
use crate::metrics::TransportMetrics;
use crate::net::NetworkProvider;

struct QueuedExchange {
    exchange: Box<dyn Exchange>,
    cancel: CancellationToken,
}

enum DriveOutcome {
    Completed,
    Faulted {
        error: TransportError,
        connection_dead: bool,
        drain: bool,
    },
}

/// Client side of the Raft exchange transport.
pub struct RaftClient {
    queue_tx: mpsc::UnboundedSender<QueuedExchange>,
    shutdown: CancellationToken,
    metrics: Arc<TransportMetrics>,
    send_loop: Mutex<Option<JoinHandle<()>>>,
}

impl RaftClient {
    /// Connect to `destination` and start the send loop.
    ///
    /// The returned client must be [`RaftClient::close`]d to release the
    /// connection and fault any queued work.
    pub async fn connect<P: NetworkProvider>(
        provider: &P,
        destination: &str,
        config: TransportConfig,
    ) -> Result<Self, TransportError> {
        config.validate()?;
        let stream = provider.connect(destination).await?;
        let buffers = BufferPool::new(config.buffer_capacity);
        let conn = Connection::new(stream, destination.to_string(), &buffers);

        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let metrics = Arc::new(TransportMetrics::new());

        let handle = tokio::spawn(send_loop(
            conn,
            queue_rx,
            shutdown.clone(),
            Arc::clone(&metrics),
        ));

        tracing::debug!(%destination, "client transport started");
        Ok(Self {
            queue_tx,
            shutdown,
            metrics,
            send_loop: Mutex::new(Some(handle)),
        })
    }

    /// Queue an exchange for the send loop.
    ///
    /// Never blocks beyond placing the exchange in the queue; `cancel`
    /// faults the exchange if it fires before completion, without tearing
    /// the connection down.
    pub fn enqueue(
        &self,
        exchange: Box<dyn Exchange>,
        cancel: CancellationToken,
    ) -> Result<(), TransportError> {
        self.queue_tx
            .send(QueuedExchange { exchange, cancel })
            .map_err(|_| TransportError::Closed)
    }

    /// Request a leader election vote.
    pub async fn vote(
        &self,
        term: i64,
        last_log_index: i64,
        last_log_term: i64,
        cancel: &CancellationToken,
    ) -> Result<MemberResponse, TransportError> {
        let (exchange, rx) = VoteExchange::new(term, last_log_index, last_log_term);
        self.enqueue(Box::new(exchange), cancel.clone())?;
        await_completion(rx).await
    }

    /// Probe the remote member's liveness.
    pub async fn heartbeat(
        &self,
        term: i64,
        prev_log_index: i64,
        prev_log_term: i64,
        commit_index: i64,
        cancel: &CancellationToken,
    ) -> Result<MemberResponse, TransportError> {
        let (exchange, rx) =
            HeartbeatExchange::new(term, prev_log_index, prev_log_term, commit_index);
        self.enqueue(Box::new(exchange), cancel.clone())?;
        await_completion(rx).await
    }

    /// Replicate log entries.
    pub async fn append_entries(
        &self,
        term: i64,
        entries: Vec<Entry>,
        prev_log_index: i64,
        prev_log_term: i64,
        commit_index: i64,
        cancel: &CancellationToken,
    ) -> Result<MemberResponse, TransportError> {
        let (exchange, rx) =
            AppendEntriesExchange::new(term, entries, prev_log_index, prev_log_term, commit_index);
        self.enqueue(Box::new(exchange), cancel.clone())?;
        await_completion(rx).await
    }

    /// Install a snapshot on the remote member.
    pub async fn install_snapshot(
        &self,
        term: i64,
        snapshot: Entry,
        snapshot_index: i64,
        cancel: &CancellationToken,
    ) -> Result<MemberResponse, TransportError> {
        let (exchange, rx) = SnapshotExchange::new(term, snapshot, snapshot_index);
        self.enqueue(Box::new(exchange), cancel.clone())?;
        await_completion(rx).await
    }

    /// Fetch the remote member's metadata map.
    pub async fn metadata(
        &self,
        cancel: &CancellationToken,
    ) -> Result<HashMap<String, String>, TransportError> {
        let (exchange, rx) = MetadataExchange::new();
        self.enqueue(Box::new(exchange), cancel.clone())?;
        await_completion(rx).await
    }

    /// Ask the remote member to resign leadership.
    pub async fn resign(&self, cancel: &CancellationToken) -> Result<bool, TransportError> {
        let (exchange, rx) = ResignExchange::new();
        self.enqueue(Box::new(exchange), cancel.clone())?;
        await_completion(rx).await
    }

    /// This client's operation counters.
    pub fn metrics(&self) -> &Arc<TransportMetrics> {
        &self.metrics
    }

    /// Stop the send loop, fault queued exchanges, and release the
    /// connection and its pooled buffers.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let handle = self
            .send_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl Drop for RaftClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn await_completion<T>(
    rx: tokio::sync::oneshot::Receiver<Result<T, TransportError>>,
) -> Result<T, TransportError> {
    match rx.await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Disconnected),
    }
}

/// Run `op` against a deadline. The operation receives a cancellation token
/// that fires when the deadline passes, so the transport faults the
/// in-flight exchange while the caller observes [`TransportError::Timeout`].
pub async fn with_deadline<T, F, Fut>(duration: Duration, op: F) -> Result<T, TransportError>
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
{
    let token = CancellationToken::new();
    tokio::select! {
        result = op(token.clone()) => result,
        _ = tokio::time::sleep(duration) => {
            token.cancel();
            Err(TransportError::Timeout)
        }
    }
}

async fn send_loop<S>(
    mut conn: Connection<S>,
    mut queue: mpsc::UnboundedReceiver<QueuedExchange>,
    shutdown: CancellationToken,
    metrics: Arc<TransportMetrics>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut drain_pending = false;
    loop {
        let QueuedExchange {
            mut exchange,
            cancel,
        } = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = queue.recv() => match next {
                Some(item) => item,
                None => break,
            },
        };

        if cancel.is_cancelled() {
            exchange.on_exception(TransportError::Cancelled);
            metrics.record_exchange_faulted();
            continue;
        }

        if drain_pending {
            let drained = tokio::select! {
                _ = cancel.cancelled() => {
                    // Still undrained; the next exchange inherits the chore.
                    exchange.on_exception(TransportError::Cancelled);
                    metrics.record_exchange_faulted();
                    continue;
                }
                result = drain_stale_response(&mut conn, &metrics) => result,
            };
            if let Err(error) = drained {
                exchange.on_exception(error);
                metrics.record_exchange_faulted();
                break;
            }
            drain_pending = false;
        }

        match drive_exchange(&mut conn, exchange.as_mut(), &cancel, &metrics).await {
            DriveOutcome::Completed => metrics.record_exchange_completed(),
            DriveOutcome::Faulted {
                error,
                connection_dead,
                drain,
            } => {
                tracing::debug!(peer = %conn.peer(), %error, "exchange faulted");
                exchange.on_exception(error);
                metrics.record_exchange_faulted();
                drain_pending = drain;
                if connection_dead {
                    break;
                }
            }
        }
    }

    queue.close();
    while let Ok(mut stale) = queue.try_recv() {
        stale.exchange.on_exception(TransportError::Closed);
        metrics.record_exchange_faulted();
    }
    tracing::debug!(peer = %conn.peer(), "client send loop exited");
}

async fn drive_exchange<S>(
    conn: &mut Connection<S>,
    exchange: &mut dyn Exchange,
    cancel: &CancellationToken,
    metrics: &TransportMetrics,
) -> DriveOutcome
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    // Request phase: writes run to completion, cancellation is checked at
    // packet boundaries. Giving up with part of a message on the wire would
    // desynchronize the server, so that case counts as connection loss.
    let mut wrote_any = false;
    loop {
        if cancel.is_cancelled() {
            return DriveOutcome::Faulted {
                error: TransportError::Cancelled,
                connection_dead: wrote_any,
                drain: false,
            };
        }
        let out = match exchange.create_outbound(conn.tx_payload()).await {
            Ok(out) => out,
            Err(error) => {
                return DriveOutcome::Faulted {
                    error,
                    connection_dead: wrote_any,
                    drain: false,
                }
            }
        };
        if let Err(error) = conn.send_packet(out.header).await {
            return DriveOutcome::Faulted {
                error,
                connection_dead: true,
                drain: false,
            };
        }
        metrics.record_packet_sent();
        wrote_any = true;
        if out.last {
            break;
        }
    }

    // Response phase.
    loop {
        let header = tokio::select! {
            _ = cancel.cancelled() => {
                return DriveOutcome::Faulted {
                    error: TransportError::Cancelled,
                    connection_dead: false,
                    drain: true,
                };
            }
            result = conn.read_packet() => match result {
                Ok(header) => header,
                Err(error) => {
                    return DriveOutcome::Faulted {
                        error,
                        connection_dead: true,
                        drain: false,
                    }
                }
            },
        };
        metrics.record_packet_received();
        let flow = exchange.process_inbound(header, conn.payload(&header)).await;
        conn.consume(&header);
        match flow {
            Ok(Flow::AwaitInbound) => continue,
            Ok(Flow::Complete) => return DriveOutcome::Completed,
            Ok(Flow::SendOutbound) => {
                return DriveOutcome::Faulted {
                    error: TransportError::InvalidState(
                        "client exchange requested outbound during response".to_string(),
                    ),
                    connection_dead: false,
                    drain: true,
                }
            }
            Err(TransportError::Protocol(message)) => {
                tracing::warn!(peer = %conn.peer(), %message, "dropping packet");
                metrics.record_protocol_violation();
                continue;
            }
            Err(error) => {
                let connection_dead = error.is_connection_fatal();
                return DriveOutcome::Faulted {
                    error,
                    connection_dead,
                    drain: false,
                };
            }
        }
    }
}

/// Discard the late response of a canceled exchange, up to its closing
/// STREAM_END packet, leaving the connection aligned for the next exchange.
async fn drain_stale_response<S>(
    conn: &mut Connection<S>,
    metrics: &TransportMetrics,
) -> Result<(), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    loop {
        let header = conn.read_packet().await?;
        metrics.record_packet_received();
        tracing::debug!(
            peer = %conn.peer(),
            kind = ?header.kind,
            "discarding response packet for canceled exchange"
        );
        let end = header.is_stream_end();
        conn.consume(&header);
        if end {
            return Ok(());
        }
    }
}
