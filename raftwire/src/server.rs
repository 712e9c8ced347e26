//! Server transport: accept loop and per-connection exchange driving.
//!
//! Each accepted connection gets its own task. The task reads the opening
//! packet of a logical RPC, rents a handler from the shared exchange pool,
//! feeds it every packet of that message, drains its response packets, and
//! releases it — on every exit path, faulted exchanges included, via the
//! rental guard's drop. At most one exchange is ever bound to a connection,
//! so per-connection state needs no locking; only the pool is shared.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::buffer::BufferPool;
use crate::config::TransportConfig;
use crate::connection::Connection;
use crate::error::TransportError;
use crate::exchange::{Exchange, Flow};
use crate::member::LocalMember;
use crate::metrics::TransportMetrics;
use crate::net::{Listener, NetworkProvider};
use crate::pool::{ExchangePool, RentedExchange};
use crate::wire::{PacketFlags, PacketHeader, PacketKind, ACK_BUSY, ACK_FAULT};

/// Server side of the Raft exchange transport.
pub struct RaftServer {
    local_addr: String,
    shutdown: CancellationToken,
    pool: Arc<ExchangePool>,
    metrics: Arc<TransportMetrics>,
    accept_loop: Mutex<Option<JoinHandle<()>>>,
}

impl RaftServer {
    /// Bind on `address` and start accepting connections, serving requests
    /// against `member`.
    pub async fn bind<P: NetworkProvider>(
        provider: &P,
        address: &str,
        member: Arc<dyn LocalMember>,
        config: TransportConfig,
    ) -> Result<Self, TransportError> {
        config.validate()?;
        let listener = provider.bind(address).await?;
        let local_addr = listener.local_addr()?;

        let pool = ExchangePool::new(config.pool_capacity, member);
        let buffers = BufferPool::new(config.buffer_capacity);
        let shutdown = CancellationToken::new();
        let metrics = Arc::new(TransportMetrics::new());

        let handle = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&pool),
            buffers,
            shutdown.clone(),
            Arc::clone(&metrics),
        ));

        tracing::info!(address = %local_addr, "server transport started");
        Ok(Self {
            local_addr,
            shutdown,
            pool,
            metrics,
            accept_loop: Mutex::new(Some(handle)),
        })
    }

    /// The address this server is listening on.
    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    /// The shared exchange pool.
    pub fn exchange_pool(&self) -> &Arc<ExchangePool> {
        &self.pool
    }

    /// This server's operation counters.
    pub fn metrics(&self) -> &Arc<TransportMetrics> {
        &self.metrics
    }

    /// Stop accepting and wind down connection tasks.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = self
            .accept_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl Drop for RaftServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn accept_loop<L: Listener>(
    listener: L,
    pool: Arc<ExchangePool>,
    buffers: Arc<BufferPool>,
    shutdown: CancellationToken,
    metrics: Arc<TransportMetrics>,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = listener.accept() => result,
        };
        match accepted {
            Ok((stream, peer)) => {
                tracing::debug!(%peer, "connection accepted");
                let conn = Connection::new(stream, peer, &buffers);
                tokio::spawn(serve_connection(
                    conn,
                    Arc::clone(&pool),
                    shutdown.child_token(),
                    Arc::clone(&metrics),
                ));
            }
            Err(error) => {
                // Keep accepting; a single failed handshake is not fatal.
                tracing::warn!(%error, "accept failed");
            }
        }
    }
    tracing::debug!("accept loop exited");
}

async fn serve_connection<S>(
    mut conn: Connection<S>,
    pool: Arc<ExchangePool>,
    shutdown: CancellationToken,
    metrics: Arc<TransportMetrics>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    loop {
        let header = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = conn.read_packet() => match result {
                Ok(header) => header,
                Err(TransportError::Disconnected) => {
                    tracing::debug!(peer = %conn.peer(), "peer closed connection");
                    break;
                }
                Err(error) => {
                    tracing::warn!(peer = %conn.peer(), %error, "closing connection");
                    break;
                }
            },
        };
        metrics.record_packet_received();

        // Only a request kind with STREAM_START can open an exchange;
        // anything else has no in-flight exchange to match and is dropped.
        if !header.kind.is_request() || !header.is_stream_start() {
            tracing::warn!(
                peer = %conn.peer(),
                kind = ?header.kind,
                "dropping packet with no matching exchange"
            );
            metrics.record_protocol_violation();
            conn.consume(&header);
            continue;
        }

        let Some(mut exchange) = pool.try_rent(conn.peer()) else {
            tracing::warn!(peer = %conn.peer(), "exchange pool exhausted, rejecting request");
            metrics.record_pool_rejection();
            conn.consume(&header);
            if send_ack(&mut conn, ACK_BUSY, &metrics).await.is_err() {
                break;
            }
            continue;
        };

        match run_exchange(&mut conn, &mut exchange, header, &shutdown, &metrics).await {
            Ok(()) => metrics.record_exchange_completed(),
            Err(error) => {
                exchange.on_exception(error.clone());
                metrics.record_exchange_faulted();
                match error {
                    TransportError::Member(message) => {
                        // The facade failed; tell the client so it does not
                        // sit on its timeout, and keep the connection.
                        tracing::warn!(peer = %conn.peer(), %message, "member faulted exchange");
                        if send_ack(&mut conn, ACK_FAULT, &metrics).await.is_err() {
                            break;
                        }
                    }
                    error => {
                        tracing::warn!(peer = %conn.peer(), %error, "closing connection");
                        break;
                    }
                }
            }
        }
        // The rental guard releases (and resets) the handler here.
    }
    tracing::debug!(peer = %conn.peer(), "connection task exited");
}

async fn run_exchange<S>(
    conn: &mut Connection<S>,
    exchange: &mut RentedExchange,
    first: PacketHeader,
    shutdown: &CancellationToken,
    metrics: &TransportMetrics,
) -> Result<(), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    // Inbound phase: feed packets until the exchange is ready to respond.
    let mut pending = Some(first);
    loop {
        let header = match pending.take() {
            Some(header) => header,
            None => {
                let header = tokio::select! {
                    _ = shutdown.cancelled() => return Err(TransportError::Closed),
                    result = conn.read_packet() => result?,
                };
                metrics.record_packet_received();
                header
            }
        };
        let flow = exchange.process_inbound(header, conn.payload(&header)).await;
        conn.consume(&header);
        match flow {
            Ok(Flow::AwaitInbound) => continue,
            Ok(Flow::SendOutbound) => break,
            Ok(Flow::Complete) => return Ok(()),
            Err(TransportError::Protocol(message)) => {
                tracing::warn!(peer = %conn.peer(), %message, "dropping packet");
                metrics.record_protocol_violation();
                continue;
            }
            Err(error) => return Err(error),
        }
    }

    // Outbound phase: the response write always runs to completion, even if
    // the client's timeout already fired; the client discards it then.
    loop {
        let out = exchange.create_outbound(conn.tx_payload()).await?;
        conn.send_packet(out.header).await?;
        metrics.record_packet_sent();
        if out.last {
            return Ok(());
        }
    }
}

async fn send_ack<S>(
    conn: &mut Connection<S>,
    status: u8,
    metrics: &TransportMetrics,
) -> Result<(), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    conn.tx_payload()[0] = status;
    let header = PacketHeader::new(
        PacketKind::Ack,
        PacketFlags::STREAM_START | PacketFlags::STREAM_END,
        1,
    );
    conn.send_packet(header).await?;
    metrics.record_packet_sent();
    Ok(())
}
