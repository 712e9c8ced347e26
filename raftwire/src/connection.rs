//! Framed packet I/O over one byte stream.
//!
//! A connection owns two pooled, fixed-capacity buffers for the lifetime of
//! the socket session: one for reassembling inbound packets, one for staging
//! outbound ones. Reads are incremental and cancel-safe — a future dropped
//! between reads leaves the partially buffered packet in place for the next
//! call.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::buffer::{BufferPool, PooledBuffer};
use crate::error::TransportError;
use crate::wire::{PacketHeader, HEADER_SIZE};

pub(crate) struct Connection<S> {
    stream: S,
    peer: String,
    rx: PooledBuffer,
    rx_len: usize,
    tx: PooledBuffer,
    max_payload: usize,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub(crate) fn new(stream: S, peer: String, buffers: &Arc<BufferPool>) -> Self {
        let max_payload = buffers.buffer_capacity() - HEADER_SIZE;
        Self {
            stream,
            peer,
            rx: buffers.rent(),
            rx_len: 0,
            tx: buffers.rent(),
            max_payload,
        }
    }

    pub(crate) fn peer(&self) -> &str {
        &self.peer
    }

    /// The writable payload region of the outbound buffer.
    pub(crate) fn tx_payload(&mut self) -> &mut [u8] {
        &mut self.tx[HEADER_SIZE..]
    }

    /// Frame and write one packet whose payload is already staged in the
    /// outbound buffer. The write always runs to completion; cancellation is
    /// observed between packets, never inside one.
    pub(crate) async fn send_packet(&mut self, header: PacketHeader) -> Result<(), TransportError> {
        let total = HEADER_SIZE + header.length as usize;
        debug_assert!(total <= self.tx.len());
        header.encode_into(&mut self.tx[..HEADER_SIZE])?;
        self.stream.write_all(&self.tx[..total]).await?;
        self.stream.flush().await?;
        tracing::trace!(
            peer = %self.peer,
            kind = ?header.kind,
            len = header.length,
            "packet sent"
        );
        Ok(())
    }

    /// Read the next packet header, buffering its full payload.
    ///
    /// Call [`Connection::payload`] to borrow the payload and
    /// [`Connection::consume`] to discard the packet once processed.
    pub(crate) async fn read_packet(&mut self) -> Result<PacketHeader, TransportError> {
        while self.rx_len < HEADER_SIZE {
            self.fill_some().await?;
        }
        let header = PacketHeader::decode(&self.rx[..HEADER_SIZE], self.max_payload)?;
        let needed = HEADER_SIZE + header.length as usize;
        while self.rx_len < needed {
            self.fill_some().await?;
        }
        tracing::trace!(
            peer = %self.peer,
            kind = ?header.kind,
            len = header.length,
            "packet received"
        );
        Ok(header)
    }

    /// The payload bytes of the packet returned by the last
    /// [`Connection::read_packet`].
    pub(crate) fn payload(&self, header: &PacketHeader) -> &[u8] {
        &self.rx[HEADER_SIZE..HEADER_SIZE + header.length as usize]
    }

    /// Discard the current packet, compacting any following bytes.
    pub(crate) fn consume(&mut self, header: &PacketHeader) {
        let total = HEADER_SIZE + header.length as usize;
        self.rx.copy_within(total..self.rx_len, 0);
        self.rx_len -= total;
    }

    async fn fill_some(&mut self) -> Result<(), TransportError> {
        let read = self.stream.read(&mut self.rx[self.rx_len..]).await?;
        if read == 0 {
            return Err(TransportError::Disconnected);
        }
        self.rx_len += read;
        Ok(())
    }
}
