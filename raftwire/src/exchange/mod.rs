//! Exchange state machines: one instance per logical RPC.
//!
//! An exchange produces its request (or response) as a sequence of packets
//! and consumes the packets the remote side sends back. The trait is the
//! same on both sides of the wire; the transport loops own all I/O and feed
//! packets in arrival order, which the connection guarantees matches send
//! order.
//!
//! Client-side exchanges ([`VoteExchange`], [`HeartbeatExchange`],
//! [`AppendEntriesExchange`], [`SnapshotExchange`], [`MetadataExchange`],
//! [`ResignExchange`]) complete a oneshot channel observed by the caller.
//! The server side uses one pooled [`ServerExchange`] dispatching on the
//! kind tag of the opening packet.

/// Log replication exchange.
pub mod append;
/// Liveness probe exchange.
pub mod heartbeat;
/// Metadata map exchange.
pub mod metadata;
/// Leadership resignation exchange.
pub mod resign;
/// Pooled server-side exchange handler.
pub mod server;
/// Snapshot transfer exchange.
pub mod snapshot;
/// Leader election vote exchange.
pub mod vote;

pub use append::AppendEntriesExchange;
pub use heartbeat::HeartbeatExchange;
pub use metadata::MetadataExchange;
pub use resign::ResignExchange;
pub use server::ServerExchange;
pub use snapshot::SnapshotExchange;
pub use vote::VoteExchange;

use std::collections::VecDeque;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::sync::oneshot;

use crate::entry::{Entry, EntryContent, ReceivedEntry};
use crate::error::TransportError;
use crate::member::MemberResponse;
use crate::wire::PacketHeader;

/// Lifecycle state of an exchange.
///
/// `AwaitingResponse` doubles as "awaiting further packets from the remote
/// side": the client sits there after its request is on the wire, the server
/// while a multi-packet request is still arriving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    /// Freshly created or reset; no packets exchanged yet.
    Created,
    /// Producing outbound request packets.
    Sending,
    /// Waiting for packets from the remote side.
    AwaitingResponse,
    /// Producing outbound response packets.
    Completing,
    /// Terminal: result available.
    Completed,
    /// Terminal: exception captured.
    Faulted,
}

/// What the transport should do after feeding a packet to an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// More inbound packets are required.
    AwaitInbound,
    /// The exchange is ready to emit outbound packets.
    SendOutbound,
    /// The logical RPC is complete.
    Complete,
}

/// Description of a packet produced by [`Exchange::create_outbound`].
///
/// The payload has already been written into the transport's buffer; the
/// header describes it and `last` tells the transport to stop draining.
#[derive(Debug, Clone, Copy)]
pub struct OutboundPacket {
    /// Header for the produced packet; `header.length` bytes of payload were
    /// written into the caller's buffer.
    pub header: PacketHeader,
    /// Whether this is the final outbound packet of the exchange.
    pub last: bool,
}

/// One logical RPC in flight.
///
/// The transport calls `create_outbound` repeatedly until a packet is marked
/// `last`, then feeds inbound packets through `process_inbound` until the
/// returned [`Flow`] says otherwise. `reset` is the only legal transition
/// out of a terminal state and must leave the exchange indistinguishable
/// from freshly created.
#[async_trait]
pub trait Exchange: Send {
    /// Consume one inbound packet. `payload` is the `header.length` bytes
    /// that followed the header on the wire.
    ///
    /// A [`TransportError::Protocol`] return means the packet was rejected
    /// without advancing the state machine; the transport logs and drops it.
    async fn process_inbound(
        &mut self,
        header: PacketHeader,
        payload: &[u8],
    ) -> Result<Flow, TransportError>;

    /// Produce the next outbound packet's payload into `buf` and describe it.
    async fn create_outbound(&mut self, buf: &mut [u8]) -> Result<OutboundPacket, TransportError>;

    /// Record a failure. Terminal: the exchange moves to
    /// [`ExchangeState::Faulted`] and any awaiting caller observes the error.
    fn on_exception(&mut self, error: TransportError);

    /// Return to [`ExchangeState::Created`] with no residual cursor state.
    fn reset(&mut self);

    /// Current lifecycle state.
    fn state(&self) -> ExchangeState;
}

// =============================================================================
// Payload layouts
// =============================================================================

/// Vote request: term + last log index + last log term.
pub(crate) const VOTE_REQUEST_LEN: usize = 24;
/// Heartbeat request: term + prev log index + prev log term + commit index.
pub(crate) const HEARTBEAT_REQUEST_LEN: usize = 32;
/// AppendEntries header: term + prev index + prev term + commit + count.
pub(crate) const APPEND_HEADER_LEN: usize = 36;
/// InstallSnapshot header: term + snapshot index.
pub(crate) const SNAPSHOT_HEADER_LEN: usize = 16;
/// Result response: term + boolean.
pub(crate) const RESULT_RESPONSE_LEN: usize = 9;
/// Entry unit prefix: term + timestamp + flags + declared length.
pub(crate) const ENTRY_META_LEN: usize = 25;

/// Sequential big-endian writer over a packet payload buffer.
///
/// Fixed layouts are bounded by [`crate::wire::MIN_PAYLOAD_CAPACITY`], which
/// configuration enforces, so writes cannot overrun.
pub(crate) struct PayloadWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> PayloadWriter<'a> {
    pub(crate) fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn put_i64(&mut self, value: i64) {
        debug_assert!(self.pos + 8 <= self.buf.len());
        self.buf[self.pos..self.pos + 8].copy_from_slice(&value.to_be_bytes());
        self.pos += 8;
    }

    pub(crate) fn put_u32(&mut self, value: u32) {
        debug_assert!(self.pos + 4 <= self.buf.len());
        self.buf[self.pos..self.pos + 4].copy_from_slice(&value.to_be_bytes());
        self.pos += 4;
    }

    pub(crate) fn put_u8(&mut self, value: u8) {
        debug_assert!(self.pos < self.buf.len());
        self.buf[self.pos] = value;
        self.pos += 1;
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }
}

/// Sequential big-endian reader over a packet payload.
pub(crate) struct PayloadReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], TransportError> {
        if self.pos + n > self.buf.len() {
            return Err(TransportError::Protocol(format!(
                "truncated payload: need {} bytes at offset {}, have {}",
                n,
                self.pos,
                self.buf.len()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub(crate) fn get_i64(&mut self) -> Result<i64, TransportError> {
        let bytes = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(i64::from_be_bytes(raw))
    }

    pub(crate) fn get_u32(&mut self) -> Result<u32, TransportError> {
        let bytes = self.take(4)?;
        let mut raw = [0u8; 4];
        raw.copy_from_slice(bytes);
        Ok(u32::from_be_bytes(raw))
    }

    pub(crate) fn get_u8(&mut self) -> Result<u8, TransportError> {
        Ok(self.take(1)?[0])
    }

    /// Everything after the cursor.
    pub(crate) fn rest(self) -> &'a [u8] {
        &self.buf[self.pos..]
    }
}

/// Translate an `Ack` control packet into the error it signals.
pub(crate) fn ack_error(payload: &[u8]) -> TransportError {
    match payload.first() {
        Some(&crate::wire::ACK_BUSY) => TransportError::Busy,
        Some(&crate::wire::ACK_FAULT) => TransportError::RemoteFault,
        _ => TransportError::Protocol("ack packet with unknown status".to_string()),
    }
}

pub(crate) fn encode_result_response(buf: &mut [u8], response: MemberResponse) -> usize {
    let mut writer = PayloadWriter::new(buf);
    writer.put_i64(response.term);
    writer.put_u8(u8::from(response.value));
    writer.position()
}

pub(crate) fn decode_result_response(payload: &[u8]) -> Result<MemberResponse, TransportError> {
    let mut reader = PayloadReader::new(payload);
    let term = reader.get_i64()?;
    let value = reader.get_u8()? != 0;
    Ok(MemberResponse::new(term, value))
}

// =============================================================================
// Entry streaming
// =============================================================================

/// Replication metadata carried at the start of an entry unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EntryMeta {
    pub(crate) term: i64,
    pub(crate) timestamp: i64,
    pub(crate) is_snapshot: bool,
    /// Declared content length; -1 when the sender streams to end-of-file.
    pub(crate) length: i64,
}

pub(crate) fn decode_entry_meta(reader: &mut PayloadReader<'_>) -> Result<EntryMeta, TransportError> {
    let term = reader.get_i64()?;
    let timestamp = reader.get_i64()?;
    let flags = reader.get_u8()?;
    let length = reader.get_i64()?;
    Ok(EntryMeta {
        term,
        timestamp,
        is_snapshot: flags & 0b1 != 0,
        length,
    })
}

struct EntryInFlight {
    entry: Entry,
    sent: u64,
    started: bool,
}

/// Description of one produced entry chunk.
#[derive(Debug, Clone, Copy)]
pub(crate) struct EntryChunk {
    /// Bytes written into the payload buffer.
    pub(crate) len: usize,
    /// Whether this chunk opens the entry's packet sequence.
    pub(crate) start: bool,
    /// Whether this chunk closes the entry's packet sequence.
    pub(crate) end: bool,
}

/// Cursor that chunks a sequence of outbound entries into packet payloads.
///
/// Each entry becomes its own STREAM_START..STREAM_END unit: the first chunk
/// carries the entry metadata followed by content, continuation chunks carry
/// raw content. A streaming entry of unknown length may close with an empty
/// STREAM_END chunk when its source ends exactly on a chunk boundary.
pub(crate) struct EntrySender {
    queue: VecDeque<Entry>,
    current: Option<EntryInFlight>,
}

impl EntrySender {
    pub(crate) fn new(entries: Vec<Entry>) -> Self {
        Self {
            queue: entries.into(),
            current: None,
        }
    }

    /// Whether every entry has been fully chunked out.
    pub(crate) fn is_finished(&self) -> bool {
        self.current.is_none() && self.queue.is_empty()
    }

    /// Produce the next chunk into `buf`, or `None` when finished.
    pub(crate) async fn next_chunk(
        &mut self,
        buf: &mut [u8],
    ) -> Result<Option<EntryChunk>, TransportError> {
        let mut inflight = match self.current.take() {
            Some(inflight) => inflight,
            None => match self.queue.pop_front() {
                Some(entry) => EntryInFlight {
                    entry,
                    sent: 0,
                    started: false,
                },
                None => return Ok(None),
            },
        };

        let start = !inflight.started;
        let mut pos = 0;
        if start {
            let declared = match inflight.entry.length() {
                Some(len) => len as i64,
                None => -1,
            };
            let mut writer = PayloadWriter::new(buf);
            writer.put_i64(inflight.entry.term);
            writer.put_i64(inflight.entry.timestamp);
            writer.put_u8(u8::from(inflight.entry.is_snapshot));
            writer.put_i64(declared);
            pos = writer.position();
            inflight.started = true;
        }

        let (filled, end) = match &mut inflight.entry.content {
            EntryContent::Bytes(bytes) => {
                let offset = inflight.sent as usize;
                let n = (bytes.len() - offset).min(buf.len() - pos);
                buf[pos..pos + n].copy_from_slice(&bytes[offset..offset + n]);
                inflight.sent += n as u64;
                (n, inflight.sent == bytes.len() as u64)
            }
            EntryContent::Stream { len, reader } => {
                let target = match len {
                    Some(total) => (*total - inflight.sent).min((buf.len() - pos) as u64) as usize,
                    None => buf.len() - pos,
                };
                let mut n = 0;
                let mut eof = false;
                while n < target {
                    let read = reader.read(&mut buf[pos + n..pos + target]).await?;
                    if read == 0 {
                        eof = true;
                        break;
                    }
                    n += read;
                }
                inflight.sent += n as u64;
                match len {
                    Some(total) => {
                        if eof && inflight.sent < *total {
                            return Err(TransportError::InvalidState(format!(
                                "entry content ended at {} of declared {} bytes",
                                inflight.sent, total
                            )));
                        }
                        (n, inflight.sent == *total)
                    }
                    None => (n, eof),
                }
            }
        };

        if !end {
            self.current = Some(inflight);
        }
        Ok(Some(EntryChunk {
            len: pos + filled,
            start,
            end,
        }))
    }
}

struct PartialEntry {
    meta: EntryMeta,
    content: Vec<u8>,
}

/// Reassembles inbound entry units back into [`ReceivedEntry`] values.
pub(crate) struct EntryReceiver {
    expected: u32,
    pending: Option<PartialEntry>,
    done: Vec<ReceivedEntry>,
}

impl EntryReceiver {
    pub(crate) fn new(expected: u32) -> Self {
        Self {
            expected,
            pending: None,
            done: Vec::new(),
        }
    }

    /// Feed one entry packet. Returns `true` once all expected entries have
    /// been reconstructed.
    pub(crate) fn accept(
        &mut self,
        header: &PacketHeader,
        payload: &[u8],
    ) -> Result<bool, TransportError> {
        match &mut self.pending {
            None => {
                if !header.is_stream_start() {
                    return Err(TransportError::Protocol(
                        "entry continuation without a stream start".to_string(),
                    ));
                }
                let mut reader = PayloadReader::new(payload);
                let meta = decode_entry_meta(&mut reader)?;
                let content = reader.rest().to_vec();
                if header.is_stream_end() {
                    self.finish(meta, content);
                } else {
                    self.pending = Some(PartialEntry { meta, content });
                }
            }
            Some(partial) => {
                if header.is_stream_start() {
                    return Err(TransportError::Protocol(
                        "stream start inside an unfinished entry".to_string(),
                    ));
                }
                partial.content.extend_from_slice(payload);
                if header.is_stream_end() {
                    if let Some(partial) = self.pending.take() {
                        self.finish(partial.meta, partial.content);
                    }
                }
            }
        }
        Ok(self.pending.is_none() && self.done.len() as u32 == self.expected)
    }

    fn finish(&mut self, meta: EntryMeta, content: Vec<u8>) {
        if meta.length >= 0 && meta.length as usize != content.len() {
            tracing::debug!(
                declared = meta.length,
                actual = content.len(),
                "entry content length differs from declared length"
            );
        }
        self.done.push(ReceivedEntry {
            term: meta.term,
            timestamp: meta.timestamp,
            is_snapshot: meta.is_snapshot,
            content,
        });
    }

    pub(crate) fn into_entries(self) -> Vec<ReceivedEntry> {
        self.done
    }
}

// =============================================================================
// Completion channel
// =============================================================================

/// Single-shot completion signal observed by the exchange's caller.
pub(crate) struct Completion<T> {
    tx: Option<oneshot::Sender<Result<T, TransportError>>>,
}

impl<T> Completion<T> {
    /// Create a completion and the receiver the caller awaits.
    pub(crate) fn channel() -> (Self, oneshot::Receiver<Result<T, TransportError>>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Deliver the result. Later calls are ignored, so a fault arriving
    /// after completion cannot clobber the observed value.
    pub(crate) fn complete(&mut self, result: Result<T, TransportError>) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(result);
        }
    }

    /// Drop the channel without a value; the receiver observes a closed
    /// channel.
    pub(crate) fn clear(&mut self) {
        self.tx = None;
    }
}
