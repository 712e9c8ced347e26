//! Client-side log replication exchange.
//!
//! The request is a packet sequence: a header packet `{term, prev_log_index,
//! prev_log_term, commit_index, entry_count}` followed by one delimited unit
//! per entry, each chunked to the connection's payload capacity. The
//! response is a single `{term, success}` packet.

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::entry::Entry;
use crate::error::TransportError;
use crate::exchange::{
    decode_result_response, Completion, EntrySender, Exchange, ExchangeState, Flow, OutboundPacket,
    PayloadWriter, APPEND_HEADER_LEN,
};
use crate::member::MemberResponse;
use crate::wire::{PacketFlags, PacketHeader, PacketKind};

/// Replicates a batch of log entries to the remote member.
pub struct AppendEntriesExchange {
    term: i64,
    prev_log_index: i64,
    prev_log_term: i64,
    commit_index: i64,
    entry_count: u32,
    sender: EntrySender,
    header_sent: bool,
    state: ExchangeState,
    completion: Completion<MemberResponse>,
}

impl AppendEntriesExchange {
    /// Create the exchange and the receiver its caller awaits.
    pub fn new(
        term: i64,
        entries: Vec<Entry>,
        prev_log_index: i64,
        prev_log_term: i64,
        commit_index: i64,
    ) -> (
        Self,
        oneshot::Receiver<Result<MemberResponse, TransportError>>,
    ) {
        let (completion, rx) = Completion::channel();
        (
            Self {
                term,
                prev_log_index,
                prev_log_term,
                commit_index,
                entry_count: entries.len() as u32,
                sender: EntrySender::new(entries),
                header_sent: false,
                state: ExchangeState::Created,
                completion,
            },
            rx,
        )
    }
}

#[async_trait]
impl Exchange for AppendEntriesExchange {
    async fn process_inbound(
        &mut self,
        header: PacketHeader,
        payload: &[u8],
    ) -> Result<Flow, TransportError> {
        if self.state != ExchangeState::AwaitingResponse {
            return Err(TransportError::InvalidState(format!(
                "append-entries response in state {:?}",
                self.state
            )));
        }
        match header.kind {
            PacketKind::AppendEntries => {
                let response = decode_result_response(payload)?;
                self.completion.complete(Ok(response));
                self.state = ExchangeState::Completed;
                Ok(Flow::Complete)
            }
            PacketKind::Ack => Err(super::ack_error(payload)),
            other => Err(TransportError::Protocol(format!(
                "unexpected {:?} packet during append-entries exchange",
                other
            ))),
        }
    }

    async fn create_outbound(&mut self, buf: &mut [u8]) -> Result<OutboundPacket, TransportError> {
        if !self.header_sent {
            if self.state != ExchangeState::Created {
                return Err(TransportError::InvalidState(format!(
                    "append-entries request already produced in state {:?}",
                    self.state
                )));
            }
            let mut writer = PayloadWriter::new(buf);
            writer.put_i64(self.term);
            writer.put_i64(self.prev_log_index);
            writer.put_i64(self.prev_log_term);
            writer.put_i64(self.commit_index);
            writer.put_u32(self.entry_count);
            debug_assert_eq!(writer.position(), APPEND_HEADER_LEN);

            self.header_sent = true;
            let last = self.sender.is_finished();
            self.state = if last {
                ExchangeState::AwaitingResponse
            } else {
                ExchangeState::Sending
            };
            return Ok(OutboundPacket {
                header: PacketHeader::new(
                    PacketKind::AppendEntries,
                    PacketFlags::STREAM_START | PacketFlags::STREAM_END,
                    APPEND_HEADER_LEN as u32,
                ),
                last,
            });
        }

        let chunk = match self.sender.next_chunk(buf).await? {
            Some(chunk) => chunk,
            None => {
                return Err(TransportError::InvalidState(
                    "append-entries outbound drained past the last entry".to_string(),
                ))
            }
        };
        let mut flags = PacketFlags::empty();
        if chunk.start {
            flags |= PacketFlags::STREAM_START;
        }
        if chunk.end {
            flags |= PacketFlags::STREAM_END;
        }
        let last = self.sender.is_finished();
        if last {
            self.state = ExchangeState::AwaitingResponse;
        }
        Ok(OutboundPacket {
            header: PacketHeader::new(PacketKind::Continue, flags, chunk.len as u32),
            last,
        })
    }

    fn on_exception(&mut self, error: TransportError) {
        self.completion.complete(Err(error));
        self.state = ExchangeState::Faulted;
    }

    fn reset(&mut self) {
        self.completion.clear();
        self.sender = EntrySender::new(Vec::new());
        self.entry_count = 0;
        self.header_sent = false;
        self.state = ExchangeState::Created;
    }

    fn state(&self) -> ExchangeState {
        self.state
    }
}
