//! Client-side snapshot transfer exchange.
//!
//! Structurally the streaming pattern of AppendEntries for exactly one
//! chunked entry: a header packet `{term, snapshot_index}` followed by one
//! delimited entry unit carrying the snapshot. Response `{term, success}`.

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::entry::Entry;
use crate::error::TransportError;
use crate::exchange::{
    decode_result_response, Completion, EntrySender, Exchange, ExchangeState, Flow, OutboundPacket,
    PayloadWriter, SNAPSHOT_HEADER_LEN,
};
use crate::member::MemberResponse;
use crate::wire::{PacketFlags, PacketHeader, PacketKind};

/// Installs a snapshot on the remote member.
pub struct SnapshotExchange {
    term: i64,
    snapshot_index: i64,
    sender: EntrySender,
    header_sent: bool,
    state: ExchangeState,
    completion: Completion<MemberResponse>,
}

impl SnapshotExchange {
    /// Create the exchange and the receiver its caller awaits.
    pub fn new(
        term: i64,
        snapshot: Entry,
        snapshot_index: i64,
    ) -> (
        Self,
        oneshot::Receiver<Result<MemberResponse, TransportError>>,
    ) {
        let (completion, rx) = Completion::channel();
        (
            Self {
                term,
                snapshot_index,
                sender: EntrySender::new(vec![snapshot]),
                header_sent: false,
                state: ExchangeState::Created,
                completion,
            },
            rx,
        )
    }
}

#[async_trait]
impl Exchange for SnapshotExchange {
    async fn process_inbound(
        &mut self,
        header: PacketHeader,
        payload: &[u8],
    ) -> Result<Flow, TransportError> {
        if self.state != ExchangeState::AwaitingResponse {
            return Err(TransportError::InvalidState(format!(
                "snapshot response in state {:?}",
                self.state
            )));
        }
        match header.kind {
            PacketKind::InstallSnapshot => {
                let response = decode_result_response(payload)?;
                self.completion.complete(Ok(response));
                self.state = ExchangeState::Completed;
                Ok(Flow::Complete)
            }
            PacketKind::Ack => Err(super::ack_error(payload)),
            other => Err(TransportError::Protocol(format!(
                "unexpected {:?} packet during snapshot exchange",
                other
            ))),
        }
    }

    async fn create_outbound(&mut self, buf: &mut [u8]) -> Result<OutboundPacket, TransportError> {
        if !self.header_sent {
            if self.state != ExchangeState::Created {
                return Err(TransportError::InvalidState(format!(
                    "snapshot request already produced in state {:?}",
                    self.state
                )));
            }
            let mut writer = PayloadWriter::new(buf);
            writer.put_i64(self.term);
            writer.put_i64(self.snapshot_index);
            debug_assert_eq!(writer.position(), SNAPSHOT_HEADER_LEN);

            self.header_sent = true;
            self.state = ExchangeState::Sending;
            return Ok(OutboundPacket {
                header: PacketHeader::new(
                    PacketKind::InstallSnapshot,
                    PacketFlags::STREAM_START | PacketFlags::STREAM_END,
                    SNAPSHOT_HEADER_LEN as u32,
                ),
                last: false,
            });
        }

        let chunk = match self.sender.next_chunk(buf).await? {
            Some(chunk) => chunk,
            None => {
                return Err(TransportError::InvalidState(
                    "snapshot outbound drained past the snapshot entry".to_string(),
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
        self.header_sent = false;
        self.state = ExchangeState::Created;
    }

    fn state(&self) -> ExchangeState {
        self.state
    }
}
