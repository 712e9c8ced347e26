//! Client-side heartbeat exchange.
//!
//! A liveness probe: an AppendEntries with no entries, collapsed into a
//! single request packet `{term, prev_log_index, prev_log_term,
//! commit_index}` and a single response packet `{term, success}`.

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::error::TransportError;
use crate::exchange::{
    decode_result_response, Completion, Exchange, ExchangeState, Flow, OutboundPacket,
    PayloadWriter, HEARTBEAT_REQUEST_LEN,
};
use crate::member::MemberResponse;
use crate::wire::{PacketFlags, PacketHeader, PacketKind};

/// Probes the remote member's liveness and advances its commit point.
pub struct HeartbeatExchange {
    term: i64,
    prev_log_index: i64,
    prev_log_term: i64,
    commit_index: i64,
    state: ExchangeState,
    completion: Completion<MemberResponse>,
}

impl HeartbeatExchange {
    /// Create the exchange and the receiver its caller awaits.
    pub fn new(
        term: i64,
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
                state: ExchangeState::Created,
                completion,
            },
            rx,
        )
    }
}

#[async_trait]
impl Exchange for HeartbeatExchange {
    async fn process_inbound(
        &mut self,
        header: PacketHeader,
        payload: &[u8],
    ) -> Result<Flow, TransportError> {
        if self.state != ExchangeState::AwaitingResponse {
            return Err(TransportError::InvalidState(format!(
                "heartbeat response in state {:?}",
                self.state
            )));
        }
        match header.kind {
            PacketKind::Heartbeat => {
                let response = decode_result_response(payload)?;
                self.completion.complete(Ok(response));
                self.state = ExchangeState::Completed;
                Ok(Flow::Complete)
            }
            PacketKind::Ack => Err(super::ack_error(payload)),
            other => Err(TransportError::Protocol(format!(
                "unexpected {:?} packet during heartbeat exchange",
                other
            ))),
        }
    }

    async fn create_outbound(&mut self, buf: &mut [u8]) -> Result<OutboundPacket, TransportError> {
        if self.state != ExchangeState::Created {
            return Err(TransportError::InvalidState(format!(
                "heartbeat request already produced in state {:?}",
                self.state
            )));
        }
        let mut writer = PayloadWriter::new(buf);
        writer.put_i64(self.term);
        writer.put_i64(self.prev_log_index);
        writer.put_i64(self.prev_log_term);
        writer.put_i64(self.commit_index);
        debug_assert_eq!(writer.position(), HEARTBEAT_REQUEST_LEN);

        self.state = ExchangeState::AwaitingResponse;
        Ok(OutboundPacket {
            header: PacketHeader::new(
                PacketKind::Heartbeat,
                PacketFlags::STREAM_START | PacketFlags::STREAM_END,
                HEARTBEAT_REQUEST_LEN as u32,
            ),
            last: true,
        })
    }

    fn on_exception(&mut self, error: TransportError) {
        self.completion.complete(Err(error));
        self.state = ExchangeState::Faulted;
    }

    fn reset(&mut self) {
        self.completion.clear();
        self.state = ExchangeState::Created;
    }

    fn state(&self) -> ExchangeState {
        self.state
    }
}
