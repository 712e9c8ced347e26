//! Client-side vote exchange.
//!
//! Single request packet `{term, last_log_index, last_log_term}`, single
//! response packet `{term, granted}`.

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::error::TransportError;
use crate::exchange::{
    decode_result_response, Completion, Exchange, ExchangeState, Flow, OutboundPacket,
    PayloadWriter, VOTE_REQUEST_LEN,
};
use crate::member::MemberResponse;
use crate::wire::{PacketFlags, PacketHeader, PacketKind};

/// Requests a leader election vote from the remote member.
pub struct VoteExchange {
    term: i64,
    last_log_index: i64,
    last_log_term: i64,
    state: ExchangeState,
    completion: Completion<MemberResponse>,
}

impl VoteExchange {
    /// Create the exchange and the receiver its caller awaits.
    pub fn new(
        term: i64,
        last_log_index: i64,
        last_log_term: i64,
    ) -> (
        Self,
        oneshot::Receiver<Result<MemberResponse, TransportError>>,
    ) {
        let (completion, rx) = Completion::channel();
        (
            Self {
                term,
                last_log_index,
                last_log_term,
                state: ExchangeState::Created,
                completion,
            },
            rx,
        )
    }
}

#[async_trait]
impl Exchange for VoteExchange {
    async fn process_inbound(
        &mut self,
        header: PacketHeader,
        payload: &[u8],
    ) -> Result<Flow, TransportError> {
        if self.state != ExchangeState::AwaitingResponse {
            return Err(TransportError::InvalidState(format!(
                "vote response in state {:?}",
                self.state
            )));
        }
        match header.kind {
            PacketKind::Vote => {
                let response = decode_result_response(payload)?;
                self.completion.complete(Ok(response));
                self.state = ExchangeState::Completed;
                Ok(Flow::Complete)
            }
            PacketKind::Ack => Err(super::ack_error(payload)),
            other => Err(TransportError::Protocol(format!(
                "unexpected {:?} packet during vote exchange",
                other
            ))),
        }
    }

    async fn create_outbound(&mut self, buf: &mut [u8]) -> Result<OutboundPacket, TransportError> {
        if self.state != ExchangeState::Created {
            return Err(TransportError::InvalidState(format!(
                "vote request already produced in state {:?}",
                self.state
            )));
        }
        let mut writer = PayloadWriter::new(buf);
        writer.put_i64(self.term);
        writer.put_i64(self.last_log_index);
        writer.put_i64(self.last_log_term);
        debug_assert_eq!(writer.position(), VOTE_REQUEST_LEN);

        self.state = ExchangeState::AwaitingResponse;
        Ok(OutboundPacket {
            header: PacketHeader::new(
                PacketKind::Vote,
                PacketFlags::STREAM_START | PacketFlags::STREAM_END,
                VOTE_REQUEST_LEN as u32,
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
