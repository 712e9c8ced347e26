//! Client-side resignation exchange.
//!
//! Empty request; single-byte boolean response reporting whether the remote
//! member gave up leadership.

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::error::TransportError;
use crate::exchange::{Completion, Exchange, ExchangeState, Flow, OutboundPacket, PayloadReader};
use crate::wire::{PacketFlags, PacketHeader, PacketKind};

/// Asks the remote member to resign leadership.
pub struct ResignExchange {
    state: ExchangeState,
    completion: Completion<bool>,
}

impl ResignExchange {
    /// Create the exchange and the receiver its caller awaits.
    pub fn new() -> (Self, oneshot::Receiver<Result<bool, TransportError>>) {
        let (completion, rx) = Completion::channel();
        (
            Self {
                state: ExchangeState::Created,
                completion,
            },
            rx,
        )
    }
}

#[async_trait]
impl Exchange for ResignExchange {
    async fn process_inbound(
        &mut self,
        header: PacketHeader,
        payload: &[u8],
    ) -> Result<Flow, TransportError> {
        if self.state != ExchangeState::AwaitingResponse {
            return Err(TransportError::InvalidState(format!(
                "resign response in state {:?}",
                self.state
            )));
        }
        match header.kind {
            PacketKind::Resign => {
                let mut reader = PayloadReader::new(payload);
                let resigned = reader.get_u8()? != 0;
                self.completion.complete(Ok(resigned));
                self.state = ExchangeState::Completed;
                Ok(Flow::Complete)
            }
            PacketKind::Ack => Err(super::ack_error(payload)),
            other => Err(TransportError::Protocol(format!(
                "unexpected {:?} packet during resign exchange",
                other
            ))),
        }
    }

    async fn create_outbound(&mut self, _buf: &mut [u8]) -> Result<OutboundPacket, TransportError> {
        if self.state != ExchangeState::Created {
            return Err(TransportError::InvalidState(format!(
                "resign request already produced in state {:?}",
                self.state
            )));
        }
        self.state = ExchangeState::AwaitingResponse;
        Ok(OutboundPacket {
            header: PacketHeader::new(
                PacketKind::Resign,
                PacketFlags::STREAM_START | PacketFlags::STREAM_END,
                0,
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

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resign_roundtrip() {
        let (mut exchange, rx) = ResignExchange::new();
        let mut buf = [0u8; 16];

        let out = exchange.create_outbound(&mut buf).await.expect("outbound");
        assert_eq!(out.header.kind, PacketKind::Resign);
        assert_eq!(out.header.length, 0);
        assert!(out.last);

        let header = PacketHeader::new(
            PacketKind::Resign,
            PacketFlags::STREAM_START | PacketFlags::STREAM_END,
            1,
        );
        let flow = exchange.process_inbound(header, &[1]).await.expect("inbound");
        assert_eq!(flow, Flow::Complete);
        assert!(rx.await.expect("completed").expect("ok"));
    }

    #[tokio::test]
    async fn test_resign_denied() {
        let (mut exchange, rx) = ResignExchange::new();
        let mut buf = [0u8; 16];
        exchange.create_outbound(&mut buf).await.expect("outbound");

        let header = PacketHeader::new(
            PacketKind::Resign,
            PacketFlags::STREAM_START | PacketFlags::STREAM_END,
            1,
        );
        exchange.process_inbound(header, &[0]).await.expect("inbound");
        assert!(!rx.await.expect("completed").expect("ok"));
    }
}
