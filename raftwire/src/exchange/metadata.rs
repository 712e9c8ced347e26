//! Client-side metadata exchange.
//!
//! Empty request; the response streams a key/value string map, chunked
//! across packets when it exceeds one packet's payload capacity.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::error::TransportError;
use crate::exchange::{Completion, Exchange, ExchangeState, Flow, OutboundPacket, PayloadReader};
use crate::wire::{PacketFlags, PacketHeader, PacketKind};

/// Encode a metadata map as `[key_len:u32][key][value_len:u32][value]`*.
pub(crate) fn encode_metadata(map: &HashMap<String, String>) -> Vec<u8> {
    let mut out = Vec::new();
    for (key, value) in map {
        out.extend_from_slice(&(key.len() as u32).to_be_bytes());
        out.extend_from_slice(key.as_bytes());
        out.extend_from_slice(&(value.len() as u32).to_be_bytes());
        out.extend_from_slice(value.as_bytes());
    }
    out
}

/// Decode a metadata map from its reassembled byte form.
pub(crate) fn decode_metadata(bytes: &[u8]) -> Result<HashMap<String, String>, TransportError> {
    let mut map = HashMap::new();
    let mut pos = 0;
    while pos < bytes.len() {
        let mut reader = PayloadReader::new(&bytes[pos..]);
        let key_len = reader.get_u32()? as usize;
        pos += 4;
        let key = read_string(bytes, &mut pos, key_len)?;
        let mut reader = PayloadReader::new(&bytes[pos..]);
        let value_len = reader.get_u32()? as usize;
        pos += 4;
        let value = read_string(bytes, &mut pos, value_len)?;
        map.insert(key, value);
    }
    Ok(map)
}

fn read_string(bytes: &[u8], pos: &mut usize, len: usize) -> Result<String, TransportError> {
    if *pos + len > bytes.len() {
        return Err(TransportError::Protocol(
            "truncated metadata string".to_string(),
        ));
    }
    let raw = &bytes[*pos..*pos + len];
    *pos += len;
    String::from_utf8(raw.to_vec())
        .map_err(|_| TransportError::Protocol("metadata string is not utf-8".to_string()))
}

/// Fetches the remote member's metadata map.
pub struct MetadataExchange {
    collected: Vec<u8>,
    state: ExchangeState,
    completion: Completion<HashMap<String, String>>,
}

impl MetadataExchange {
    /// Create the exchange and the receiver its caller awaits.
    pub fn new() -> (
        Self,
        oneshot::Receiver<Result<HashMap<String, String>, TransportError>>,
    ) {
        let (completion, rx) = Completion::channel();
        (
            Self {
                collected: Vec::new(),
                state: ExchangeState::Created,
                completion,
            },
            rx,
        )
    }
}

#[async_trait]
impl Exchange for MetadataExchange {
    async fn process_inbound(
        &mut self,
        header: PacketHeader,
        payload: &[u8],
    ) -> Result<Flow, TransportError> {
        if self.state != ExchangeState::AwaitingResponse {
            return Err(TransportError::InvalidState(format!(
                "metadata response in state {:?}",
                self.state
            )));
        }
        match header.kind {
            PacketKind::Metadata if self.collected.is_empty() && header.is_stream_start() => {}
            PacketKind::Continue if !header.is_stream_start() => {}
            PacketKind::Ack => return Err(super::ack_error(payload)),
            other => {
                return Err(TransportError::Protocol(format!(
                    "unexpected {:?} packet during metadata exchange",
                    other
                )))
            }
        }

        self.collected.extend_from_slice(payload);
        if !header.is_stream_end() {
            return Ok(Flow::AwaitInbound);
        }

        let map = decode_metadata(&self.collected)?;
        self.completion.complete(Ok(map));
        self.state = ExchangeState::Completed;
        Ok(Flow::Complete)
    }

    async fn create_outbound(&mut self, _buf: &mut [u8]) -> Result<OutboundPacket, TransportError> {
        if self.state != ExchangeState::Created {
            return Err(TransportError::InvalidState(format!(
                "metadata request already produced in state {:?}",
                self.state
            )));
        }
        self.state = ExchangeState::AwaitingResponse;
        Ok(OutboundPacket {
            header: PacketHeader::new(
                PacketKind::Metadata,
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
        self.collected.clear();
        self.state = ExchangeState::Created;
    }

    fn state(&self) -> ExchangeState {
        self.state
    }
}
