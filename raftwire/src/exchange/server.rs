//! Pooled server-side exchange handler.
//!
//! One [`ServerExchange`] serves one logical RPC at a time: the transport
//! rents it from the pool when a request's opening packet arrives, feeds it
//! every packet of that message, drains its response packets, and releases
//! it (which resets it) on every exit path. The handler classifies the RPC
//! from the kind tag of the opening packet rather than from its own type,
//! which is what lets any free handler serve any request.

use std::sync::Arc;

use async_trait::async_trait;

use crate::entry::EntryProducer;
use crate::error::TransportError;
use crate::exchange::metadata::encode_metadata;
use crate::exchange::{
    encode_result_response, EntryReceiver, Exchange, ExchangeState, Flow, OutboundPacket,
    PayloadReader,
};
use crate::member::{LocalMember, MemberResponse};
use crate::wire::{PacketFlags, PacketHeader, PacketKind};

enum ServerOp {
    Idle,
    CollectingEntries {
        term: i64,
        prev_log_index: i64,
        prev_log_term: i64,
        commit_index: i64,
        receiver: EntryReceiver,
    },
    CollectingSnapshot {
        term: i64,
        snapshot_index: i64,
        receiver: EntryReceiver,
    },
}

enum ResponseBody {
    None,
    Result {
        kind: PacketKind,
        response: MemberResponse,
    },
    Resigned(bool),
    Metadata {
        bytes: Vec<u8>,
        offset: usize,
        started: bool,
    },
}

/// Reusable server-side handler for one in-flight logical RPC.
pub struct ServerExchange {
    member: Arc<dyn LocalMember>,
    peer: String,
    state: ExchangeState,
    op: ServerOp,
    response: ResponseBody,
}

impl ServerExchange {
    /// Create a handler bound to the local member it will call into.
    pub fn new(member: Arc<dyn LocalMember>) -> Self {
        Self {
            member,
            peer: String::new(),
            state: ExchangeState::Created,
            op: ServerOp::Idle,
            response: ResponseBody::None,
        }
    }

    /// Bind this handler to a connection's peer for the coming RPC.
    pub fn begin(&mut self, peer: &str) {
        self.peer.clear();
        self.peer.push_str(peer);
    }

    async fn open(&mut self, header: PacketHeader, payload: &[u8]) -> Result<Flow, TransportError> {
        if !header.is_stream_start() {
            return Err(TransportError::Protocol(format!(
                "{:?} request without stream start",
                header.kind
            )));
        }
        match header.kind {
            PacketKind::Vote => {
                let mut reader = PayloadReader::new(payload);
                let term = reader.get_i64()?;
                let last_log_index = reader.get_i64()?;
                let last_log_term = reader.get_i64()?;
                let response = self
                    .member
                    .receive_vote(&self.peer, term, last_log_index, last_log_term)
                    .await
                    .map_err(TransportError::from)?;
                self.response = ResponseBody::Result {
                    kind: PacketKind::Vote,
                    response,
                };
            }
            PacketKind::Heartbeat => {
                let mut reader = PayloadReader::new(payload);
                let term = reader.get_i64()?;
                let prev_log_index = reader.get_i64()?;
                let prev_log_term = reader.get_i64()?;
                let commit_index = reader.get_i64()?;
                let response = self
                    .member
                    .receive_entries(
                        &self.peer,
                        term,
                        EntryProducer::new(Vec::new()),
                        prev_log_index,
                        prev_log_term,
                        commit_index,
                    )
                    .await
                    .map_err(TransportError::from)?;
                self.response = ResponseBody::Result {
                    kind: PacketKind::Heartbeat,
                    response,
                };
            }
            PacketKind::AppendEntries => {
                let mut reader = PayloadReader::new(payload);
                let term = reader.get_i64()?;
                let prev_log_index = reader.get_i64()?;
                let prev_log_term = reader.get_i64()?;
                let commit_index = reader.get_i64()?;
                let entry_count = reader.get_u32()?;
                if entry_count == 0 {
                    let response = self
                        .member
                        .receive_entries(
                            &self.peer,
                            term,
                            EntryProducer::new(Vec::new()),
                            prev_log_index,
                            prev_log_term,
                            commit_index,
                        )
                        .await
                        .map_err(TransportError::from)?;
                    self.response = ResponseBody::Result {
                        kind: PacketKind::AppendEntries,
                        response,
                    };
                } else {
                    self.op = ServerOp::CollectingEntries {
                        term,
                        prev_log_index,
                        prev_log_term,
                        commit_index,
                        receiver: EntryReceiver::new(entry_count),
                    };
                    self.state = ExchangeState::AwaitingResponse;
                    return Ok(Flow::AwaitInbound);
                }
            }
            PacketKind::InstallSnapshot => {
                let mut reader = PayloadReader::new(payload);
                let term = reader.get_i64()?;
                let snapshot_index = reader.get_i64()?;
                self.op = ServerOp::CollectingSnapshot {
                    term,
                    snapshot_index,
                    receiver: EntryReceiver::new(1),
                };
                self.state = ExchangeState::AwaitingResponse;
                return Ok(Flow::AwaitInbound);
            }
            PacketKind::Metadata => {
                let map = self
                    .member
                    .metadata()
                    .await
                    .map_err(TransportError::from)?;
                self.response = ResponseBody::Metadata {
                    bytes: encode_metadata(&map),
                    offset: 0,
                    started: false,
                };
            }
            PacketKind::Resign => {
                let resigned = self.member.resign().await.map_err(TransportError::from)?;
                self.response = ResponseBody::Resigned(resigned);
            }
            PacketKind::Continue | PacketKind::Ack => {
                return Err(TransportError::Protocol(format!(
                    "{:?} packet cannot open an exchange",
                    header.kind
                )))
            }
        }
        self.state = ExchangeState::Completing;
        Ok(Flow::SendOutbound)
    }

    async fn continue_collecting(
        &mut self,
        header: PacketHeader,
        payload: &[u8],
    ) -> Result<Flow, TransportError> {
        if header.kind != PacketKind::Continue {
            return Err(TransportError::Protocol(format!(
                "{:?} packet inside an in-flight request",
                header.kind
            )));
        }
        let done = match &mut self.op {
            ServerOp::CollectingEntries { receiver, .. }
            | ServerOp::CollectingSnapshot { receiver, .. } => receiver.accept(&header, payload)?,
            ServerOp::Idle => {
                return Err(TransportError::InvalidState(
                    "continuation with no request in progress".to_string(),
                ))
            }
        };
        if !done {
            return Ok(Flow::AwaitInbound);
        }

        match std::mem::replace(&mut self.op, ServerOp::Idle) {
            ServerOp::CollectingEntries {
                term,
                prev_log_index,
                prev_log_term,
                commit_index,
                receiver,
            } => {
                let producer = EntryProducer::new(receiver.into_entries());
                let response = self
                    .member
                    .receive_entries(
                        &self.peer,
                        term,
                        producer,
                        prev_log_index,
                        prev_log_term,
                        commit_index,
                    )
                    .await
                    .map_err(TransportError::from)?;
                self.response = ResponseBody::Result {
                    kind: PacketKind::AppendEntries,
                    response,
                };
            }
            ServerOp::CollectingSnapshot {
                term,
                snapshot_index,
                receiver,
            } => {
                let mut entries = receiver.into_entries();
                let snapshot = entries.pop().ok_or_else(|| {
                    TransportError::InvalidState(
                        "snapshot request completed with no entry".to_string(),
                    )
                })?;
                let response = self
                    .member
                    .receive_snapshot(&self.peer, term, snapshot, snapshot_index)
                    .await
                    .map_err(TransportError::from)?;
                self.response = ResponseBody::Result {
                    kind: PacketKind::InstallSnapshot,
                    response,
                };
            }
            ServerOp::Idle => {
                return Err(TransportError::InvalidState(
                    "no request in progress".to_string(),
                ))
            }
        }
        self.state = ExchangeState::Completing;
        Ok(Flow::SendOutbound)
    }
}

#[async_trait]
impl Exchange for ServerExchange {
    async fn process_inbound(
        &mut self,
        header: PacketHeader,
        payload: &[u8],
    ) -> Result<Flow, TransportError> {
        match self.state {
            ExchangeState::Created => self.open(header, payload).await,
            ExchangeState::AwaitingResponse => self.continue_collecting(header, payload).await,
            other => Err(TransportError::InvalidState(format!(
                "inbound packet in state {:?}",
                other
            ))),
        }
    }

    async fn create_outbound(&mut self, buf: &mut [u8]) -> Result<OutboundPacket, TransportError> {
        if self.state != ExchangeState::Completing {
            return Err(TransportError::InvalidState(format!(
                "outbound requested in state {:?}",
                self.state
            )));
        }
        let (header, last) = match &mut self.response {
            ResponseBody::None => {
                return Err(TransportError::InvalidState(
                    "no response to produce".to_string(),
                ))
            }
            ResponseBody::Result { kind, response } => {
                let len = encode_result_response(buf, *response);
                (
                    PacketHeader::new(
                        *kind,
                        PacketFlags::STREAM_START | PacketFlags::STREAM_END,
                        len as u32,
                    ),
                    true,
                )
            }
            ResponseBody::Resigned(value) => {
                buf[0] = u8::from(*value);
                (
                    PacketHeader::new(
                        PacketKind::Resign,
                        PacketFlags::STREAM_START | PacketFlags::STREAM_END,
                        1,
                    ),
                    true,
                )
            }
            ResponseBody::Metadata {
                bytes,
                offset,
                started,
            } => {
                let n = (bytes.len() - *offset).min(buf.len());
                buf[..n].copy_from_slice(&bytes[*offset..*offset + n]);
                let kind = if *started {
                    PacketKind::Continue
                } else {
                    PacketKind::Metadata
                };
                let mut flags = PacketFlags::empty();
                if !*started {
                    flags |= PacketFlags::STREAM_START;
                }
                *started = true;
                *offset += n;
                let end = *offset == bytes.len();
                if end {
                    flags |= PacketFlags::STREAM_END;
                }
                (PacketHeader::new(kind, flags, n as u32), end)
            }
        };
        if last {
            self.response = ResponseBody::None;
            self.state = ExchangeState::Completed;
        }
        Ok(OutboundPacket { header, last })
    }

    fn on_exception(&mut self, error: TransportError) {
        tracing::debug!(peer = %self.peer, %error, "server exchange faulted");
        self.state = ExchangeState::Faulted;
    }

    fn reset(&mut self) {
        self.peer.clear();
        self.op = ServerOp::Idle;
        self.response = ResponseBody::None;
        self.state = ExchangeState::Created;
    }

    fn state(&self) -> ExchangeState {
        self.state
    }
}
