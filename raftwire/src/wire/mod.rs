//! Wire format for the Raft exchange protocol.
//!
//! Packet format: `[kind:1][flags:1][payload_len:4][payload:N]`
//!
//! - **kind**: Message type code identifying the RPC or control packet
//! - **flags**: Stream delimiter bits (`STREAM_START`, `STREAM_END`)
//! - **payload_len**: Payload size in bytes (network byte order, u32)
//! - **payload**: RPC-specific binary layout
//!
//! Every *payload unit* (a request body, a response body, one log entry, a
//! metadata map) travels as a delimited packet sequence: `STREAM_START` on
//! its first packet, `STREAM_END` on its last. A unit that fits one packet
//! carries both bits. The first packet of a logical message carries the RPC
//! kind; every later packet of the same message carries [`PacketKind::Continue`].

use bitflags::bitflags;

/// Header size: 1 (kind) + 1 (flags) + 4 (payload length) = 6 bytes.
pub const HEADER_SIZE: usize = 6;

/// Smallest payload capacity a connection buffer may offer.
///
/// Every fixed request layout (the largest is the AppendEntries header at
/// 36 bytes) must fit a single packet, so buffers below this are rejected
/// at configuration time.
pub const MIN_PAYLOAD_CAPACITY: usize = 64;

/// Status byte carried by an [`PacketKind::Ack`] packet when the server's
/// exchange pool is exhausted.
pub const ACK_BUSY: u8 = 0;

/// Status byte carried by an [`PacketKind::Ack`] packet when the server-side
/// exchange faulted (for example a log store failure in the local member).
pub const ACK_FAULT: u8 = 1;

/// Framing error types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// Not enough bytes to hold a header.
    #[error("insufficient data: need {needed} bytes, have {have}")]
    InsufficientData {
        /// Minimum bytes required.
        needed: usize,
        /// Actual bytes available.
        have: usize,
    },

    /// Declared payload length exceeds the connection buffer's capacity.
    #[error("payload too large: {length} bytes (capacity {capacity})")]
    PayloadTooLarge {
        /// Declared payload length from the header.
        length: u32,
        /// Payload capacity of the receiving buffer.
        capacity: usize,
    },

    /// Message type code is not part of the protocol.
    #[error("unknown packet kind: {0:#04x}")]
    UnknownKind(u8),

    /// Flag byte has bits outside the defined set.
    #[error("invalid packet flags: {0:#010b}")]
    InvalidFlags(u8),
}

/// Message type codes carried in the packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketKind {
    /// Leader election vote request/response.
    Vote = 1,
    /// Liveness probe (an empty AppendEntries).
    Heartbeat = 2,
    /// Log replication request/response.
    AppendEntries = 3,
    /// Snapshot transfer request/response.
    InstallSnapshot = 4,
    /// Key/value metadata request/response.
    Metadata = 5,
    /// Leadership resignation request/response.
    Resign = 6,
    /// Continuation packet of an in-progress logical message.
    Continue = 7,
    /// Control acknowledgement (busy rejection, remote fault).
    Ack = 8,
}

impl PacketKind {
    /// Decode a kind from its wire code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(PacketKind::Vote),
            2 => Some(PacketKind::Heartbeat),
            3 => Some(PacketKind::AppendEntries),
            4 => Some(PacketKind::InstallSnapshot),
            5 => Some(PacketKind::Metadata),
            6 => Some(PacketKind::Resign),
            7 => Some(PacketKind::Continue),
            8 => Some(PacketKind::Ack),
            _ => None,
        }
    }

    /// The wire code for this kind.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Whether this kind can open a logical RPC on the server side.
    pub fn is_request(self) -> bool {
        !matches!(self, PacketKind::Continue | PacketKind::Ack)
    }
}

bitflags! {
    /// Stream delimiter bits carried in the packet header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PacketFlags: u8 {
        /// First packet of a payload unit.
        const STREAM_START = 0b0000_0001;
        /// Last packet of a payload unit.
        const STREAM_END = 0b0000_0010;
    }
}

/// Fixed-size packet header preceding every payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Message type code.
    pub kind: PacketKind,
    /// Stream delimiter flags.
    pub flags: PacketFlags,
    /// Payload length in bytes.
    pub length: u32,
}

impl PacketHeader {
    /// Create a new header.
    pub fn new(kind: PacketKind, flags: PacketFlags, length: u32) -> Self {
        Self {
            kind,
            flags,
            length,
        }
    }

    /// Encode this header into the first [`HEADER_SIZE`] bytes of `buf`.
    ///
    /// Writes into the caller-supplied buffer only; never allocates.
    ///
    /// # Errors
    ///
    /// Returns `InsufficientData` if `buf` is smaller than [`HEADER_SIZE`].
    pub fn encode_into(&self, buf: &mut [u8]) -> Result<(), FrameError> {
        if buf.len() < HEADER_SIZE {
            return Err(FrameError::InsufficientData {
                needed: HEADER_SIZE,
                have: buf.len(),
            });
        }
        buf[0] = self.kind.code();
        buf[1] = self.flags.bits();
        buf[2..HEADER_SIZE].copy_from_slice(&self.length.to_be_bytes());
        Ok(())
    }

    /// Decode a header from `buf`, validating the declared length against
    /// `max_payload` (the receiving buffer's payload capacity).
    ///
    /// # Errors
    ///
    /// - `InsufficientData` if `buf` is shorter than [`HEADER_SIZE`]
    /// - `UnknownKind` / `InvalidFlags` for malformed type or flag bytes
    /// - `PayloadTooLarge` if the declared length exceeds `max_payload`
    pub fn decode(buf: &[u8], max_payload: usize) -> Result<Self, FrameError> {
        if buf.len() < HEADER_SIZE {
            return Err(FrameError::InsufficientData {
                needed: HEADER_SIZE,
                have: buf.len(),
            });
        }
        let kind = PacketKind::from_code(buf[0]).ok_or(FrameError::UnknownKind(buf[0]))?;
        let flags = PacketFlags::from_bits(buf[1]).ok_or(FrameError::InvalidFlags(buf[1]))?;
        let length = u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]);
        if length as usize > max_payload {
            return Err(FrameError::PayloadTooLarge {
                length,
                capacity: max_payload,
            });
        }
        Ok(Self {
            kind,
            flags,
            length,
        })
    }

    /// Whether this packet opens a payload unit.
    pub fn is_stream_start(&self) -> bool {
        self.flags.contains(PacketFlags::STREAM_START)
    }

    /// Whether this packet closes a payload unit.
    pub fn is_stream_end(&self) -> bool {
        self.flags.contains(PacketFlags::STREAM_END)
    }
}
