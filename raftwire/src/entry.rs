//! Log entry abstractions relayed by the transport.
//!
//! The transport never owns entries durably: outbound content is either
//! borrowed bytes or a streaming source drained chunk by chunk, and inbound
//! entries are transient buffered copies handed to the local member, which
//! may consume any prefix of them.

use std::collections::VecDeque;
use std::fmt;

use tokio::io::AsyncRead;

/// Content of an outbound log entry.
pub enum EntryContent {
    /// Fully materialized content.
    Bytes(Vec<u8>),
    /// Content produced incrementally by an async reader.
    ///
    /// `len` is the declared length when known; `None` means the stream runs
    /// until end-of-file and the wire encodes an unknown length.
    Stream {
        /// Declared content length, if known up front.
        len: Option<u64>,
        /// Source the transport drains one packet chunk at a time.
        reader: Box<dyn AsyncRead + Send + Unpin>,
    },
}

/// An outbound log entry: replication metadata plus content.
pub struct Entry {
    /// Term under which the entry was created.
    pub term: i64,
    /// Creation time, milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// Whether this entry carries a snapshot.
    pub is_snapshot: bool,
    /// Entry content.
    pub content: EntryContent,
}

impl Entry {
    /// Create an entry over in-memory content.
    pub fn new(term: i64, timestamp: i64, is_snapshot: bool, content: Vec<u8>) -> Self {
        Self {
            term,
            timestamp,
            is_snapshot,
            content: EntryContent::Bytes(content),
        }
    }

    /// Create an entry whose content is drained from `reader`.
    pub fn streaming(
        term: i64,
        timestamp: i64,
        is_snapshot: bool,
        len: Option<u64>,
        reader: Box<dyn AsyncRead + Send + Unpin>,
    ) -> Self {
        Self {
            term,
            timestamp,
            is_snapshot,
            content: EntryContent::Stream { len, reader },
        }
    }

    /// The content length, when known.
    pub fn length(&self) -> Option<u64> {
        match &self.content {
            EntryContent::Bytes(bytes) => Some(bytes.len() as u64),
            EntryContent::Stream { len, .. } => *len,
        }
    }
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("term", &self.term)
            .field("timestamp", &self.timestamp)
            .field("is_snapshot", &self.is_snapshot)
            .field("length", &self.length())
            .finish()
    }
}

/// A fully reconstructed inbound entry, buffered while being relayed to the
/// local member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedEntry {
    /// Term under which the entry was created.
    pub term: i64,
    /// Creation time, milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// Whether this entry carries a snapshot.
    pub is_snapshot: bool,
    /// Reassembled content bytes.
    pub content: Vec<u8>,
}

/// Entries handed to the local member, in arrival order.
///
/// The member may stop consuming at any point; unconsumed entries are
/// discarded when the exchange is released. This is what lets the member
/// apply receive-all, receive-a-prefix, or drop-everything policies without
/// the transport mandating any of them.
#[derive(Debug, Default)]
pub struct EntryProducer {
    entries: VecDeque<ReceivedEntry>,
}

impl EntryProducer {
    /// Create a producer over already-buffered entries.
    pub fn new(entries: Vec<ReceivedEntry>) -> Self {
        Self {
            entries: entries.into(),
        }
    }

    /// Entries not yet consumed.
    pub fn remaining(&self) -> usize {
        self.entries.len()
    }

    /// Whether all entries have been consumed.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Iterator for EntryProducer {
    type Item = ReceivedEntry;

    fn next(&mut self) -> Option<ReceivedEntry> {
        self.entries.pop_front()
    }
}
