//! The local member facade consumed by the transport.
//!
//! The transport is deliberately policy-free: term comparisons, log
//! consistency checks, and commit decisions all live behind this trait.
//! Server-side exchanges call into it and relay whatever it answers.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::entry::{EntryProducer, ReceivedEntry};

/// Outcome of a consensus operation on the local member: the member's
/// current term (so the caller can detect staleness) plus the boolean
/// operation result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberResponse {
    /// The responder's current term.
    pub term: i64,
    /// Operation outcome (vote granted, entries accepted, ...).
    pub value: bool,
}

impl MemberResponse {
    /// Create a response.
    pub fn new(term: i64, value: bool) -> Self {
        Self { term, value }
    }
}

/// Failures raised by the local member while applying an operation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MemberError {
    /// The durable log store failed.
    #[error("log store failure: {0}")]
    LogStore(String),

    /// The member cannot serve the operation right now.
    #[error("member unavailable: {0}")]
    Unavailable(String),
}

/// The Raft node's own state machine, consulted by the transport to apply
/// received votes, entries, and snapshots.
///
/// Implementations own all consensus-rule decisions. `sender` identifies the
/// remote peer as reported by the connection.
#[async_trait]
pub trait LocalMember: Send + Sync {
    /// Apply a vote request from a candidate.
    async fn receive_vote(
        &self,
        sender: &str,
        term: i64,
        last_log_index: i64,
        last_log_term: i64,
    ) -> Result<MemberResponse, MemberError>;

    /// Apply replicated entries (empty for heartbeats).
    ///
    /// The member may consume any prefix of `entries`; whatever it leaves is
    /// discarded with the exchange.
    async fn receive_entries(
        &self,
        sender: &str,
        term: i64,
        entries: EntryProducer,
        prev_log_index: i64,
        prev_log_term: i64,
        commit_index: i64,
    ) -> Result<MemberResponse, MemberError>;

    /// Apply a snapshot covering the log up to `snapshot_index`.
    async fn receive_snapshot(
        &self,
        sender: &str,
        term: i64,
        snapshot: ReceivedEntry,
        snapshot_index: i64,
    ) -> Result<MemberResponse, MemberError>;

    /// Ask the member to give up leadership.
    async fn resign(&self) -> Result<bool, MemberError>;

    /// The member's advertised metadata.
    async fn metadata(&self) -> Result<HashMap<String, String>, MemberError>;
}
