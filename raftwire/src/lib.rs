//! # raftwire
//!
//! Raft consensus transport: peer-to-peer exchanges for leader election,
//! log replication, and snapshot installation over a compact binary wire
//! protocol with pooled-buffer I/O.
//!
//! This crate provides:
//! - **Wire format**: fixed 6-byte headers framing chunked binary payloads
//! - **Exchanges**: one state machine per logical RPC (vote, heartbeat,
//!   append entries, install snapshot, metadata, resign)
//! - **Client transport**: a queue-driven send loop, strictly one exchange
//!   in flight per connection
//! - **Server transport**: an accept loop renting pooled exchange handlers
//!   per inbound request
//! - **Local member facade**: the narrow seam consensus decisions live
//!   behind
//!
//! The transport is policy-free: it relays votes, entries, and snapshots to
//! the [`LocalMember`] and relays its answers back. Retries, elections, and
//! commit rules belong to the layer above.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use raftwire::{LocalMember, RaftClient, RaftServer, TokioNetworkProvider, TransportConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! async fn probe(member: Arc<dyn LocalMember>) -> Result<(), raftwire::TransportError> {
//!     let net = TokioNetworkProvider::new();
//!     let server =
//!         RaftServer::bind(&net, "127.0.0.1:4500", member, TransportConfig::default()).await?;
//!     let client =
//!         RaftClient::connect(&net, server.local_addr(), TransportConfig::default()).await?;
//!
//!     let response = client.vote(1, 0, 0, &CancellationToken::new()).await?;
//!     tracing::info!(term = response.term, granted = response.value, "vote answered");
//!     Ok(())
//! }
//! ```

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

// =============================================================================
// Modules
// =============================================================================

/// Pooled connection buffers.
pub mod buffer;

/// Queue-driven client transport.
pub mod client;

/// Transport configuration.
pub mod config;

/// Log entry abstractions relayed by the transport.
pub mod entry;

/// Error types for transport operations.
pub mod error;

/// Exchange state machines, one per logical RPC.
pub mod exchange;

/// The local member facade consumed by the transport.
pub mod member;

/// Transport operation counters.
pub mod metrics;

/// Network abstraction layer.
pub mod net;

/// Bounded pool of reusable server-side exchange handlers.
pub mod pool;

/// Server transport: accept loop and per-connection exchange driving.
pub mod server;

/// Wire format: packet headers, kinds, and flags.
pub mod wire;

mod connection;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use buffer::{BufferPool, PooledBuffer};
pub use client::{with_deadline, RaftClient};
pub use config::TransportConfig;
pub use entry::{Entry, EntryContent, EntryProducer, ReceivedEntry};
pub use error::TransportError;
pub use exchange::{
    AppendEntriesExchange, Exchange, ExchangeState, Flow, HeartbeatExchange, MetadataExchange,
    OutboundPacket, ResignExchange, ServerExchange, SnapshotExchange, VoteExchange,
};
pub use member::{LocalMember, MemberError, MemberResponse};
pub use metrics::TransportMetrics;
pub use net::{
    Listener, MemoryListener, MemoryNetworkProvider, NetworkProvider, TokioListener,
    TokioNetworkProvider,
};
pub use pool::{ExchangePool, RentedExchange};
pub use server::RaftServer;
pub use wire::{FrameError, PacketFlags, PacketHeader, PacketKind, HEADER_SIZE};
