//! Network abstraction layer.
//!
//! The transport consumes sockets through this narrow seam so real TCP and
//! in-memory networking are interchangeable: [`TokioNetworkProvider`] for
//! production, [`MemoryNetworkProvider`] for tests.

/// In-memory networking over duplex pipes.
pub mod memory;
/// Real TCP networking using Tokio.
pub mod tokio;

pub use self::memory::{MemoryListener, MemoryNetworkProvider};
pub use self::tokio::{TokioListener, TokioNetworkProvider};

use async_trait::async_trait;
use ::tokio::io::{AsyncRead, AsyncWrite};

/// Creates connections and listeners for the transport.
#[async_trait]
pub trait NetworkProvider: Send + Sync {
    /// The byte stream both sides exchange packets over.
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;
    /// The listener produced by [`NetworkProvider::bind`].
    type Listener: Listener<Stream = Self::Stream>;

    /// Open a connection to `address`.
    async fn connect(&self, address: &str) -> std::io::Result<Self::Stream>;

    /// Bind a listener on `address`.
    async fn bind(&self, address: &str) -> std::io::Result<Self::Listener>;
}

/// Accepts inbound connections.
#[async_trait]
pub trait Listener: Send + Sync + 'static {
    /// The accepted stream type.
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Wait for the next inbound connection; returns the stream and the
    /// peer's address.
    async fn accept(&self) -> std::io::Result<(Self::Stream, String)>;

    /// The address this listener is bound to.
    fn local_addr(&self) -> std::io::Result<String>;
}
