//! In-memory networking over duplex pipes.
//!
//! Connections are `tokio::io::duplex` pairs routed through a shared address
//! registry, so client and server transports can be exercised end to end
//! with no sockets involved.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

use super::{Listener, NetworkProvider};

const PIPE_CAPACITY: usize = 64 * 1024;

type Accepted = (DuplexStream, String);

/// [`NetworkProvider`] over in-process duplex pipes.
///
/// Clones share the same address space: a provider cloned from another can
/// connect to listeners the original bound.
#[derive(Clone, Default)]
pub struct MemoryNetworkProvider {
    listeners: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Accepted>>>>,
    next_peer: Arc<AtomicU64>,
}

impl MemoryNetworkProvider {
    /// Create an empty address space.
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Debug for MemoryNetworkProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryNetworkProvider").finish()
    }
}

#[async_trait]
impl NetworkProvider for MemoryNetworkProvider {
    type Stream = DuplexStream;
    type Listener = MemoryListener;

    async fn connect(&self, address: &str) -> std::io::Result<DuplexStream> {
        let sender = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(address)
            .cloned()
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    format!("no listener bound at {address}"),
                )
            })?;

        let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
        let peer = format!("mem:{}", self.next_peer.fetch_add(1, Ordering::Relaxed));
        sender.send((server, peer)).map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "listener dropped while connecting",
            )
        })?;
        Ok(client)
    }

    async fn bind(&self, address: &str) -> std::io::Result<MemoryListener> {
        let mut listeners = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if listeners.contains_key(address) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                format!("address {address} already bound"),
            ));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        listeners.insert(address.to_string(), tx);
        Ok(MemoryListener {
            address: address.to_string(),
            incoming: tokio::sync::Mutex::new(rx),
        })
    }
}

/// Listener half of a [`MemoryNetworkProvider`] binding.
#[derive(Debug)]
pub struct MemoryListener {
    address: String,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<Accepted>>,
}

#[async_trait]
impl Listener for MemoryListener {
    type Stream = DuplexStream;

    async fn accept(&self) -> std::io::Result<(DuplexStream, String)> {
        self.incoming.lock().await.recv().await.ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "memory listener channel closed",
            )
        })
    }

    fn local_addr(&self) -> std::io::Result<String> {
        Ok(self.address.clone())
    }
}
