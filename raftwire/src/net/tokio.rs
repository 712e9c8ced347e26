//! Real TCP networking using Tokio.

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};

use super::{Listener, NetworkProvider};

/// [`NetworkProvider`] over real TCP sockets.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioNetworkProvider;

impl TokioNetworkProvider {
    /// Create the provider.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl NetworkProvider for TokioNetworkProvider {
    type Stream = TcpStream;
    type Listener = TokioListener;

    async fn connect(&self, address: &str) -> std::io::Result<TcpStream> {
        let stream = TcpStream::connect(address).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    async fn bind(&self, address: &str) -> std::io::Result<TokioListener> {
        Ok(TokioListener {
            inner: TcpListener::bind(address).await?,
        })
    }
}

/// TCP listener wrapper.
#[derive(Debug)]
pub struct TokioListener {
    inner: TcpListener,
}

#[async_trait]
impl Listener for TokioListener {
    type Stream = TcpStream;

    async fn accept(&self) -> std::io::Result<(TcpStream, String)> {
        let (stream, peer) = self.inner.accept().await?;
        stream.set_nodelay(true)?;
        Ok((stream, peer.to_string()))
    }

    fn local_addr(&self) -> std::io::Result<String> {
        Ok(self.inner.local_addr()?.to_string())
    }
}
