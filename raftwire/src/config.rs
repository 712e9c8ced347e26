//! Transport configuration.

use crate::error::TransportError;
use crate::wire::{HEADER_SIZE, MIN_PAYLOAD_CAPACITY};

/// Configuration shared by client and server transports.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Size in bytes of each pooled connection buffer. Buffers never grow;
    /// this bounds a single packet (header + payload) and therefore the
    /// chunk size of streamed entries.
    pub buffer_capacity: usize,

    /// Number of server-side exchange handlers. One handler is bound per
    /// in-flight RPC; an inbound request that finds the pool empty is
    /// rejected with a busy response.
    pub pool_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 4096,
            pool_capacity: 32,
        }
    }
}

impl TransportConfig {
    /// Create the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the connection buffer capacity.
    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    /// Set the exchange pool capacity.
    pub fn with_pool_capacity(mut self, capacity: usize) -> Self {
        self.pool_capacity = capacity;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), TransportError> {
        let min = HEADER_SIZE + MIN_PAYLOAD_CAPACITY;
        if self.buffer_capacity < min {
            return Err(TransportError::Configuration(format!(
                "buffer capacity {} below minimum {}",
                self.buffer_capacity, min
            )));
        }
        if self.pool_capacity == 0 {
            return Err(TransportError::Configuration(
                "pool capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
