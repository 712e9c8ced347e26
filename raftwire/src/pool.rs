//! Bounded pool of reusable server-side exchange handlers.
//!
//! The pool is an arena of handler slots with an atomic free bitmap: renting
//! claims a bit with a compare-and-swap, releasing resets the handler and
//! sets the bit back. Any free handler serves any request, and a handler
//! still completing a previous request can never be handed out because its
//! bit stays claimed until [`RentedExchange`] drops.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::exchange::{Exchange, ServerExchange};
use crate::member::LocalMember;

const BITS_PER_WORD: usize = 64;

/// Shared pool of [`ServerExchange`] handlers.
pub struct ExchangePool {
    slots: Box<[Mutex<Option<ServerExchange>>]>,
    free: Box<[AtomicU64]>,
    capacity: usize,
}

impl ExchangePool {
    /// Create a pool of `capacity` handlers, each bound to `member`.
    pub fn new(capacity: usize, member: Arc<dyn LocalMember>) -> Arc<Self> {
        let slots = (0..capacity)
            .map(|_| Mutex::new(Some(ServerExchange::new(Arc::clone(&member)))))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let words = capacity.div_ceil(BITS_PER_WORD);
        let free = (0..words)
            .map(|word| {
                let base = word * BITS_PER_WORD;
                let bits = capacity.saturating_sub(base).min(BITS_PER_WORD);
                let mask = if bits == BITS_PER_WORD {
                    u64::MAX
                } else {
                    (1u64 << bits) - 1
                };
                AtomicU64::new(mask)
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Arc::new(Self {
            slots,
            free,
            capacity,
        })
    }

    /// Rent a free handler bound to `peer`, or `None` when the pool is
    /// exhausted (a backpressure signal, not a failure).
    pub fn try_rent(self: &Arc<Self>, peer: &str) -> Option<RentedExchange> {
        for (word_index, word) in self.free.iter().enumerate() {
            loop {
                let current = word.load(Ordering::Acquire);
                if current == 0 {
                    break;
                }
                let bit = current.trailing_zeros() as usize;
                let mask = 1u64 << bit;
                if word
                    .compare_exchange(
                        current,
                        current & !mask,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_err()
                {
                    continue;
                }
                let index = word_index * BITS_PER_WORD + bit;
                let taken = self.slots[index]
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take();
                match taken {
                    Some(mut exchange) => {
                        exchange.begin(peer);
                        return Some(RentedExchange {
                            pool: Arc::clone(self),
                            index,
                            exchange: Some(exchange),
                        });
                    }
                    None => {
                        // Slot/bitmap disagreement; leave the bit claimed so
                        // the slot is quarantined rather than double-rented.
                        tracing::error!(index, "exchange pool slot empty while marked free");
                        break;
                    }
                }
            }
        }
        None
    }

    /// Total number of handler slots.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of handlers currently available for rent.
    pub fn available(&self) -> usize {
        self.free
            .iter()
            .map(|word| word.load(Ordering::Acquire).count_ones() as usize)
            .sum()
    }

    fn release(&self, index: usize, mut exchange: ServerExchange) {
        exchange.reset();
        *self.slots[index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(exchange);
        let mask = 1u64 << (index % BITS_PER_WORD);
        self.free[index / BITS_PER_WORD].fetch_or(mask, Ordering::Release);
    }
}

impl std::fmt::Debug for ExchangePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangePool")
            .field("capacity", &self.capacity)
            .field("available", &self.available())
            .finish()
    }
}

/// A handler rented from the pool, released (and reset) on drop.
///
/// Holding release in `Drop` is what guarantees the pool invariant on every
/// exit path, faulted exchanges included.
pub struct RentedExchange {
    pool: Arc<ExchangePool>,
    index: usize,
    exchange: Option<ServerExchange>,
}

impl Deref for RentedExchange {
    type Target = ServerExchange;

    fn deref(&self) -> &ServerExchange {
        self.exchange
            .as_ref()
            .expect("rented exchange accessed after release")
    }
}

impl DerefMut for RentedExchange {
    fn deref_mut(&mut self) -> &mut ServerExchange {
        self.exchange
            .as_mut()
            .expect("rented exchange accessed after release")
    }
}

impl Drop for RentedExchange {
    fn drop(&mut self) {
        if let Some(exchange) = self.exchange.take() {
            self.pool.release(self.index, exchange);
        }
    }
}
