//! Bounded output ring shared by the engine (producers) and one consumer.
//!
//! Storage is a fixed array of 64-bit words. Every reservation is prefixed by
//! a header word holding the payload length and BUSY/DISCARD flags. Producers
//! serialize only on cursor bookkeeping; payload writes and publication happen
//! outside the lock. The consumer follows the producer cursor and stops at the
//! first record that is still BUSY, so records are delivered in reservation
//! order.

pub mod record;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

const HEADER_BUSY: u64 = 1;
const HEADER_DISCARD: u64 = 1 << 1;
const HEADER_LEN_SHIFT: u32 = 2;

/// Errors returned by [`OutputChannel`].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelError {
    #[error("channel full: requested {requested} bytes, {free} free")]
    Full { requested: usize, free: usize },

    #[error("reservation of {requested} bytes exceeds the {max} byte maximum")]
    TooLarge { requested: usize, max: usize },

    #[error("zero-length reservation")]
    Empty,

    #[error("channel capacity must be a non-zero multiple of 8 bytes, got {0}")]
    InvalidCapacity(usize),
}

/// Fixed-capacity multi-producer, single-consumer record ring.
pub struct OutputChannel {
    words: Box<[AtomicU64]>,
    /// Word position of the next reservation; only advanced under `reserve_lock`.
    producer_pos: AtomicU64,
    /// Word position of the next record to consume.
    consumer_pos: AtomicU64,
    reserve_lock: Mutex<()>,
    consumer_taken: AtomicBool,
}

impl OutputChannel {
    /// Creates a ring of `capacity_bytes` (a non-zero multiple of 8, at least 16).
    pub fn new(capacity_bytes: usize) -> Result<Self, ChannelError> {
        if capacity_bytes < 16 || capacity_bytes % 8 != 0 {
            return Err(ChannelError::InvalidCapacity(capacity_bytes));
        }

        let words = (0..capacity_bytes / 8).map(|_| AtomicU64::new(0)).collect();

        Ok(Self {
            words,
            producer_pos: AtomicU64::new(0),
            consumer_pos: AtomicU64::new(0),
            reserve_lock: Mutex::new(()),
            consumer_taken: AtomicBool::new(false),
        })
    }

    pub fn capacity_bytes(&self) -> usize {
        self.words.len() * 8
    }

    /// Largest payload a single reservation may request.
    pub fn max_reservation_bytes(&self) -> usize {
        (self.words.len() - 1) * 8
    }

    /// Bytes held by reserved, published or discarded-but-unconsumed records.
    pub fn used_bytes(&self) -> usize {
        let prod = self.producer_pos.load(Ordering::Acquire);
        let cons = self.consumer_pos.load(Ordering::Acquire);
        (prod.saturating_sub(cons) as usize) * 8
    }

    /// Reserves `len` bytes (rounded up to whole words). All-or-nothing and
    /// never waits for space.
    pub fn reserve(&self, len: usize) -> Result<Reservation<'_>, ChannelError> {
        if len == 0 {
            return Err(ChannelError::Empty);
        }
        if len > self.max_reservation_bytes() {
            return Err(ChannelError::TooLarge {
                requested: len,
                max: self.max_reservation_bytes(),
            });
        }

        let payload_words = len.div_ceil(8);
        let total = payload_words as u64 + 1;
        let cap = self.words.len() as u64;

        let _guard = self.reserve_lock.lock();
        let prod = self.producer_pos.load(Ordering::Relaxed);
        let cons = self.consumer_pos.load(Ordering::Acquire);
        let used = prod - cons;
        if used + total > cap {
            return Err(ChannelError::Full {
                requested: len,
                free: ((cap - used) as usize) * 8,
            });
        }

        self.word(prod)
            .store(encode_header(payload_words, HEADER_BUSY), Ordering::Relaxed);
        self.producer_pos.store(prod + total, Ordering::Release);

        Ok(Reservation {
            channel: self,
            header_pos: prod,
            payload_words,
            committed: false,
        })
    }

    /// Claims the single consumer handle. Returns `None` once taken.
    pub fn consumer(self: &Arc<Self>) -> Option<ChannelConsumer> {
        if self.consumer_taken.swap(true, Ordering::AcqRel) {
            return None;
        }
        Some(ChannelConsumer {
            channel: Arc::clone(self),
            scratch: Vec::new(),
        })
    }

    #[inline]
    fn word(&self, pos: u64) -> &AtomicU64 {
        &self.words[(pos % self.words.len() as u64) as usize]
    }
}

#[inline]
fn encode_header(payload_words: usize, flags: u64) -> u64 {
    ((payload_words as u64) << HEADER_LEN_SHIFT) | flags
}

/// Reserved channel space. Submit to publish; dropping discards.
pub struct Reservation<'a> {
    channel: &'a OutputChannel,
    header_pos: u64,
    payload_words: usize,
    committed: bool,
}

impl Reservation<'_> {
    pub fn len_words(&self) -> usize {
        self.payload_words
    }

    pub fn len_bytes(&self) -> usize {
        self.payload_words * 8
    }

    /// Writes one payload word. Out-of-range indices are ignored.
    #[inline]
    pub fn write(&mut self, index: usize, value: u64) {
        if index < self.payload_words {
            self.channel
                .word(self.header_pos + 1 + index as u64)
                .store(value, Ordering::Relaxed);
        }
    }

    /// Writes consecutive words starting at `offset`.
    #[inline]
    pub fn write_words(&mut self, offset: usize, values: &[u64]) {
        for (i, &v) in values.iter().enumerate() {
            self.write(offset + i, v);
        }
    }

    /// Sets every payload word from `offset` onward to `value`.
    pub fn fill_from(&mut self, offset: usize, value: u64) {
        for i in offset..self.payload_words {
            self.write(i, value);
        }
    }

    /// Publishes the record to the consumer.
    pub fn submit(mut self) {
        self.commit(0);
    }

    /// Releases the space without publishing.
    pub fn discard(mut self) {
        self.commit(HEADER_DISCARD);
    }

    fn commit(&mut self, flags: u64) {
        self.committed = true;
        self.channel
            .word(self.header_pos)
            .store(encode_header(self.payload_words, flags), Ordering::Release);
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.commit(HEADER_DISCARD);
        }
    }
}

/// The single reader of an [`OutputChannel`].
pub struct ChannelConsumer {
    channel: Arc<OutputChannel>,
    scratch: Vec<u64>,
}

impl ChannelConsumer {
    /// Delivers every published record in order and returns how many were
    /// delivered. Stops at the first record still being written.
    pub fn consume(&mut self, mut f: impl FnMut(&[u64])) -> usize {
        let ch = &*self.channel;
        let mut delivered = 0;

        loop {
            let cons = ch.consumer_pos.load(Ordering::Relaxed);
            let prod = ch.producer_pos.load(Ordering::Acquire);
            if cons == prod {
                break;
            }

            let header = ch.word(cons).load(Ordering::Acquire);
            if header & HEADER_BUSY != 0 {
                break;
            }

            let len = (header >> HEADER_LEN_SHIFT) as usize;
            if header & HEADER_DISCARD == 0 {
                self.scratch.clear();
                self.scratch
                    .extend((0..len as u64).map(|i| ch.word(cons + 1 + i).load(Ordering::Relaxed)));
                f(&self.scratch);
                delivered += 1;
            }

            ch.consumer_pos.store(cons + 1 + len as u64, Ordering::Release);
        }

        delivered
    }

    pub fn channel(&self) -> &Arc<OutputChannel> {
        &self.channel
    }
}
