//! Fixed output record layouts.
//!
//! Every field is a `u64` stored as one little-endian word, so records can be
//! written straight into channel words and decoded back from either words or
//! bytes.

use crate::tracer::event::{GroupKey, SyscallEvent};

/// Words in one [`RawRecord`].
pub const RAW_RECORD_WORDS: usize = 4;
/// Bytes in one [`RawRecord`].
pub const RAW_RECORD_SIZE: usize = RAW_RECORD_WORDS * 8;

/// Words in one [`AggregatedRecord`].
pub const AGGREGATED_RECORD_WORDS: usize = 7;
/// Bytes in one [`AggregatedRecord`].
pub const AGGREGATED_RECORD_SIZE: usize = AGGREGATED_RECORD_WORDS * 8;

/// One event copied verbatim (pass-through mode).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RawRecord {
    pub time: u64,
    pub handle: u64,
    pub context: u64,
    pub value: u64,
}

impl RawRecord {
    pub fn to_words(&self) -> [u64; RAW_RECORD_WORDS] {
        [self.time, self.handle, self.context, self.value]
    }

    /// Decodes the first record from `words`.
    pub fn from_words(words: &[u64]) -> Option<Self> {
        match words {
            [time, handle, context, value, ..] => Some(Self {
                time: *time,
                handle: *handle,
                context: *context,
                value: *value,
            }),
            _ => None,
        }
    }
}

impl From<&SyscallEvent> for RawRecord {
    fn from(ev: &SyscallEvent) -> Self {
        Self {
            time: ev.timestamp_ns,
            handle: ev.handle,
            context: ev.context,
            value: ev.value,
        }
    }
}

/// One group's summary for a closed window.
///
/// Fields the configuration did not request are zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AggregatedRecord {
    pub handle: u64,
    pub context: u64,
    pub count: u64,
    pub sum: u64,
    pub average: u64,
    pub min: u64,
    pub max: u64,
}

impl AggregatedRecord {
    pub fn key(&self) -> GroupKey {
        GroupKey::new(self.handle, self.context)
    }

    pub fn to_words(&self) -> [u64; AGGREGATED_RECORD_WORDS] {
        [
            self.handle,
            self.context,
            self.count,
            self.sum,
            self.average,
            self.min,
            self.max,
        ]
    }

    /// Decodes the first record from `words`.
    pub fn from_words(words: &[u64]) -> Option<Self> {
        let w: &[u64; AGGREGATED_RECORD_WORDS] = words.get(..AGGREGATED_RECORD_WORDS)?.try_into().ok()?;
        Some(Self {
            handle: w[0],
            context: w[1],
            count: w[2],
            sum: w[3],
            average: w[4],
            min: w[5],
            max: w[6],
        })
    }

    /// Decodes the first record from little-endian bytes.
    pub fn from_le_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < AGGREGATED_RECORD_SIZE {
            return None;
        }
        let mut words = [0u64; AGGREGATED_RECORD_WORDS];
        for (word, chunk) in words.iter_mut().zip(data.chunks_exact(8)) {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(chunk);
            *word = u64::from_le_bytes(buf);
        }
        Self::from_words(&words)
    }

    pub fn to_le_bytes(&self) -> [u8; AGGREGATED_RECORD_SIZE] {
        let mut out = [0u8; AGGREGATED_RECORD_SIZE];
        for (chunk, word) in out.chunks_exact_mut(8).zip(self.to_words()) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        out
    }
}

/// Which record layout a channel carries; fixed by the engine mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordLayout {
    Aggregated,
    Raw,
    CounterBatch,
}

/// Iterates whole aggregated records in a published payload.
pub fn aggregated_records(words: &[u64]) -> impl Iterator<Item = AggregatedRecord> + '_ {
    words
        .chunks_exact(AGGREGATED_RECORD_WORDS)
        .filter_map(AggregatedRecord::from_words)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregated_layout() {
        let rec = AggregatedRecord {
            handle: 3,
            context: 0,
            count: 3,
            sum: 30,
            average: 10,
            min: 10,
            max: 10,
        };
        let bytes = rec.to_le_bytes();
        assert_eq!(bytes.len(), 56);
        assert_eq!(&bytes[0..8], &3u64.to_le_bytes());
        assert_eq!(&bytes[16..24], &3u64.to_le_bytes());
        assert_eq!(&bytes[24..32], &30u64.to_le_bytes());
        assert_eq!(&bytes[32..40], &10u64.to_le_bytes());
        assert_eq!(AggregatedRecord::from_le_bytes(&bytes), Some(rec));
    }

    #[test]
    fn test_from_words_too_short() {
        assert_eq!(AggregatedRecord::from_words(&[1, 2, 3]), None);
        assert_eq!(RawRecord::from_words(&[1, 2, 3]), None);
        assert_eq!(AggregatedRecord::from_le_bytes(&[0u8; 55]), None);
    }

    #[test]
    fn test_raw_from_event() {
        let ev = SyscallEvent::new(100, 5, 1, 4096);
        let rec = RawRecord::from(&ev);
        assert_eq!(rec.to_words(), [100, 5, 1, 4096]);
        assert_eq!(RawRecord::from_words(&rec.to_words()), Some(rec));
    }

    #[test]
    fn test_aggregated_records_ignores_partial_tail() {
        let mut words = Vec::new();
        words.extend_from_slice(&AggregatedRecord { handle: 1, count: 1, ..Default::default() }.to_words());
        words.extend_from_slice(&AggregatedRecord { handle: 2, count: 4, ..Default::default() }.to_words());
        words.extend_from_slice(&[9, 9]);

        let recs: Vec<_> = aggregated_records(&words).collect();
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[1].key(), GroupKey::new(2, 0));
        assert_eq!(recs[1].count, 4);
    }
}
