use std::sync::atomic::{AtomicU64, Ordering};

/// Per-event and per-flush outcomes counted by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Outcome {
    EventProcessed = 0,
    UpsertRejected = 1,
    Flush = 2,
    FlushSkipped = 3,
    FlushReserveFailed = 4,
    FlushTruncated = 5,
    RecordsEmitted = 6,
    InvalidContext = 7,
    RawEmitted = 8,
    RawDropped = 9,
    CounterBatchEmitted = 10,
    CounterBatchDropped = 11,
}

/// Highest `Outcome` discriminant.
pub const MAX_OUTCOME: usize = Outcome::CounterBatchDropped as usize;

impl Outcome {
    pub const ALL: [Outcome; MAX_OUTCOME + 1] = [
        Outcome::EventProcessed,
        Outcome::UpsertRejected,
        Outcome::Flush,
        Outcome::FlushSkipped,
        Outcome::FlushReserveFailed,
        Outcome::FlushTruncated,
        Outcome::RecordsEmitted,
        Outcome::InvalidContext,
        Outcome::RawEmitted,
        Outcome::RawDropped,
        Outcome::CounterBatchEmitted,
        Outcome::CounterBatchDropped,
    ];

    /// Stable snake_case name used in logs and metric names.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::EventProcessed => "events_processed",
            Self::UpsertRejected => "upserts_rejected",
            Self::Flush => "flushes",
            Self::FlushSkipped => "flushes_skipped",
            Self::FlushReserveFailed => "flush_reserve_failures",
            Self::FlushTruncated => "flush_truncations",
            Self::RecordsEmitted => "records_emitted",
            Self::InvalidContext => "invalid_context",
            Self::RawEmitted => "raw_records_emitted",
            Self::RawDropped => "raw_records_dropped",
            Self::CounterBatchEmitted => "counter_batches_emitted",
            Self::CounterBatchDropped => "counter_batches_dropped",
        }
    }
}

/// Lock-free per-outcome counters.
///
/// `snapshot()` atomically reads and resets all counters, making it
/// suitable for periodic reporting without contention.
pub struct EngineStats {
    counts: [AtomicU64; MAX_OUTCOME + 1],
}

impl EngineStats {
    pub fn new() -> Self {
        Self {
            counts: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    /// Increment the counter for the given outcome by one.
    #[inline]
    pub fn record(&self, outcome: Outcome) {
        self.counts[outcome as usize].fetch_add(1, Ordering::Relaxed);
    }

    /// Increment the counter for the given outcome by n.
    #[inline]
    pub fn record_n(&self, outcome: Outcome, n: u64) {
        if n > 0 {
            self.counts[outcome as usize].fetch_add(n, Ordering::Relaxed);
        }
    }

    /// Current value without resetting.
    pub fn get(&self, outcome: Outcome) -> u64 {
        self.counts[outcome as usize].load(Ordering::Relaxed)
    }

    /// Atomically read and reset all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            counts: std::array::from_fn(|i| self.counts[i].swap(0, Ordering::Relaxed)),
        }
    }
}

impl Default for EngineStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Counter values taken by [`EngineStats::snapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    counts: [u64; MAX_OUTCOME + 1],
}

impl StatsSnapshot {
    pub fn get(&self, outcome: Outcome) -> u64 {
        self.counts[outcome as usize]
    }

    pub fn is_empty(&self) -> bool {
        self.counts.iter().all(|&v| v == 0)
    }

    /// Non-zero counters in discriminant order.
    pub fn non_zero(&self) -> impl Iterator<Item = (Outcome, u64)> + '_ {
        Outcome::ALL
            .iter()
            .map(|&o| (o, self.get(o)))
            .filter(|&(_, v)| v > 0)
    }
}
