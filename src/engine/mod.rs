//! Windowed group-by aggregation engine.
//!
//! [`AggregationEngine`] owns the window controller, the aggregation table,
//! a handle to the output channel, and its stats. It is `Sync` and meant to
//! be shared behind an `Arc` by every execution context; each event is
//! processed to completion by one synchronous [`AggregationEngine::process`]
//! call that never takes a lock and never allocates. An update only spins
//! while the flush is resetting that same group.

pub mod aggregate;
pub mod emit;
pub mod error;
pub mod table;
pub mod window;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::channel::record::{RawRecord, RecordLayout, RAW_RECORD_SIZE};
use crate::channel::OutputChannel;
use crate::tracer::event::SyscallEvent;
use crate::tracer::stats::{EngineStats, Outcome};

use self::aggregate::AggregateFields;
use self::emit::FlushReport;
use self::table::AggregationTable;
use self::window::{WindowController, WindowPolicy};

/// How events reach the output channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EngineMode {
    /// Windowed group-by aggregation.
    #[default]
    Aggregated,
    /// One raw record per event.
    PassThrough,
    /// Emit one `count`-word record every `threshold` events.
    GlobalCounter { threshold: u64 },
}

impl EngineMode {
    pub fn record_layout(&self) -> RecordLayout {
        match self {
            Self::Aggregated => RecordLayout::Aggregated,
            Self::PassThrough => RecordLayout::Raw,
            Self::GlobalCounter { .. } => RecordLayout::CounterBatch,
        }
    }
}

/// Engine construction parameters.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub mode: EngineMode,
    pub window: WindowPolicy,
    pub table_capacity: usize,
    pub max_records_per_flush: usize,
    pub fields: AggregateFields,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mode: EngineMode::Aggregated,
            window: WindowPolicy::Time {
                interval_ns: 1_000_000_000,
            },
            table_capacity: 16_384,
            max_records_per_flush: 74_898,
            fields: AggregateFields::all(),
        }
    }
}

pub struct AggregationEngine {
    mode: EngineMode,
    window: WindowController,
    table: AggregationTable,
    channel: Arc<OutputChannel>,
    fields: AggregateFields,
    max_records_per_flush: usize,
    flush_lock: Mutex<()>,
    batch_counter: AtomicU64,
    stats: EngineStats,
}

impl AggregationEngine {
    pub fn new(cfg: &EngineConfig, channel: Arc<OutputChannel>) -> Self {
        Self {
            mode: cfg.mode,
            window: WindowController::new(cfg.window),
            table: AggregationTable::new(cfg.table_capacity),
            channel,
            fields: cfg.fields,
            max_records_per_flush: cfg.max_records_per_flush,
            flush_lock: Mutex::new(()),
            batch_counter: AtomicU64::new(0),
            stats: EngineStats::new(),
        }
    }

    pub fn mode(&self) -> EngineMode {
        self.mode
    }

    pub fn window(&self) -> &WindowController {
        &self.window
    }

    pub fn table(&self) -> &AggregationTable {
        &self.table
    }

    pub fn channel(&self) -> &Arc<OutputChannel> {
        &self.channel
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// Processes one event to completion.
    ///
    /// Never fails: drops and degraded flushes are logged and counted.
    #[inline]
    pub fn process(&self, event: &SyscallEvent) {
        self.stats.record(Outcome::EventProcessed);

        match self.mode {
            EngineMode::Aggregated => self.process_aggregated(event),
            EngineMode::PassThrough => self.process_pass_through(event),
            EngineMode::GlobalCounter { threshold } => self.process_global_counter(threshold),
        }
    }

    /// Flushes the current window now, regardless of the policy, and starts
    /// the next window at `trigger_time`. Returns `None` when another context
    /// is mid-flush.
    pub fn force_flush(&self, trigger_time: u64) -> Option<FlushReport> {
        let _guard = self.flush_lock.try_lock()?;
        Some(self.flush_locked(trigger_time))
    }

    fn process_aggregated(&self, event: &SyscallEvent) {
        let generation = self.window.generation();
        if self.window.advance(event.timestamp_ns) {
            self.tumble(generation, event.timestamp_ns);
        }

        if let Err(err) = self.table.upsert(event.key(), event.value) {
            self.stats.record(Outcome::UpsertRejected);
            debug!(error = %err, "dropped update");
        }
    }

    fn tumble(&self, generation: u64, trigger_time: u64) {
        let Some(_guard) = self.flush_lock.try_lock() else {
            self.stats.record(Outcome::FlushSkipped);
            return;
        };

        // Another context closed this window while we raced for the lock.
        if self.window.generation() != generation {
            return;
        }

        self.flush_locked(trigger_time);
    }

    fn flush_locked(&self, trigger_time: u64) -> FlushReport {
        let report = emit::flush_window(
            &self.table,
            &self.window,
            &self.channel,
            self.fields,
            self.max_records_per_flush,
            trigger_time,
        );

        self.stats.record(Outcome::Flush);
        self.stats.record_n(Outcome::RecordsEmitted, report.emitted as u64);
        if report.truncated {
            self.stats.record(Outcome::FlushTruncated);
        }
        if report.reserve_failed {
            self.stats.record(Outcome::FlushReserveFailed);
        }
        if report.invalid_context {
            self.stats.record(Outcome::InvalidContext);
        }

        report
    }

    fn process_pass_through(&self, event: &SyscallEvent) {
        match self.channel.reserve(RAW_RECORD_SIZE) {
            Ok(mut reservation) => {
                reservation.write_words(0, &RawRecord::from(event).to_words());
                reservation.submit();
                self.stats.record(Outcome::RawEmitted);
            }
            Err(err) => {
                self.stats.record(Outcome::RawDropped);
                debug!(error = %err, "dropped raw event");
            }
        }
    }

    fn process_global_counter(&self, threshold: u64) {
        let count = self.batch_counter.fetch_add(1, Ordering::AcqRel) + 1;
        if count < threshold {
            return;
        }

        // Whoever resets the counter owns the batch.
        if self
            .batch_counter
            .compare_exchange(count, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let len = usize::try_from(count).unwrap_or(usize::MAX).saturating_mul(8);
        match self.channel.reserve(len) {
            Ok(mut reservation) => {
                reservation.write(0, count);
                reservation.fill_from(1, 0);
                reservation.submit();
                self.stats.record(Outcome::CounterBatchEmitted);
            }
            Err(err) => {
                self.stats.record(Outcome::CounterBatchDropped);
                debug!(error = %err, count, "dropped counter batch");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::record::{aggregated_records, AggregatedRecord};

    fn engine(cfg: EngineConfig, channel_bytes: usize) -> AggregationEngine {
        let channel = Arc::new(OutputChannel::new(channel_bytes).expect("channel"));
        AggregationEngine::new(&cfg, channel)
    }

    fn time_config(interval_ns: u64) -> EngineConfig {
        EngineConfig {
            window: WindowPolicy::Time { interval_ns },
            ..EngineConfig::default()
        }
    }

    fn drain_aggregated(engine: &AggregationEngine) -> Vec<Vec<AggregatedRecord>> {
        let mut consumer = engine.channel().consumer().expect("consumer");
        let mut out = Vec::new();
        consumer.consume(|words| out.push(aggregated_records(words).collect()));
        out
    }

    #[test]
    fn test_aggregated_flush_on_tumble() {
        let engine = engine(time_config(1000), 4096);
        for t in [0, 200, 400] {
            engine.process(&SyscallEvent::new(t, 3, 0, 10));
        }
        assert_eq!(engine.stats().get(Outcome::Flush), 0);

        engine.process(&SyscallEvent::new(1100, 3, 0, 10));
        assert_eq!(engine.stats().get(Outcome::Flush), 1);
        assert_eq!(engine.window().start_time(), Some(1100));

        let batches = drain_aggregated(&engine);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0][0].count, 3);
        assert_eq!(batches[0][0].sum, 30);
        assert_eq!(batches[0][0].average, 10);

        // The triggering event opened the next window.
        assert_eq!(engine.table().count_live(), 1);
    }

    #[test]
    fn test_force_flush() {
        let engine = engine(time_config(1_000_000), 4096);
        engine.process(&SyscallEvent::new(0, 1, 0, 1));

        let report = engine.force_flush(50).expect("flush");
        assert_eq!(report.emitted, 1);
        assert_eq!(engine.table().count_live(), 0);
        assert_eq!(engine.window().start_time(), Some(50));
    }

    #[test]
    fn test_pass_through() {
        let cfg = EngineConfig {
            mode: EngineMode::PassThrough,
            ..EngineConfig::default()
        };
        // Room for exactly one 32-byte record plus header.
        let engine = engine(cfg, 40);
        let mut consumer = engine.channel().consumer().expect("consumer");

        engine.process(&SyscallEvent::new(1, 2, 3, 4));
        engine.process(&SyscallEvent::new(5, 6, 7, 8));
        assert_eq!(engine.stats().get(Outcome::RawEmitted), 1);
        assert_eq!(engine.stats().get(Outcome::RawDropped), 1);

        let mut raw = Vec::new();
        consumer.consume(|words| raw.extend(RawRecord::from_words(words)));
        assert_eq!(
            raw,
            vec![RawRecord {
                time: 1,
                handle: 2,
                context: 3,
                value: 4
            }]
        );
    }

    #[test]
    fn test_global_counter() {
        let cfg = EngineConfig {
            mode: EngineMode::GlobalCounter { threshold: 4 },
            ..EngineConfig::default()
        };
        let engine = engine(cfg, 4096);
        let mut consumer = engine.channel().consumer().expect("consumer");

        for t in 0..9 {
            engine.process(&SyscallEvent::new(t, 0, 0, 0));
        }

        let mut batches = Vec::new();
        consumer.consume(|words| batches.push(words.to_vec()));
        assert_eq!(batches, vec![vec![4, 0, 0, 0], vec![4, 0, 0, 0]]);
        assert_eq!(engine.stats().get(Outcome::CounterBatchEmitted), 2);
    }

    #[test]
    fn test_upsert_rejections_are_counted() {
        let cfg = EngineConfig {
            table_capacity: 1,
            ..time_config(1000)
        };
        let engine = engine(cfg, 4096);
        engine.process(&SyscallEvent::new(0, 1, 0, 1));
        engine.process(&SyscallEvent::new(1, 2, 0, 1));

        assert_eq!(engine.stats().get(Outcome::UpsertRejected), 1);
        assert_eq!(engine.stats().get(Outcome::EventProcessed), 2);
    }

    #[test]
    fn test_mode_layout() {
        assert_eq!(EngineMode::default().record_layout(), RecordLayout::Aggregated);
        assert_eq!(
            EngineMode::GlobalCounter { threshold: 1 }.record_layout(),
            RecordLayout::CounterBatch
        );
    }
}
