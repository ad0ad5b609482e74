//! Output channel consumer and the sinks it feeds.
//!
//! [`ChannelDrainer`] owns the single [`ChannelConsumer`], decodes every
//! published record according to the engine's [`RecordLayout`], and hands the
//! decoded batch to each sink in turn.

pub mod log;
pub mod raw;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::channel::record::{
    aggregated_records, AggregatedRecord, RawRecord, RecordLayout, AGGREGATED_RECORD_WORDS,
    RAW_RECORD_WORDS,
};
use crate::channel::ChannelConsumer;
use crate::export::health::HealthMetrics;

/// One decoded channel record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputBatch<'a> {
    /// A closed window's groups.
    Aggregated(&'a [AggregatedRecord]),
    /// One event copied verbatim.
    Raw(RawRecord),
    /// A global-counter batch of `count` events.
    CounterBatch { count: u64 },
}

impl OutputBatch<'_> {
    /// Rows carried by this batch.
    pub fn rows(&self) -> usize {
        match self {
            Self::Aggregated(records) => records.len(),
            Self::Raw(_) | Self::CounterBatch { .. } => 1,
        }
    }
}

/// Sink receives decoded output batches.
pub trait Sink: Send {
    /// Returns the sink's name for logging.
    fn name(&self) -> &str;

    /// Process one decoded batch.
    fn handle_batch(&mut self, batch: &OutputBatch<'_>);

    /// Called once after the final drain.
    fn finish(&mut self) {}
}

/// Totals from one [`ChannelDrainer::drain_once`] pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrainStats {
    pub batches: usize,
    pub rows: usize,
}

/// Drains the output channel into sinks.
pub struct ChannelDrainer {
    consumer: ChannelConsumer,
    layout: RecordLayout,
    sinks: Vec<Box<dyn Sink>>,
    health: Option<Arc<HealthMetrics>>,
    records: Vec<AggregatedRecord>,
}

impl ChannelDrainer {
    pub fn new(consumer: ChannelConsumer, layout: RecordLayout) -> Self {
        Self {
            consumer,
            layout,
            sinks: Vec::new(),
            health: None,
            records: Vec::new(),
        }
    }

    /// Report consumed batches to the health metrics.
    pub fn with_health(mut self, health: Arc<HealthMetrics>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn add_sink(&mut self, sink: Box<dyn Sink>) {
        info!(sink = sink.name(), "sink registered");
        self.sinks.push(sink);
    }

    /// Delivers everything currently published.
    pub fn drain_once(&mut self) -> DrainStats {
        let Self {
            consumer,
            layout,
            sinks,
            health,
            records,
        } = self;
        let mut stats = DrainStats::default();

        consumer.consume(|words| {
            let batch = match decode(*layout, words, records) {
                Some(batch) => batch,
                None => {
                    debug!(words = words.len(), ?layout, "skipping undecodable record");
                    return;
                }
            };

            let rows = batch.rows();
            for sink in sinks.iter_mut() {
                sink.handle_batch(&batch);
            }

            if let Some(health) = health {
                health.batches_consumed.inc();
                health.rows_consumed.inc_by(rows as f64);
                health.batch_rows.observe(rows as f64);
            }

            stats.batches += 1;
            stats.rows += rows;
        });

        if let Some(health) = &self.health {
            health
                .channel_used_bytes
                .set(self.consumer.channel().used_bytes() as f64);
        }

        stats
    }

    /// Drains every `poll_interval` until `ctx` is cancelled, then drains once
    /// more so records published before shutdown are not lost.
    pub async fn run(mut self, ctx: CancellationToken, poll_interval: Duration) {
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ctx.cancelled() => break,
                _ = ticker.tick() => {
                    let stats = self.drain_once();
                    if stats.batches > 0 {
                        debug!(batches = stats.batches, rows = stats.rows, "drained output channel");
                    }
                }
            }
        }

        let stats = self.drain_once();
        for sink in &mut self.sinks {
            sink.finish();
            debug!(sink = sink.name(), "sink finished");
        }
        info!(
            batches = stats.batches,
            rows = stats.rows,
            "output consumer stopped after final drain"
        );
    }
}

/// Decodes one published record; `records` is reused scratch space.
///
/// All-zero aggregated rows are padding from a flush that wrote fewer groups
/// than it reserved and are dropped.
fn decode<'a>(
    layout: RecordLayout,
    words: &[u64],
    records: &'a mut Vec<AggregatedRecord>,
) -> Option<OutputBatch<'a>> {
    match layout {
        RecordLayout::Aggregated => {
            if words.is_empty() || words.len() % AGGREGATED_RECORD_WORDS != 0 {
                return None;
            }
            records.clear();
            records.extend(aggregated_records(words).filter(|r| *r != AggregatedRecord::default()));
            Some(OutputBatch::Aggregated(records.as_slice()))
        }
        RecordLayout::Raw => {
            if words.len() != RAW_RECORD_WORDS {
                return None;
            }
            RawRecord::from_words(words).map(OutputBatch::Raw)
        }
        RecordLayout::CounterBatch => words
            .first()
            .map(|&count| OutputBatch::CounterBatch { count }),
    }
}
