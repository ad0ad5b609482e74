//! User-space aggregation of pass-through records.
//!
//! Groups raw records by `(handle, context)` into tumbling windows on the
//! record timestamps, the same count/sum/average/min/max the engine computes
//! in place. Serves as a baseline against the in-engine aggregation.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::{debug, info};

use super::{OutputBatch, Sink};
use crate::channel::record::{AggregatedRecord, RawRecord};
use crate::engine::aggregate::{AccumulatorSnapshot, AggregateFunction};
use crate::tracer::event::GroupKey;

pub struct RawWindowSink {
    interval_ns: u64,
    start: Option<u64>,
    groups: BTreeMap<GroupKey, AccumulatorSnapshot>,
    closed: Vec<AggregatedRecord>,
    windows: u64,
    records: u64,
}

impl RawWindowSink {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval_ns: u64::try_from(interval.as_nanos()).unwrap_or(u64::MAX),
            start: None,
            groups: BTreeMap::new(),
            closed: Vec::new(),
            windows: 0,
            records: 0,
        }
    }

    /// Windows closed so far.
    pub fn windows(&self) -> u64 {
        self.windows
    }

    /// Raw records folded in so far.
    pub fn records(&self) -> u64 {
        self.records
    }

    /// Groups of the most recently closed window, in key order.
    pub fn last_window(&self) -> &[AggregatedRecord] {
        &self.closed
    }

    /// Groups in the window still open.
    pub fn open_groups(&self) -> usize {
        self.groups.len()
    }

    fn observe(&mut self, record: &RawRecord) {
        let start = *self.start.get_or_insert(record.time);
        if record.time.saturating_sub(start) >= self.interval_ns {
            self.close();
            self.start = Some(record.time);
        }

        self.groups
            .entry(GroupKey::new(record.handle, record.context))
            .or_default()
            .fold(record.value);
        self.records += 1;
    }

    fn close(&mut self) {
        if self.groups.is_empty() {
            return;
        }

        self.windows += 1;
        self.closed.clear();
        self.closed
            .extend(self.groups.iter().map(|(key, acc)| AggregatedRecord {
                handle: key.handle,
                context: key.context,
                count: acc.count,
                sum: acc.sum,
                average: acc.state(AggregateFunction::Average).value(),
                min: acc.min,
                max: acc.max,
            }));
        self.groups.clear();

        let events: u64 = self.closed.iter().map(|r| r.count).sum();
        info!(
            window = self.windows,
            start = self.start.unwrap_or(0),
            groups = self.closed.len(),
            events,
            "raw window closed"
        );
    }
}

impl Sink for RawWindowSink {
    fn name(&self) -> &str {
        "raw_window"
    }

    fn handle_batch(&mut self, batch: &OutputBatch<'_>) {
        match batch {
            OutputBatch::Raw(record) => self.observe(record),
            other => debug!(rows = other.rows(), "raw window sink ignores non-raw batch"),
        }
    }

    fn finish(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(time: u64, handle: u64, context: u64, value: u64) -> RawRecord {
        RawRecord {
            time,
            handle,
            context,
            value,
        }
    }

    fn feed(sink: &mut RawWindowSink, records: &[RawRecord]) {
        for r in records {
            sink.handle_batch(&OutputBatch::Raw(*r));
        }
    }

    #[test]
    fn test_groups_by_key_within_window() {
        let mut sink = RawWindowSink::new(Duration::from_nanos(1000));
        feed(
            &mut sink,
            &[
                raw(0, 3, 0, 10),
                raw(200, 3, 0, 30),
                raw(400, 1, 2, 5),
                raw(500, 3, 0, 20),
            ],
        );
        assert_eq!(sink.windows(), 0);
        assert_eq!(sink.open_groups(), 2);

        // Closes [0, 1000) and opens the next window.
        feed(&mut sink, &[raw(1100, 3, 0, 1)]);
        assert_eq!(sink.windows(), 1);
        assert_eq!(
            sink.last_window(),
            &[
                AggregatedRecord {
                    handle: 1,
                    context: 2,
                    count: 1,
                    sum: 5,
                    average: 5,
                    min: 5,
                    max: 5,
                },
                AggregatedRecord {
                    handle: 3,
                    context: 0,
                    count: 3,
                    sum: 60,
                    average: 20,
                    min: 10,
                    max: 30,
                },
            ]
        );
        assert_eq!(sink.open_groups(), 1);
        assert_eq!(sink.records(), 5);
    }

    #[test]
    fn test_finish_closes_open_window() {
        let mut sink = RawWindowSink::new(Duration::from_secs(1));
        feed(&mut sink, &[raw(5, 1, 0, 0), raw(6, 1, 0, 4)]);

        sink.finish();
        assert_eq!(sink.windows(), 1);
        assert_eq!(sink.last_window()[0].count, 2);
        assert_eq!(sink.last_window()[0].min, 0);

        // Nothing open: a second finish is a no-op.
        sink.finish();
        assert_eq!(sink.windows(), 1);
    }

    #[test]
    fn test_ignores_other_layouts() {
        let mut sink = RawWindowSink::new(Duration::from_secs(1));
        sink.handle_batch(&OutputBatch::CounterBatch { count: 7 });
        sink.handle_batch(&OutputBatch::Aggregated(&[]));
        sink.finish();
        assert_eq!(sink.records(), 0);
        assert_eq!(sink.windows(), 0);
    }
}
