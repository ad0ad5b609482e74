use tracing::{debug, info};

use super::{OutputBatch, Sink};

/// Renders output batches through `tracing`.
///
/// Each closed window logs one summary line; individual groups go to debug
/// unless `log_records` promotes them to info.
pub struct LogSink {
    log_records: bool,
    windows: u64,
}

impl LogSink {
    pub fn new(log_records: bool) -> Self {
        Self {
            log_records,
            windows: 0,
        }
    }

    /// Aggregated windows rendered so far.
    pub fn windows(&self) -> u64 {
        self.windows
    }
}

impl Sink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    fn handle_batch(&mut self, batch: &OutputBatch<'_>) {
        match batch {
            OutputBatch::Aggregated(records) => {
                self.windows += 1;
                let events: u64 = records.iter().map(|r| r.count).fold(0, u64::wrapping_add);
                info!(
                    window = self.windows,
                    groups = records.len(),
                    events,
                    "window closed"
                );

                for r in records.iter() {
                    if self.log_records {
                        info!(
                            handle = r.handle,
                            context = r.context,
                            count = r.count,
                            sum = r.sum,
                            average = r.average,
                            min = r.min,
                            max = r.max,
                            "group"
                        );
                    } else {
                        debug!(
                            handle = r.handle,
                            context = r.context,
                            count = r.count,
                            sum = r.sum,
                            average = r.average,
                            min = r.min,
                            max = r.max,
                            "group"
                        );
                    }
                }
            }
            OutputBatch::Raw(r) => {
                debug!(
                    time = r.time,
                    handle = r.handle,
                    context = r.context,
                    value = r.value,
                    "raw event"
                );
            }
            OutputBatch::CounterBatch { count } => {
                info!(count, "counter batch");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::record::AggregatedRecord;

    #[test]
    fn test_counts_windows() {
        let mut sink = LogSink::new(false);
        let records = [AggregatedRecord {
            handle: 1,
            count: 3,
            ..Default::default()
        }];

        sink.handle_batch(&OutputBatch::Aggregated(&records));
        sink.handle_batch(&OutputBatch::CounterBatch { count: 9 });
        sink.handle_batch(&OutputBatch::Aggregated(&[]));

        assert_eq!(sink.windows(), 2);
        assert_eq!(sink.name(), "log");
    }
}
