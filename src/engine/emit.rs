//! Window flush: size, reserve, drain, publish, reset.
//!
//! Runs inline on the execution context whose event closed the window. Every
//! failure degrades to losing (part of) the window; the table and window are
//! reset regardless so the next window starts clean.

use tracing::{debug, error, warn};

use crate::channel::record::{AggregatedRecord, AGGREGATED_RECORD_SIZE, AGGREGATED_RECORD_WORDS};
use crate::channel::{OutputChannel, Reservation};

use super::aggregate::AggregateFields;
use super::error::EngineError;
use super::table::{AggregationTable, DrainTarget};
use super::window::WindowController;

/// What a single flush did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlushReport {
    /// Live groups at the start of the flush.
    pub live: usize,
    /// Records published.
    pub emitted: usize,
    /// Some live groups did not fit and were discarded.
    pub truncated: bool,
    /// The channel refused the reservation; the whole window was dropped.
    pub reserve_failed: bool,
    /// The reservation could not hold whole records.
    pub invalid_context: bool,
}

/// Channel reservation viewed as an array of aggregated records.
struct RecordRegion<'a> {
    reservation: Reservation<'a>,
    records: usize,
}

impl<'a> RecordRegion<'a> {
    fn new(reservation: Reservation<'a>) -> Result<Self, EngineError> {
        let len = reservation.len_words();
        if len == 0 || len % AGGREGATED_RECORD_WORDS != 0 {
            return Err(EngineError::InvalidContext { len });
        }
        Ok(Self {
            reservation,
            records: len / AGGREGATED_RECORD_WORDS,
        })
    }

    /// Zeroes unwritten records, then publishes.
    fn submit(mut self, written: usize) {
        self.reservation
            .fill_from(written * AGGREGATED_RECORD_WORDS, 0);
        self.reservation.submit();
    }
}

impl DrainTarget for RecordRegion<'_> {
    fn record_capacity(&self) -> usize {
        self.records
    }

    #[inline]
    fn put(&mut self, index: usize, record: &AggregatedRecord) {
        self.reservation
            .write_words(index * AGGREGATED_RECORD_WORDS, &record.to_words());
    }
}

/// Flushes the current window to `channel` and starts the next one at
/// `trigger_time`.
pub fn flush_window(
    table: &AggregationTable,
    window: &WindowController,
    channel: &OutputChannel,
    fields: AggregateFields,
    max_records: usize,
    trigger_time: u64,
) -> FlushReport {
    let mut report = FlushReport {
        live: table.count_live(),
        ..FlushReport::default()
    };

    // A window never asks for more than one reservation can hold.
    let limit = max_records.min(channel.max_reservation_bytes() / AGGREGATED_RECORD_SIZE);
    let mut n = report.live;
    if n > limit {
        let err = EngineError::Truncation {
            live: n,
            emitted: limit,
        };
        warn!(error = %err, limit, max_records, "truncating window");
        n = limit;
        report.truncated = true;
    }

    if n > 0 {
        match drain_into_channel(table, channel, fields, n) {
            Ok((emitted, overflowed)) => {
                report.emitted = emitted;
                if overflowed && !report.truncated {
                    warn!(emitted, "groups appeared during flush, truncating window");
                    report.truncated = true;
                }
            }
            Err(err @ EngineError::InvalidContext { .. }) => {
                error!(error = %err, records = n, "dropping window");
                report.invalid_context = true;
            }
            Err(err) => {
                error!(error = %err, records = n, "could not reserve output for window, dropping it");
                report.reserve_failed = true;
            }
        }
    }

    table.clear();
    window.reset(trigger_time);

    debug!(
        live = report.live,
        emitted = report.emitted,
        trigger_time,
        "window flushed"
    );

    report
}

fn drain_into_channel(
    table: &AggregationTable,
    channel: &OutputChannel,
    fields: AggregateFields,
    records: usize,
) -> Result<(usize, bool), EngineError> {
    let reservation = channel.reserve(records * AGGREGATED_RECORD_SIZE)?;
    let mut region = RecordRegion::new(reservation)?;

    let outcome = table.snapshot(&mut region, fields);
    region.submit(outcome.written);

    Ok((outcome.written, outcome.overflowed))
}
