//! Per-run totals appended to a CSV file on shutdown.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};

use super::health::HealthMetrics;
use crate::tracer::stats::{Outcome, MAX_OUTCOME};

/// Totals for one agent run.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RunStats {
    pub elapsed: Duration,
    pub batches_consumed: u64,
    pub rows_consumed: u64,
    outcomes: [u64; MAX_OUTCOME + 1],
}

impl RunStats {
    /// Reads the cumulative counters. Call after the final stats snapshot has
    /// been applied.
    pub fn from_health(health: &HealthMetrics, elapsed: Duration) -> Self {
        let mut outcomes = [0u64; MAX_OUTCOME + 1];
        for outcome in Outcome::ALL {
            outcomes[outcome as usize] = health
                .engine_outcomes
                .with_label_values(&[outcome.as_str()])
                .get() as u64;
        }

        Self {
            elapsed,
            batches_consumed: health.batches_consumed.get() as u64,
            rows_consumed: health.rows_consumed.get() as u64,
            outcomes,
        }
    }

    pub fn get(&self, outcome: Outcome) -> u64 {
        self.outcomes[outcome as usize]
    }

    pub fn header() -> String {
        let mut cols = vec!["elapsed_ms", "batches_consumed", "rows_consumed"];
        cols.extend(Outcome::ALL.iter().map(|o| o.as_str()));
        cols.join(",")
    }

    pub fn csv_row(&self) -> String {
        let mut cols = vec![
            self.elapsed.as_millis().to_string(),
            self.batches_consumed.to_string(),
            self.rows_consumed.to_string(),
        ];
        cols.extend(self.outcomes.iter().map(u64::to_string));
        cols.join(",")
    }

    /// Appends one row to `path`, writing the header first if the file is new
    /// or empty.
    pub fn append_to(&self, path: &Path) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening stats file {}", path.display()))?;

        let len = file
            .metadata()
            .with_context(|| format!("reading stats file metadata {}", path.display()))?
            .len();

        let mut out = String::new();
        if len == 0 {
            out.push_str(&Self::header());
            out.push('\n');
        }
        out.push_str(&self.csv_row());
        out.push('\n');

        file.write_all(out.as_bytes())
            .with_context(|| format!("writing stats file {}", path.display()))
    }
}
