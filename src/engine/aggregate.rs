use std::sync::atomic::{AtomicU64, Ordering};

use serde::Deserialize;

/// Aggregate functions a flush can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateFunction {
    Count,
    Sum,
    Average,
    Min,
    Max,
}

impl AggregateFunction {
    const fn bit(self) -> u8 {
        1 << self as u8
    }
}

/// Set of requested [`AggregateFunction`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AggregateFields(u8);

impl AggregateFields {
    pub const fn none() -> Self {
        Self(0)
    }

    pub const fn all() -> Self {
        Self(0b1_1111)
    }

    pub const fn with(self, func: AggregateFunction) -> Self {
        Self(self.0 | func.bit())
    }

    pub const fn contains(self, func: AggregateFunction) -> bool {
        self.0 & func.bit() != 0
    }
}

impl FromIterator<AggregateFunction> for AggregateFields {
    fn from_iter<I: IntoIterator<Item = AggregateFunction>>(iter: I) -> Self {
        iter.into_iter().fold(Self::none(), Self::with)
    }
}

/// Per-function state derived from an accumulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationState {
    Count { n: u64 },
    Sum { total: u64 },
    Average { total: u64, n: u64 },
    Extremum { value: u64 },
}

impl AggregationState {
    /// The visible value: averages are truncated `total / n`.
    pub fn value(&self) -> u64 {
        match *self {
            Self::Count { n } => n,
            Self::Sum { total } => total,
            Self::Average { total, n } => total.checked_div(n).unwrap_or(0),
            Self::Extremum { value } => value,
        }
    }
}

/// Set on `gate` while a clear is resetting the fields.
const CLEARING: u64 = 1 << 63;

/// Multi-field accumulator for one group.
///
/// Every field is an independent atomic cell, so concurrent updates on the
/// same group never lose increments. `count == 0` marks the accumulator as
/// unused; min/max sentinels are only meaningful once count is non-zero.
///
/// `gate` counts updates and snapshots in progress. A clear raises
/// `CLEARING`, waits for them to finish, and resets all four fields before
/// anyone else touches them, so an update is seen either whole in the old
/// window or whole in the new one.
pub struct Accumulator {
    gate: AtomicU64,
    count: AtomicU64,
    sum: AtomicU64,
    min: AtomicU64,
    max: AtomicU64,
}

impl Accumulator {
    pub const fn new() -> Self {
        Self {
            gate: AtomicU64::new(0),
            count: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            min: AtomicU64::new(u64::MAX),
            max: AtomicU64::new(0),
        }
    }

    /// Folds one value in. Sums wrap on overflow.
    ///
    /// Only waits while a clear of this accumulator is in progress.
    #[inline]
    pub fn record(&self, value: u64) {
        self.enter();
        self.sum.fetch_add(value, Ordering::Relaxed);
        self.min.fetch_min(value, Ordering::Relaxed);
        self.max.fetch_max(value, Ordering::Relaxed);
        // Count last: a reader that sees the group live sees its value too.
        self.count.fetch_add(1, Ordering::Release);
        self.leave();
    }

    #[inline]
    pub fn is_live(&self) -> bool {
        self.count.load(Ordering::Acquire) != 0
    }

    /// Returns a point-in-time snapshot of all fields.
    ///
    /// Never observes a half-cleared accumulator: when `count` is non-zero,
    /// `min <= max`.
    pub fn snapshot(&self) -> AccumulatorSnapshot {
        self.enter();
        let count = self.count.load(Ordering::Acquire);
        let (min, max) = if count == 0 {
            (0, 0)
        } else {
            (
                self.min.load(Ordering::Relaxed),
                self.max.load(Ordering::Relaxed),
            )
        };
        let sum = self.sum.load(Ordering::Relaxed);
        self.leave();

        AccumulatorSnapshot {
            count,
            sum,
            min,
            max,
        }
    }

    /// Resets to the unused state.
    pub fn clear(&self) {
        // Raise the flag; another clearer holding it makes us retry.
        while self.gate.fetch_or(CLEARING, Ordering::Acquire) & CLEARING != 0 {
            std::hint::spin_loop();
        }
        while self.gate.load(Ordering::Acquire) != CLEARING {
            std::hint::spin_loop();
        }

        self.count.store(0, Ordering::Relaxed);
        self.sum.store(0, Ordering::Relaxed);
        self.min.store(u64::MAX, Ordering::Relaxed);
        self.max.store(0, Ordering::Relaxed);

        self.gate.fetch_and(!CLEARING, Ordering::Release);
    }

    #[inline]
    fn enter(&self) {
        loop {
            if self.gate.fetch_add(1, Ordering::Acquire) & CLEARING == 0 {
                return;
            }
            self.gate.fetch_sub(1, Ordering::Relaxed);
            while self.gate.load(Ordering::Relaxed) & CLEARING != 0 {
                std::hint::spin_loop();
            }
        }
    }

    #[inline]
    fn leave(&self) {
        self.gate.fetch_sub(1, Ordering::Release);
    }
}

impl Default for Accumulator {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of an [`Accumulator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AccumulatorSnapshot {
    pub count: u64,
    pub sum: u64,
    pub min: u64,
    pub max: u64,
}

impl AccumulatorSnapshot {
    /// Folds one value into a plain, single-owner accumulator.
    pub fn fold(&mut self, value: u64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        self.sum = self.sum.wrapping_add(value);
    }

    pub fn state(&self, func: AggregateFunction) -> AggregationState {
        match func {
            AggregateFunction::Count => AggregationState::Count { n: self.count },
            AggregateFunction::Sum => AggregationState::Sum { total: self.sum },
            AggregateFunction::Average => AggregationState::Average {
                total: self.sum,
                n: self.count,
            },
            AggregateFunction::Min => AggregationState::Extremum { value: self.min },
            AggregateFunction::Max => AggregationState::Extremum { value: self.max },
        }
    }

    /// Visible value of `func`, or zero when it was not requested.
    #[inline]
    pub fn field(&self, func: AggregateFunction, fields: AggregateFields) -> u64 {
        if fields.contains(func) {
            self.state(func).value()
        } else {
            0
        }
    }
}
