//! Fixed-capacity group-by table.
//!
//! The table is an open-addressing slot arena allocated once at startup. A
//! slot is claimed by CAS on its state byte, after which its key never
//! changes. Accumulators are cleared in bulk on tumble while the keys stay
//! in place, so a group seen in an earlier window reuses its slot.
//!
//! Capacity counts claimed keys. The arena holds at least twice as many slots
//! as keys, so a probe always reaches either the key or an empty slot.

use std::hash::BuildHasher;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};

use crate::channel::record::AggregatedRecord;
use crate::tracer::event::GroupKey;

use super::aggregate::{Accumulator, AggregateFields, AggregateFunction, AggregationState};
use super::error::EngineError;

const SLOT_EMPTY: u8 = 0;
const SLOT_CLAIMED: u8 = 1;
const SLOT_READY: u8 = 2;

struct Slot {
    state: AtomicU8,
    handle: AtomicU64,
    context: AtomicU64,
    acc: Accumulator,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(SLOT_EMPTY),
            handle: AtomicU64::new(0),
            context: AtomicU64::new(0),
            acc: Accumulator::new(),
        }
    }

    /// Key of a READY slot.
    #[inline]
    fn key(&self) -> GroupKey {
        GroupKey::new(
            self.handle.load(Ordering::Relaxed),
            self.context.load(Ordering::Relaxed),
        )
    }

    #[inline]
    fn is_ready(&self) -> bool {
        self.state.load(Ordering::Acquire) == SLOT_READY
    }
}

/// Destination for drained records.
pub trait DrainTarget {
    /// Number of records the target can hold.
    fn record_capacity(&self) -> usize;

    /// Writes the record at `index` (< `record_capacity()`).
    fn put(&mut self, index: usize, record: &AggregatedRecord);
}

impl DrainTarget for [AggregatedRecord] {
    fn record_capacity(&self) -> usize {
        self.len()
    }

    fn put(&mut self, index: usize, record: &AggregatedRecord) {
        self[index] = *record;
    }
}

/// Result of enumerating live groups into a [`DrainTarget`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrainOutcome {
    pub written: usize,
    /// More live groups existed than the target could hold.
    pub overflowed: bool,
}

/// Fixed-capacity mapping from [`GroupKey`] to [`Accumulator`].
pub struct AggregationTable {
    slots: Box<[Slot]>,
    mask: usize,
    capacity: usize,
    occupied: AtomicUsize,
    hasher: ahash::RandomState,
}

impl AggregationTable {
    /// Allocates the arena for up to `capacity` distinct keys.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let len = capacity.saturating_mul(2).next_power_of_two();
        let slots = (0..len).map(|_| Slot::new()).collect();

        Self {
            slots,
            mask: len - 1,
            capacity,
            occupied: AtomicUsize::new(0),
            hasher: ahash::RandomState::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of keys holding a slot.
    pub fn occupied(&self) -> usize {
        self.occupied.load(Ordering::Acquire)
    }

    /// Folds `value` into the group for `key`, claiming a slot when the key is
    /// new. Fails without side effects when a new key would exceed capacity.
    #[inline]
    pub fn upsert(&self, key: GroupKey, value: u64) -> Result<(), EngineError> {
        let mut idx = self.home(key);
        let mut ticket = false;

        for _ in 0..self.slots.len() {
            let slot = &self.slots[idx];
            loop {
                match slot.state.load(Ordering::Acquire) {
                    SLOT_READY => {
                        if slot.key() == key {
                            if ticket {
                                self.occupied.fetch_sub(1, Ordering::AcqRel);
                            }
                            slot.acc.record(value);
                            return Ok(());
                        }
                        break;
                    }
                    SLOT_CLAIMED => std::hint::spin_loop(),
                    _ => {
                        if !ticket {
                            if !self.take_ticket() {
                                return Err(EngineError::CapacityExceeded {
                                    key,
                                    capacity: self.capacity,
                                });
                            }
                            ticket = true;
                        }
                        if slot
                            .state
                            .compare_exchange(
                                SLOT_EMPTY,
                                SLOT_CLAIMED,
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            )
                            .is_ok()
                        {
                            slot.handle.store(key.handle, Ordering::Relaxed);
                            slot.context.store(key.context, Ordering::Relaxed);
                            slot.acc.record(value);
                            slot.state.store(SLOT_READY, Ordering::Release);
                            return Ok(());
                        }
                        // Lost the claim; re-inspect the same slot.
                    }
                }
            }
            idx = (idx + 1) & self.mask;
        }

        if ticket {
            self.occupied.fetch_sub(1, Ordering::AcqRel);
        }
        Err(EngineError::CapacityExceeded {
            key,
            capacity: self.capacity,
        })
    }

    /// Number of groups with a non-empty accumulator.
    pub fn count_live(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.is_ready() && s.acc.is_live())
            .count()
    }

    /// Current state of one function for `key`, if the group is live.
    pub fn state(&self, key: GroupKey, func: AggregateFunction) -> Option<AggregationState> {
        let slot = self.find(key)?;
        let snap = slot.acc.snapshot();
        (snap.count != 0).then(|| snap.state(func))
    }

    /// Writes live groups into `target` in slot order, stopping when it is
    /// full. Leaves the accumulators untouched.
    pub fn snapshot<T: DrainTarget + ?Sized>(
        &self,
        target: &mut T,
        fields: AggregateFields,
    ) -> DrainOutcome {
        let limit = target.record_capacity();
        let mut outcome = DrainOutcome::default();

        for slot in self.slots.iter().filter(|s| s.is_ready()) {
            let snap = slot.acc.snapshot();
            if snap.count == 0 {
                continue;
            }
            if outcome.written == limit {
                outcome.overflowed = true;
                break;
            }

            let key = slot.key();
            let record = AggregatedRecord {
                handle: key.handle,
                context: key.context,
                count: snap.field(AggregateFunction::Count, fields),
                sum: snap.field(AggregateFunction::Sum, fields),
                average: snap.field(AggregateFunction::Average, fields),
                min: snap.field(AggregateFunction::Min, fields),
                max: snap.field(AggregateFunction::Max, fields),
            };
            target.put(outcome.written, &record);
            outcome.written += 1;
        }

        outcome
    }

    /// Resets every accumulator to empty. Keys keep their slots.
    pub fn clear(&self) {
        for slot in self.slots.iter().filter(|s| s.is_ready()) {
            slot.acc.clear();
        }
    }

    /// [`snapshot`](Self::snapshot) followed by [`clear`](Self::clear).
    ///
    /// Not atomic against concurrent upserts: an update landing between the
    /// two steps is cleared without being emitted.
    pub fn snapshot_and_drain<T: DrainTarget + ?Sized>(
        &self,
        target: &mut T,
        fields: AggregateFields,
    ) -> DrainOutcome {
        let outcome = self.snapshot(target, fields);
        self.clear();
        outcome
    }

    #[inline]
    fn home(&self, key: GroupKey) -> usize {
        (self.hasher.hash_one(key) as usize) & self.mask
    }

    fn take_ticket(&self) -> bool {
        self.occupied
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.capacity).then_some(n + 1)
            })
            .is_ok()
    }

    fn find(&self, key: GroupKey) -> Option<&Slot> {
        let mut idx = self.home(key);
        for _ in 0..self.slots.len() {
            let slot = &self.slots[idx];
            match slot.state.load(Ordering::Acquire) {
                SLOT_EMPTY => return None,
                SLOT_READY if slot.key() == key => return Some(slot),
                _ => {}
            }
            idx = (idx + 1) & self.mask;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain_all(table: &AggregationTable) -> Vec<AggregatedRecord> {
        let mut out = vec![AggregatedRecord::default(); table.capacity()];
        let outcome = table.snapshot_and_drain(out.as_mut_slice(), AggregateFields::all());
        out.truncate(outcome.written);
        out.sort_by_key(|r| r.key());
        out
    }

    #[test]
    fn test_insert_and_combine() {
        let table = AggregationTable::new(16);
        let key = GroupKey::new(3, 0);
        for v in [10, 20, 30] {
            table.upsert(key, v).expect("upsert");
        }

        assert_eq!(table.occupied(), 1);
        assert_eq!(table.count_live(), 1);
        assert_eq!(
            table.state(key, AggregateFunction::Count),
            Some(AggregationState::Count { n: 3 })
        );
        assert_eq!(
            table.state(key, AggregateFunction::Average),
            Some(AggregationState::Average { total: 60, n: 3 })
        );
        assert_eq!(table.state(GroupKey::new(4, 0), AggregateFunction::Count), None);
    }

    #[test]
    fn test_capacity_rejects_new_keys() {
        let table = AggregationTable::new(2);
        table.upsert(GroupKey::new(1, 0), 1).expect("a");
        table.upsert(GroupKey::new(2, 0), 1).expect("b");

        let err = table.upsert(GroupKey::new(3, 0), 1).unwrap_err();
        assert_eq!(
            err,
            EngineError::CapacityExceeded {
                key: GroupKey::new(3, 0),
                capacity: 2
            }
        );
        assert_eq!(table.count_live(), 2);
        assert_eq!(table.occupied(), 2);

        // Existing keys still combine at capacity.
        table.upsert(GroupKey::new(1, 0), 5).expect("existing");
        assert_eq!(
            table.state(GroupKey::new(1, 0), AggregateFunction::Sum),
            Some(AggregationState::Sum { total: 6 })
        );
    }

    #[test]
    fn test_drain_writes_fields_and_clears() {
        let table = AggregationTable::new(8);
        table.upsert(GroupKey::new(1, 0), 4).expect("upsert");
        table.upsert(GroupKey::new(1, 0), 8).expect("upsert");
        table.upsert(GroupKey::new(2, 1), 0).expect("upsert");

        let records = drain_all(&table);
        assert_eq!(
            records,
            vec![
                AggregatedRecord {
                    handle: 1,
                    context: 0,
                    count: 2,
                    sum: 12,
                    average: 6,
                    min: 4,
                    max: 8
                },
                AggregatedRecord {
                    handle: 2,
                    context: 1,
                    count: 1,
                    sum: 0,
                    average: 0,
                    min: 0,
                    max: 0
                },
            ]
        );

        assert_eq!(table.count_live(), 0);
        assert_eq!(table.occupied(), 2);
        assert!(drain_all(&table).is_empty());
    }

    #[test]
    fn test_unrequested_fields_are_zero() {
        let table = AggregationTable::new(4);
        table.upsert(GroupKey::new(1, 0), 10).expect("upsert");

        let mut out = [AggregatedRecord::default(); 1];
        let fields = AggregateFields::none().with(AggregateFunction::Count);
        table.snapshot(&mut out[..], fields);
        assert_eq!(out[0].count, 1);
        assert_eq!(out[0].sum, 0);
        assert_eq!(out[0].max, 0);
    }

    #[test]
    fn test_drain_overflow() {
        let table = AggregationTable::new(8);
        for h in 0..3 {
            table.upsert(GroupKey::new(h, 0), 1).expect("upsert");
        }

        let mut out = [AggregatedRecord::default(); 2];
        let outcome = table.snapshot_and_drain(&mut out[..], AggregateFields::all());
        assert_eq!(outcome, DrainOutcome { written: 2, overflowed: true });
        assert_eq!(table.count_live(), 0);
    }

    #[test]
    fn test_post_clear_starts_clean() {
        let table = AggregationTable::new(4);
        let key = GroupKey::new(7, 7);
        table.upsert(key, 100).expect("upsert");
        table.clear();
        table.upsert(key, 1).expect("upsert");

        assert_eq!(
            table.state(key, AggregateFunction::Max),
            Some(AggregationState::Extremum { value: 1 })
        );
        assert_eq!(
            table.state(key, AggregateFunction::Count),
            Some(AggregationState::Count { n: 1 })
        );
    }

    #[test]
    fn test_concurrent_upserts() {
        use std::sync::Arc;
        use std::thread;

        let table = Arc::new(AggregationTable::new(64));
        let mut handles = Vec::new();

        for t in 0..4u64 {
            let table = Arc::clone(&table);
            handles.push(thread::spawn(move || {
                for i in 0..1000u64 {
                    // One shared key plus per-thread keys.
                    table.upsert(GroupKey::new(0, 0), 1).expect("shared");
                    table.upsert(GroupKey::new(1 + i % 8, t), i).expect("own");
                }
            }));
        }

        for h in handles {
            h.join().expect("thread panicked");
        }

        assert_eq!(table.occupied(), 1 + 4 * 8);
        assert_eq!(
            table.state(GroupKey::new(0, 0), AggregateFunction::Count),
            Some(AggregationState::Count { n: 4000 })
        );
        for t in 0..4 {
            assert_eq!(
                table.state(GroupKey::new(1, t), AggregateFunction::Count),
                Some(AggregationState::Count { n: 125 })
            );
        }
    }

    #[test]
    fn test_concurrent_inserts_respect_capacity() {
        use std::sync::Arc;
        use std::thread;

        let table = Arc::new(AggregationTable::new(10));
        let handles: Vec<_> = (0..4u64)
            .map(|t| {
                let table = Arc::clone(&table);
                thread::spawn(move || {
                    (0..20u64)
                        .filter(|h| table.upsert(GroupKey::new(*h, t), 1).is_ok())
                        .count()
                })
            })
            .collect();

        let accepted: usize = handles.into_iter().map(|h| h.join().expect("join")).sum();
        assert_eq!(accepted, 10);
        assert_eq!(table.occupied(), 10);
        assert_eq!(table.count_live(), 10);
    }
}
