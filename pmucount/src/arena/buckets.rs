//! Lock-free lineage bucket table: (accumulation key, event) → cross-cpu total
//!
//! Key slots are claimed once with compare-exchange and never released within
//! an epoch; values are updated with `fetch_add`, so concurrent additions
//! from every cpu are never lost. When the table is full, new keys are
//! rejected while existing keys keep accumulating.

use pmucount_common::{AccumulateError, CounterReading, LineageBuckets};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use super::slab::{slab, AtomicReading};

const EMPTY: u64 = 0;

/// `+ 1` keeps (0, 0) distinct from an empty slot
fn encode(accum_key: u32, event: u32) -> u64 {
    ((u64::from(accum_key) << 32) | u64::from(event)) + 1
}

fn hash(accum_key: u32, event: u32) -> usize {
    (encode(accum_key, event).wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 32) as usize
}

pub struct LineageBucketTable {
    keys: Box<[AtomicU64]>,
    values: Box<[AtomicReading]>,
    mask: usize,
    capacity: usize,
    /// Claimed slots plus writers that reserved one and have not claimed it yet
    reserved: AtomicUsize,
    /// Claimed slots
    len: AtomicUsize,
}

impl LineageBucketTable {
    /// Table holding at most `capacity` (key, event) buckets
    pub fn with_capacity(capacity: usize) -> Self {
        let slots = (capacity.max(1) * 2).next_power_of_two();
        Self {
            keys: (0..slots).map(|_| AtomicU64::new(EMPTY)).collect(),
            values: slab(slots),
            mask: slots - 1,
            capacity,
            reserved: AtomicUsize::new(0),
            len: AtomicUsize::new(0),
        }
    }

    fn find(&self, encoded: u64, start: usize) -> Option<usize> {
        for probe in 0..self.keys.len() {
            let index = (start + probe) & self.mask;
            match self.keys[index].load(Ordering::Acquire) {
                EMPTY => return None,
                slot if slot == encoded => return Some(index),
                _ => {}
            }
        }
        None
    }

    /// Claim a slot for `encoded`; the flag is `false` if another writer
    /// claimed it first
    fn claim(&self, encoded: u64, start: usize) -> Option<(usize, bool)> {
        for probe in 0..self.keys.len() {
            let index = (start + probe) & self.mask;
            let slot = &self.keys[index];
            match slot.compare_exchange(EMPTY, encoded, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Some((index, true)),
                Err(existing) if existing == encoded => return Some((index, false)),
                Err(_) => {}
            }
        }
        None
    }

    /// Existing slot of `encoded`, or a newly claimed one while under capacity
    fn slot_for(&self, encoded: u64, start: usize) -> Result<usize, AccumulateError> {
        loop {
            if let Some(index) = self.find(encoded, start) {
                return Ok(index);
            }
            if self.reserved.fetch_add(1, Ordering::AcqRel) < self.capacity {
                let Some((index, claimed)) = self.claim(encoded, start) else {
                    self.reserved.fetch_sub(1, Ordering::AcqRel);
                    return Err(AccumulateError::Capacity);
                };
                if claimed {
                    self.len.fetch_add(1, Ordering::AcqRel);
                } else {
                    self.reserved.fetch_sub(1, Ordering::AcqRel);
                }
                return Ok(index);
            }
            self.reserved.fetch_sub(1, Ordering::AcqRel);

            if self.len.load(Ordering::Acquire) >= self.capacity {
                return Err(AccumulateError::Capacity);
            }
            // the last reservation may belong to a writer about to claim this
            // very key
            std::hint::spin_loop();
        }
    }

    /// Current total of one bucket, `None` if it was never created
    pub fn get(&self, accum_key: u32, event: u32) -> Option<CounterReading> {
        self.find(encode(accum_key, event), hash(accum_key, event))
            .map(|index| self.values[index].load())
    }

    /// Create a zeroed bucket ahead of time
    ///
    /// # Errors
    /// [`AccumulateError::Capacity`] when the table has no room.
    pub fn ensure(&self, accum_key: u32, event: u32) -> Result<(), AccumulateError> {
        self.add(accum_key, event, &CounterReading::ZERO)
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LineageBuckets for LineageBucketTable {
    fn add(
        &self,
        accum_key: u32,
        event: u32,
        delta: &CounterReading,
    ) -> Result<(), AccumulateError> {
        let index = self.slot_for(encode(accum_key, event), hash(accum_key, event))?;
        self.values[index].fetch_add(delta);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_missing_bucket_is_created_zeroed() {
        let table = LineageBucketTable::with_capacity(4);
        assert_eq!(table.get(7, 0), None);

        table.add(7, 0, &CounterReading::new(5, 6, 7)).unwrap();
        assert_eq!(table.get(7, 0), Some(CounterReading::new(5, 6, 7)));
        assert_eq!(table.get(7, 1), None);
    }

    #[test]
    fn test_key_zero_event_zero_is_a_real_bucket() {
        let table = LineageBucketTable::with_capacity(4);
        table.ensure(0, 0).unwrap();
        assert_eq!(table.get(0, 0), Some(CounterReading::ZERO));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_full_table_rejects_only_new_keys() {
        let table = LineageBucketTable::with_capacity(1);
        let one = CounterReading::new(1, 1, 1);

        table.add(1, 0, &one).unwrap();
        assert_eq!(table.add(2, 0, &one), Err(AccumulateError::Capacity));
        table.add(1, 0, &one).unwrap();

        assert_eq!(table.get(1, 0).map(|r| r.value), Some(2));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_concurrent_adds_are_not_lost() {
        let table = Arc::new(LineageBucketTable::with_capacity(16));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let table = Arc::clone(&table);
                std::thread::spawn(move || {
                    for _ in 0..10_000 {
                        table.add(1, 0, &CounterReading::new(1, 2, 3)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(table.get(1, 0), Some(CounterReading::new(80_000, 160_000, 240_000)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_racing_creation_of_the_last_bucket() {
        for _ in 0..200 {
            let table = Arc::new(LineageBucketTable::with_capacity(1));
            let barrier = Arc::new(std::sync::Barrier::new(4));
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let table = Arc::clone(&table);
                    let barrier = Arc::clone(&barrier);
                    std::thread::spawn(move || {
                        barrier.wait();
                        table.add(9, 0, &CounterReading::new(1, 1, 1))
                    })
                })
                .collect();
            for handle in handles {
                assert_eq!(handle.join().unwrap(), Ok(()));
            }

            assert_eq!(table.get(9, 0).map(|r| r.value), Some(4));
            assert_eq!(table.len(), 1);
            assert_eq!(table.add(10, 0, &CounterReading::ZERO), Err(AccumulateError::Capacity));
        }
    }
}
