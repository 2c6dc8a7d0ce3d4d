//! Per-cpu slabs of atomics
//!
//! Every slab belongs to one cpu and is only written through that cpu's
//! [`CpuHandle`](super::CpuHandle), so relaxed load/store is enough. Readers on
//! other threads may observe a bucket mid-update (value bumped, running not
//! yet); totals are consistent once the writers are quiescent.

use pmucount_common::{
    hierarchy_bucket, AccumulateError, CounterReading, HierarchyBuckets, Snapshot, SnapshotTable,
};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct AtomicReading {
    value: AtomicU64,
    enabled: AtomicU64,
    running: AtomicU64,
}

impl AtomicReading {
    pub fn load(&self) -> CounterReading {
        CounterReading::new(
            self.value.load(Ordering::Relaxed),
            self.enabled.load(Ordering::Relaxed),
            self.running.load(Ordering::Relaxed),
        )
    }

    /// Single-writer add
    pub fn add_local(&self, delta: &CounterReading) {
        let mut current = self.load();
        current.accumulate(delta);
        self.store(&current);
    }

    /// Multi-writer add, no lost updates
    pub fn fetch_add(&self, delta: &CounterReading) {
        self.value.fetch_add(delta.value, Ordering::Relaxed);
        self.enabled.fetch_add(delta.enabled, Ordering::Relaxed);
        self.running.fetch_add(delta.running, Ordering::Relaxed);
    }

    pub fn store(&self, reading: &CounterReading) {
        self.value.store(reading.value, Ordering::Relaxed);
        self.enabled.store(reading.enabled, Ordering::Relaxed);
        self.running.store(reading.running, Ordering::Relaxed);
    }
}

#[derive(Debug, Default)]
pub struct AtomicSnapshot {
    reading: AtomicReading,
    primed: AtomicU64,
}

/// One cpu's snapshot table
pub struct CpuSnapshots<'a>(pub &'a [AtomicSnapshot]);

impl SnapshotTable for CpuSnapshots<'_> {
    fn load(&self, event: u32) -> Option<Snapshot> {
        let slot = self.0.get(event as usize)?;
        Some(Snapshot { reading: slot.reading.load(), primed: slot.primed.load(Ordering::Relaxed) })
    }

    fn store(&mut self, event: u32, snapshot: &Snapshot) -> bool {
        let Some(slot) = self.0.get(event as usize) else {
            return false;
        };
        slot.reading.store(&snapshot.reading);
        slot.primed.store(snapshot.primed, Ordering::Relaxed);
        true
    }
}

/// One cpu's hierarchy buckets, `max_groups * num_events` entries
pub struct CpuBuckets<'a> {
    pub slab: &'a [AtomicReading],
    pub num_events: u32,
    pub max_groups: u32,
}

impl HierarchyBuckets for CpuBuckets<'_> {
    fn add(
        &mut self,
        group: u32,
        event: u32,
        delta: &CounterReading,
    ) -> Result<(), AccumulateError> {
        if group >= self.max_groups || event >= self.num_events {
            return Err(AccumulateError::Capacity);
        }
        let index = hierarchy_bucket(group, event, self.num_events) as usize;
        let bucket = self.slab.get(index).ok_or(AccumulateError::Capacity)?;
        bucket.add_local(delta);
        Ok(())
    }
}

pub fn slab<T: Default>(len: usize) -> Box<[T]> {
    (0..len).map(|_| T::default()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_and_shared_adds_combine() {
        let r = AtomicReading::default();
        r.fetch_add(&CounterReading::new(3, 4, 5));
        r.add_local(&CounterReading::new(1, 1, 1));
        assert_eq!(r.load(), CounterReading::new(4, 5, 6));
    }

    #[test]
    fn test_bucket_bounds() {
        let cells: Box<[AtomicReading]> = slab(4);
        let mut buckets = CpuBuckets { slab: &cells, num_events: 2, max_groups: 2 };
        let one = CounterReading::new(1, 1, 1);

        assert!(buckets.add(1, 1, &one).is_ok());
        assert_eq!(cells[3].load().value, 1);
        assert_eq!(buckets.add(2, 0, &one), Err(AccumulateError::Capacity));
    }

    #[test]
    fn test_snapshot_roundtrip_through_slab() {
        let cells: Box<[AtomicSnapshot]> = slab(2);
        let mut table = CpuSnapshots(&cells);
        assert!(!table.load(1).unwrap().is_primed());

        let snap = Snapshot::primed_with(CounterReading::new(9, 8, 7));
        assert!(table.store(1, &snap));
        assert_eq!(table.load(1), Some(snap));
        assert!(!table.store(2, &snap));
    }
}
