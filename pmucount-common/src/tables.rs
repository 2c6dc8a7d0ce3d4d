//! Table seams of the counting engine
//!
//! Each trait is one lookup table or external collaborator from the data
//! model. The kernel side implements them over BPF maps, userspace over
//! pre-allocated atomics. Implementations must never block.

use crate::{AccumulateError, AncestryError, CounterReading, InsertError, Snapshot};

/// Live counter values addressed by Event Slot
pub trait CounterSource {
    /// Read the counter behind `slot`, `None` if the slot is not backed by an
    /// open counter on this cpu right now.
    fn read(&self, slot: u32) -> Option<CounterReading>;
}

/// Per-cpu snapshot table, one entry per logical event
///
/// Only the owning cpu ever touches its table.
pub trait SnapshotTable {
    /// Current snapshot for `event`; a never-observed entry is
    /// `Snapshot::default()`. `None` only if the table cannot hold `event`.
    fn load(&self, event: u32) -> Option<Snapshot>;

    /// Replace the snapshot for `event`. Returns `false` if the table cannot
    /// hold `event`.
    fn store(&mut self, event: u32, snapshot: &Snapshot) -> bool;
}

/// Cgroup ancestry of the task being scheduled out
pub trait CgroupAncestry {
    /// Depth of the task's cgroup in the hierarchy (root = 0)
    ///
    /// # Errors
    /// [`AncestryError::Unavailable`] when the kernel does not expose the
    /// fields needed to walk the hierarchy, [`AncestryError::Fault`] when a
    /// kernel read failed.
    fn depth(&self) -> Result<u32, AncestryError>;

    /// Cgroup id of the ancestor at hierarchy `level` (root = 0)
    ///
    /// # Errors
    /// Same as [`CgroupAncestry::depth`].
    fn ancestor_id(&self, level: u32) -> Result<u64, AncestryError>;
}

/// Cgroup id → dense group key, populated by the control plane
pub trait CgroupRegistry {
    fn group_of(&self, cgroup_id: u64) -> Option<u32>;
}

/// Task id → accumulation key
pub trait LineageFilter {
    fn key_of(&self, tid: u32) -> Option<u32>;

    /// Insert `tid → key` only if `tid` has no entry yet
    ///
    /// # Errors
    /// [`InsertError::Exists`] if `tid` is already present (never overwritten),
    /// [`InsertError::Full`] if the table is at capacity.
    fn insert_new(&self, tid: u32, key: u32) -> Result<(), InsertError>;
}

/// Per-cpu hierarchy buckets, one per (group, event)
pub trait HierarchyBuckets {
    /// Add `delta` into the bucket, creating it zeroed on first use
    ///
    /// # Errors
    /// [`AccumulateError::Capacity`] when `(group, event)` is outside the table.
    fn add(
        &mut self,
        group: u32,
        event: u32,
        delta: &CounterReading,
    ) -> Result<(), AccumulateError>;
}

/// Cross-cpu lineage buckets, one per (accumulation key, event)
///
/// Called concurrently from every cpu; implementations must not lose updates.
pub trait LineageBuckets {
    /// Add `delta` into the bucket, creating it zeroed on first use
    ///
    /// # Errors
    /// [`AccumulateError::Capacity`] when the bucket does not exist and the
    /// table has no room for a new key.
    fn add(
        &self,
        accum_key: u32,
        event: u32,
        delta: &CounterReading,
    ) -> Result<(), AccumulateError>;
}
