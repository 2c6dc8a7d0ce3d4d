//! In-memory table fakes for unit tests

use std::cell::{Cell, RefCell};
use std::collections::HashMap;

use crate::{
    AccumulateError, AncestryError, CgroupAncestry, CgroupRegistry, CounterReading, CounterSource,
    Diag, Diagnostics, HierarchyBuckets, InsertError, LineageBuckets, LineageFilter, Snapshot,
    SnapshotTable,
};

/// Cgroup chain root → leaf, task sits in the leaf
pub struct Chain {
    ids: Vec<u64>,
    available: bool,
    reads: Cell<usize>,
}

impl Chain {
    pub fn new(root_to_leaf: &[u64]) -> Self {
        Self { ids: root_to_leaf.to_vec(), available: true, reads: Cell::new(0) }
    }

    pub fn unavailable() -> Self {
        Self { ids: vec![1], available: false, reads: Cell::new(0) }
    }

    pub fn reads(&self) -> usize {
        self.reads.get()
    }
}

impl CgroupAncestry for Chain {
    fn depth(&self) -> Result<u32, AncestryError> {
        if !self.available {
            return Err(AncestryError::Unavailable);
        }
        Ok(self.ids.len() as u32 - 1)
    }

    fn ancestor_id(&self, level: u32) -> Result<u64, AncestryError> {
        self.reads.set(self.reads.get() + 1);
        self.ids.get(level as usize).copied().ok_or(AncestryError::Fault)
    }
}

pub struct Registry(HashMap<u64, u32>);

impl Registry {
    pub fn from_pairs(pairs: &[(u64, u32)]) -> Self {
        Self(pairs.iter().copied().collect())
    }
}

impl CgroupRegistry for Registry {
    fn group_of(&self, cgroup_id: u64) -> Option<u32> {
        self.0.get(&cgroup_id).copied()
    }
}

#[derive(Default)]
pub struct CountingDiag(RefCell<HashMap<Diag, usize>>);

impl CountingDiag {
    pub fn count(&self, diag: Diag) -> usize {
        self.0.borrow().get(&diag).copied().unwrap_or(0)
    }
}

impl Diagnostics for CountingDiag {
    fn record(&self, diag: Diag) {
        *self.0.borrow_mut().entry(diag).or_default() += 1;
    }
}

/// Counter source returning one scripted value per slot, `None` = unreadable
#[derive(Default)]
pub struct Scripted(HashMap<u32, CounterReading>);

impl Scripted {
    pub fn set(&mut self, slot: u32, value: u64) {
        self.0.insert(slot, CounterReading::new(value, value * 10, value * 10));
    }

    pub fn clear(&mut self, slot: u32) {
        self.0.remove(&slot);
    }
}

impl CounterSource for Scripted {
    fn read(&self, slot: u32) -> Option<CounterReading> {
        self.0.get(&slot).copied()
    }
}

pub struct Snapshots(Vec<Snapshot>);

impl Snapshots {
    pub fn with_events(n: usize) -> Self {
        Self(vec![Snapshot::default(); n])
    }

    pub fn get(&self, event: u32) -> Snapshot {
        self.0[event as usize]
    }
}

impl SnapshotTable for Snapshots {
    fn load(&self, event: u32) -> Option<Snapshot> {
        self.0.get(event as usize).copied()
    }

    fn store(&mut self, event: u32, snapshot: &Snapshot) -> bool {
        match self.0.get_mut(event as usize) {
            Some(slot) => {
                *slot = *snapshot;
                true
            }
            None => false,
        }
    }
}

/// Hierarchy buckets with a fixed number of groups
pub struct GroupBuckets {
    groups: u32,
    pub totals: HashMap<(u32, u32), CounterReading>,
}

impl GroupBuckets {
    pub fn with_groups(groups: u32) -> Self {
        Self { groups, totals: HashMap::new() }
    }

    pub fn value(&self, group: u32, event: u32) -> u64 {
        self.totals.get(&(group, event)).map_or(0, |r| r.value)
    }
}

impl HierarchyBuckets for GroupBuckets {
    fn add(
        &mut self,
        group: u32,
        event: u32,
        delta: &CounterReading,
    ) -> Result<(), AccumulateError> {
        if group >= self.groups {
            return Err(AccumulateError::Capacity);
        }
        self.totals.entry((group, event)).or_default().accumulate(delta);
        Ok(())
    }
}

pub struct Filter {
    capacity: usize,
    entries: RefCell<HashMap<u32, u32>>,
}

impl Filter {
    pub fn with_capacity(capacity: usize) -> Self {
        Self { capacity, entries: RefCell::new(HashMap::new()) }
    }

    pub fn seed(&self, tid: u32) {
        self.entries.borrow_mut().insert(tid, tid);
    }
}

impl LineageFilter for Filter {
    fn key_of(&self, tid: u32) -> Option<u32> {
        self.entries.borrow().get(&tid).copied()
    }

    fn insert_new(&self, tid: u32, key: u32) -> Result<(), InsertError> {
        let mut entries = self.entries.borrow_mut();
        if entries.contains_key(&tid) {
            return Err(InsertError::Exists);
        }
        if entries.len() >= self.capacity {
            return Err(InsertError::Full);
        }
        entries.insert(tid, key);
        Ok(())
    }
}

pub struct KeyBuckets {
    max_keys: usize,
    pub totals: RefCell<HashMap<(u32, u32), CounterReading>>,
}

impl KeyBuckets {
    pub fn with_max_keys(max_keys: usize) -> Self {
        Self { max_keys, totals: RefCell::new(HashMap::new()) }
    }

    pub fn value(&self, key: u32, event: u32) -> u64 {
        self.totals.borrow().get(&(key, event)).map_or(0, |r| r.value)
    }
}

impl LineageBuckets for KeyBuckets {
    fn add(
        &self,
        accum_key: u32,
        event: u32,
        delta: &CounterReading,
    ) -> Result<(), AccumulateError> {
        let mut totals = self.totals.borrow_mut();
        if !totals.contains_key(&(accum_key, event)) && totals.len() >= self.max_keys {
            return Err(AccumulateError::Capacity);
        }
        totals.entry((accum_key, event)).or_default().accumulate(delta);
        Ok(())
    }
}
