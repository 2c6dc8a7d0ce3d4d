//! Lock-free lineage filter: thread id → accumulation key
//!
//! Open addressing over packed `AtomicU64` slots (`tid << 32 | key`). A slot is
//! written exactly once, by the compare-exchange that claims it, so a reader
//! either sees the complete entry or an empty slot. Entries are never removed
//! during an epoch; [`LineageFilterTable::clear`] needs exclusive access.

use pmucount_common::{InsertError, LineageFilter};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

const EMPTY: u64 = 0;

pub struct LineageFilterTable {
    slots: Box<[AtomicU64]>,
    mask: usize,
    capacity: usize,
    len: AtomicUsize,
}

fn pack(tid: u32, key: u32) -> u64 {
    (u64::from(tid) << 32) | u64::from(key)
}

#[allow(clippy::cast_possible_truncation)]
fn unpack(entry: u64) -> (u32, u32) {
    ((entry >> 32) as u32, entry as u32)
}

fn hash(tid: u32) -> usize {
    // Fibonacci hashing spreads sequential tids
    (u64::from(tid).wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 32) as usize
}

impl LineageFilterTable {
    /// Table holding at most `capacity` entries
    pub fn with_capacity(capacity: usize) -> Self {
        let slots = (capacity.max(1) * 2).next_power_of_two();
        Self {
            slots: (0..slots).map(|_| AtomicU64::new(EMPTY)).collect(),
            mask: slots - 1,
            capacity,
            len: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LineageFilter for LineageFilterTable {
    fn key_of(&self, tid: u32) -> Option<u32> {
        if tid == 0 {
            return None;
        }
        let start = hash(tid);
        for probe in 0..self.slots.len() {
            let entry = self.slots[(start + probe) & self.mask].load(Ordering::Acquire);
            if entry == EMPTY {
                return None;
            }
            let (slot_tid, key) = unpack(entry);
            if slot_tid == tid {
                return Some(key);
            }
        }
        None
    }

    /// Tid 0 is the idle task and doubles as the empty marker; it is refused
    /// as if already present.
    fn insert_new(&self, tid: u32, key: u32) -> Result<(), InsertError> {
        if tid == 0 {
            return Err(InsertError::Exists);
        }

        if self.len.fetch_add(1, Ordering::Relaxed) >= self.capacity {
            self.len.fetch_sub(1, Ordering::Relaxed);
            return match self.key_of(tid) {
                Some(_) => Err(InsertError::Exists),
                None => Err(InsertError::Full),
            };
        }

        let packed = pack(tid, key);
        let start = hash(tid);
        for probe in 0..self.slots.len() {
            let slot = &self.slots[(start + probe) & self.mask];
            match slot.compare_exchange(EMPTY, packed, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Ok(()),
                Err(existing) if unpack(existing).0 == tid => {
                    self.len.fetch_sub(1, Ordering::Relaxed);
                    return Err(InsertError::Exists);
                }
                Err(_) => {}
            }
        }

        // unreachable with slots >= 2 * capacity
        self.len.fetch_sub(1, Ordering::Relaxed);
        Err(InsertError::Full)
    }
}
