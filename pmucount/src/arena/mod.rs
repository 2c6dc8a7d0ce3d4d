//! In-process counting tables
//!
//! Userspace rendition of the kernel maps, driven by the same engine from
//! `pmucount-common`. Everything is allocated up front by [`Tables::new`];
//! the switch path only touches atomics.
//!
//! ```text
//! Tables ──claim_cpu(n)──▶ CpuHandle (one per cpu, exclusive)
//!   │                          ├─ on_switch_hierarchy → per-cpu hierarchy slab
//!   │                          └─ on_switch_lineage   → shared lineage buckets
//!   ├─ registry  (&mut only, before handles exist)
//!   ├─ filter    (lock-free, insert-if-absent)
//!   └─ buckets   (lock-free, fetch_add)
//! ```

pub mod buckets;
pub mod diag;
pub mod filter;
pub mod registry;
pub mod slab;

use pmucount_common::{
    hierarchy_bucket, on_switch_hierarchy, on_switch_lineage, propagate_lineage, CgroupAncestry,
    CounterReading, CounterSource, Diag, Diagnostics, InsertError, LineageFilter, LineageOutcome,
    SwitchConfig, SwitchReport, DEFAULT_MAX_GROUPS, MAX_EVENTS, MAX_FILTER_ENTRIES,
    MAX_LINEAGE_KEYS,
};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::domain::{CgroupId, CpuId, TableError, Tid};

pub use buckets::LineageBucketTable;
pub use diag::DiagCounters;
pub use filter::LineageFilterTable;
pub use registry::Registry;
use slab::{slab, AtomicReading, AtomicSnapshot, CpuBuckets, CpuSnapshots};

/// Table sizes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TablesConfig {
    pub num_cpus: u32,
    pub num_events: u32,
    /// Dense group keys available to the cgroup collector
    pub max_groups: u32,
    pub filter_capacity: usize,
    /// Lineage keys; the bucket table holds `lineage_keys * num_events` buckets
    pub lineage_keys: usize,
}

impl TablesConfig {
    pub fn new(num_cpus: u32, num_events: u32) -> Self {
        Self {
            num_cpus,
            num_events: num_events.min(MAX_EVENTS),
            max_groups: DEFAULT_MAX_GROUPS,
            filter_capacity: MAX_FILTER_ENTRIES as usize,
            lineage_keys: MAX_LINEAGE_KEYS as usize,
        }
    }
}

/// Per-cpu state, touched only through the cpu's [`CpuHandle`]
struct CpuTables {
    hierarchy_snapshots: Box<[AtomicSnapshot]>,
    lineage_snapshots: Box<[AtomicSnapshot]>,
    hierarchy_buckets: Box<[AtomicReading]>,
    claimed: AtomicBool,
}

pub struct Tables {
    config: TablesConfig,
    cpus: Box<[CpuTables]>,
    registry: Registry,
    filter: LineageFilterTable,
    buckets: LineageBucketTable,
    diag: DiagCounters,
}

impl Tables {
    pub fn new(config: TablesConfig) -> Self {
        let events = config.num_events as usize;
        let cpus = (0..config.num_cpus)
            .map(|_| CpuTables {
                hierarchy_snapshots: slab(events),
                lineage_snapshots: slab(events),
                hierarchy_buckets: slab(config.max_groups as usize * events),
                claimed: AtomicBool::new(false),
            })
            .collect();

        Self {
            config,
            cpus,
            registry: Registry::default(),
            filter: LineageFilterTable::with_capacity(config.filter_capacity),
            buckets: LineageBucketTable::with_capacity(config.lineage_keys * events),
            diag: DiagCounters::default(),
        }
    }

    fn switch_config(&self) -> SwitchConfig {
        SwitchConfig::new(self.config.num_events, self.config.num_cpus)
    }

    /// Register `cgroup` under the dense group `key`
    ///
    /// # Errors
    /// [`TableError::RegistryFull`] when `key` is outside the bucket slabs or
    /// the registry is full, [`TableError::RegistryConflict`] when `cgroup`
    /// already has a different key.
    pub fn register_cgroup(&mut self, cgroup: CgroupId, key: u32) -> Result<(), TableError> {
        if key >= self.config.max_groups {
            return Err(TableError::RegistryFull);
        }
        self.registry.register(cgroup, key)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Start tracking `tid` as the root of a lineage keyed by itself
    ///
    /// # Errors
    /// [`TableError::ReservedTid`] for tid 0, [`TableError::AlreadyTracked`]
    /// when `tid` already has a key, [`TableError::FilterFull`] when the
    /// filter has no room.
    pub fn track(&self, tid: Tid) -> Result<(), TableError> {
        self.track_as(tid, tid.0)
    }

    /// Track `tid` under an existing accumulation `key`
    ///
    /// # Errors
    /// Same as [`Tables::track`].
    pub fn track_as(&self, tid: Tid, key: u32) -> Result<(), TableError> {
        if tid.0 == 0 {
            return Err(TableError::ReservedTid);
        }
        match self.filter.insert_new(tid.0, key) {
            Ok(()) => {}
            Err(InsertError::Exists) => {
                let key = self.filter.key_of(tid.0).unwrap_or(key);
                return Err(TableError::AlreadyTracked { tid, key });
            }
            Err(InsertError::Full) => return Err(TableError::FilterFull),
        }

        // tracked keys show up in results even if they never ran
        for event in 0..self.config.num_events {
            if self.buckets.ensure(key, event).is_err() {
                self.diag.record(Diag::BucketFull);
            }
        }
        Ok(())
    }

    /// Task-creation hook of the lineage collector
    pub fn on_new_task(&self, parent: Tid, child: Tid) -> LineageOutcome {
        propagate_lineage(&self.filter, &self.diag, parent.0, child.0)
    }

    pub fn key_of(&self, tid: Tid) -> Option<u32> {
        self.filter.key_of(tid.0)
    }

    /// Hand out the exclusive switch handle of `cpu`
    ///
    /// # Errors
    /// [`TableError::CpuOutOfRange`] or [`TableError::CpuClaimed`] while
    /// another handle for the same cpu is alive.
    pub fn claim_cpu(&self, cpu: CpuId) -> Result<CpuHandle<'_>, TableError> {
        let tables = self
            .cpus
            .get(cpu.0 as usize)
            .ok_or(TableError::CpuOutOfRange { cpu, num_cpus: self.config.num_cpus })?;
        if tables.claimed.swap(true, Ordering::Acquire) {
            return Err(TableError::CpuClaimed(cpu));
        }
        Ok(CpuHandle { tables: self, cpu: cpu.0, switch: self.switch_config() })
    }

    fn hierarchy_cell(&self, group: u32, event: u32, cpu: u32) -> Option<&AtomicReading> {
        if group >= self.config.max_groups || event >= self.config.num_events {
            return None;
        }
        let index = hierarchy_bucket(group, event, self.config.num_events) as usize;
        self.cpus.get(cpu as usize)?.hierarchy_buckets.get(index)
    }

    /// One cpu's bucket for (group, event)
    pub fn hierarchy_reading(&self, group: u32, event: u32, cpu: CpuId) -> Option<CounterReading> {
        self.hierarchy_cell(group, event, cpu.0).map(AtomicReading::load)
    }

    /// Sum of (group, event) over every cpu
    pub fn hierarchy_total(&self, group: u32, event: u32) -> CounterReading {
        let mut total = CounterReading::ZERO;
        for cpu in 0..self.config.num_cpus {
            if let Some(cell) = self.hierarchy_cell(group, event, cpu) {
                total.accumulate(&cell.load());
            }
        }
        total
    }

    pub fn lineage_reading(&self, key: u32, event: u32) -> Option<CounterReading> {
        self.buckets.get(key, event)
    }

    pub fn diagnostics(&self) -> &DiagCounters {
        &self.diag
    }
}

/// Exclusive access to one cpu's per-cpu tables
///
/// Dropping the handle releases the claim.
pub struct CpuHandle<'a> {
    tables: &'a Tables,
    cpu: u32,
    switch: SwitchConfig,
}

impl CpuHandle<'_> {
    pub fn cpu(&self) -> CpuId {
        CpuId(self.cpu)
    }

    fn cpu_tables(&self) -> &CpuTables {
        &self.tables.cpus[self.cpu as usize]
    }

    /// `sched_switch` of the cgroup collector
    pub fn on_switch_hierarchy<A, C>(&mut self, ancestry: &A, source: &C) -> SwitchReport
    where
        A: CgroupAncestry,
        C: CounterSource,
    {
        let tables = self.tables;
        let cpu = self.cpu_tables();
        let mut snapshots = CpuSnapshots(&cpu.hierarchy_snapshots);
        let mut buckets = CpuBuckets {
            slab: &cpu.hierarchy_buckets,
            num_events: tables.config.num_events,
            max_groups: tables.config.max_groups,
        };
        on_switch_hierarchy(
            &self.switch,
            self.cpu,
            ancestry,
            &tables.registry,
            source,
            &mut snapshots,
            &mut buckets,
            &tables.diag,
        )
    }

    /// `sched_switch` of the lineage collector; `tid` is the outgoing task
    pub fn on_switch_lineage<C: CounterSource>(&mut self, tid: Tid, source: &C) -> SwitchReport {
        let tables = self.tables;
        let mut snapshots = CpuSnapshots(&self.cpu_tables().lineage_snapshots);
        on_switch_lineage(
            &self.switch,
            self.cpu,
            tid.0,
            &tables.filter,
            source,
            &mut snapshots,
            &tables.buckets,
            &tables.diag,
        )
    }
}

impl Drop for CpuHandle<'_> {
    fn drop(&mut self) {
        self.cpu_tables().claimed.store(false, Ordering::Release);
    }
}
