//! Counting-engine table traits over BPF maps and kernel memory

use aya_ebpf::{
    bindings::bpf_perf_event_value,
    cty::c_void,
    helpers::{bpf_get_current_task, bpf_probe_read_kernel, gen},
    maps::PerCpuArray,
};
use pmucount_common::{
    hierarchy_bucket, AccumulateError, AncestryError, CgroupAncestry, CgroupRegistry,
    CounterReading, CounterSource, Diag, Diagnostics, HierarchyBuckets, InsertError,
    KernelLayout, LineageBucketKey, LineageBuckets, LineageFilter, Snapshot, SnapshotTable,
    ANCESTRY_IDS, ANCESTRY_POINTERS,
};

use crate::{
    CGROUP_INDEX, CGROUP_READINGS, DIAGNOSTICS, LINEAGE_FILTER, LINEAGE_READINGS, PMU_EVENTS,
};

const BPF_NOEXIST: u64 = 1;
const EEXIST: i64 = 17;

/// `bpf_perf_event_read_value` only accepts the index part of the flags
const BPF_F_INDEX_MASK: u64 = 0xffff_ffff;

// ============================================================================
// Counter source
// ============================================================================

pub struct PerfCounters;

impl CounterSource for PerfCounters {
    #[inline(always)]
    fn read(&self, slot: u32) -> Option<CounterReading> {
        let mut reading = CounterReading::ZERO;
        let ret = unsafe {
            gen::bpf_perf_event_read_value(
                &PMU_EVENTS as *const _ as *mut c_void,
                u64::from(slot) & BPF_F_INDEX_MASK,
                &mut reading as *mut CounterReading as *mut bpf_perf_event_value,
                core::mem::size_of::<CounterReading>() as u32,
            )
        };
        if ret == 0 {
            Some(reading)
        } else {
            None
        }
    }
}

// ============================================================================
// Per-cpu tables
// ============================================================================

pub struct CpuSnapshots(pub &'static PerCpuArray<Snapshot>);

impl SnapshotTable for CpuSnapshots {
    #[inline(always)]
    fn load(&self, event: u32) -> Option<Snapshot> {
        let ptr = unsafe { self.0.get_ptr(event) }?;
        Some(unsafe { *ptr })
    }

    #[inline(always)]
    fn store(&mut self, event: u32, snapshot: &Snapshot) -> bool {
        match unsafe { self.0.get_ptr_mut(event) } {
            Some(ptr) => {
                unsafe { *ptr = *snapshot };
                true
            }
            None => false,
        }
    }
}

pub struct CgroupReadings {
    pub num_events: u32,
}

impl HierarchyBuckets for CgroupReadings {
    #[inline(always)]
    fn add(
        &mut self,
        group: u32,
        event: u32,
        delta: &CounterReading,
    ) -> Result<(), AccumulateError> {
        let index = hierarchy_bucket(group, event, self.num_events);
        let ptr = unsafe { CGROUP_READINGS.get_ptr_mut(index) }.ok_or(AccumulateError::Capacity)?;
        unsafe { (*ptr).accumulate(delta) };
        Ok(())
    }
}

pub struct LineageReadings;

impl LineageBuckets for LineageReadings {
    #[inline(always)]
    fn add(
        &self,
        accum_key: u32,
        event: u32,
        delta: &CounterReading,
    ) -> Result<(), AccumulateError> {
        let key = LineageBucketKey { accum_key, event };

        // per-cpu value: no other cpu touches this copy
        if let Some(ptr) = unsafe { LINEAGE_READINGS.get_ptr_mut(&key) } {
            unsafe { (*ptr).accumulate(delta) };
            return Ok(());
        }

        LINEAGE_READINGS
            .insert(&key, delta, BPF_NOEXIST)
            .map_err(|_| AccumulateError::Capacity)
    }
}

pub struct MapDiagnostics;

impl Diagnostics for MapDiagnostics {
    #[inline(always)]
    fn record(&self, diag: Diag) {
        if let Some(ptr) = unsafe { DIAGNOSTICS.get_ptr_mut(diag.index()) } {
            unsafe { *ptr += 1 };
        }
    }
}

// ============================================================================
// Registration and lineage tables
// ============================================================================

pub struct CgroupIndex;

impl CgroupRegistry for CgroupIndex {
    #[inline(always)]
    fn group_of(&self, cgroup_id: u64) -> Option<u32> {
        unsafe { CGROUP_INDEX.get(&cgroup_id).copied() }
    }
}

pub struct TaskFilter;

impl LineageFilter for TaskFilter {
    #[inline(always)]
    fn key_of(&self, tid: u32) -> Option<u32> {
        unsafe { LINEAGE_FILTER.get(&tid).copied() }
    }

    #[inline(always)]
    fn insert_new(&self, tid: u32, key: u32) -> Result<(), InsertError> {
        LINEAGE_FILTER.insert(&tid, &key, BPF_NOEXIST).map_err(|e| {
            if e == -EEXIST {
                InsertError::Exists
            } else {
                InsertError::Full
            }
        })
    }
}

// ============================================================================
// Cgroup ancestry of the current task
// ============================================================================

#[inline(always)]
fn read_field<T: Copy>(base: *const u8, offset: u32) -> Result<T, AncestryError> {
    if base.is_null() {
        return Err(AncestryError::Fault);
    }
    let ptr = unsafe { base.add(offset as usize) as *const T };
    unsafe { bpf_probe_read_kernel(ptr) }.map_err(|_| AncestryError::Fault)
}

#[inline(always)]
fn read_ptr(base: *const u8, offset: u32) -> Result<*const u8, AncestryError> {
    let addr: usize = read_field(base, offset)?;
    if addr == 0 {
        return Err(AncestryError::Fault);
    }
    Ok(addr as *const u8)
}

/// `task->pid` of an arbitrary task
#[inline(always)]
pub fn task_pid(task: *const u8, layout: &KernelLayout) -> Result<u32, i64> {
    if layout.task_pid == 0 {
        return Err(-1);
    }
    let pid: i32 = read_field(task, layout.task_pid).map_err(|_| -14i64)?;
    Ok(pid as u32)
}

/// perf_event cgroup of `current`, resolved once per switch
pub struct TaskAncestry {
    cgroup: Result<*const u8, AncestryError>,
    layout: KernelLayout,
}

impl TaskAncestry {
    #[inline(always)]
    pub fn current(layout: KernelLayout) -> Self {
        let cgroup = if layout.has_ancestry() {
            let task = unsafe { bpf_get_current_task() } as *const u8;
            Self::perf_cgroup(task, &layout)
        } else {
            Err(AncestryError::Unavailable)
        };
        Self { cgroup, layout }
    }

    /// `task->cgroups->subsys[perf_event_cgrp_id]->cgroup`
    #[inline(always)]
    fn perf_cgroup(task: *const u8, layout: &KernelLayout) -> Result<*const u8, AncestryError> {
        let css_set = read_ptr(task, layout.task_cgroups)?;
        let css = read_ptr(css_set, layout.css_set_perf_subsys)?;
        read_ptr(css, layout.css_cgroup)
    }
}

impl CgroupAncestry for TaskAncestry {
    #[inline(always)]
    fn depth(&self) -> Result<u32, AncestryError> {
        let cgroup = self.cgroup?;
        let level: i32 = read_field(cgroup, self.layout.cgroup_level)?;
        if level < 0 {
            return Err(AncestryError::Fault);
        }
        Ok(level as u32)
    }

    #[inline(always)]
    fn ancestor_id(&self, level: u32) -> Result<u64, AncestryError> {
        let cgroup = self.cgroup?;
        let slot = self.layout.cgroup_ancestors + level * 8;

        match self.layout.ancestry_kind {
            ANCESTRY_IDS => read_field(cgroup, slot),
            ANCESTRY_POINTERS => {
                let ancestor = read_ptr(cgroup, slot)?;
                let kn = read_ptr(ancestor, self.layout.cgroup_kn)?;
                read_field(kn, self.layout.kernfs_id)
            }
            _ => Err(AncestryError::Unavailable),
        }
    }
}
