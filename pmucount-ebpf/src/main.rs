//! # eBPF Kernel-Side Counting
//!
//! Scheduler hooks that fold hardware counter deltas into per-group buckets.
//!
//! ## Programs
//!
//! - **Raw tracepoint**: `cgroup_switch` - cgroup collector, one run per `sched_switch`
//! - **Raw tracepoint**: `lineage_switch` - lineage collector, one run per `sched_switch`
//! - **BTF tracepoint**: `lineage_newtask` - child inherits the creator's accumulation key
//!
//! Userspace attaches either the cgroup program or the two lineage programs.
//!
//! ## Maps (Shared with Userspace)
//!
//! - `PMU_EVENTS` - perf event fds indexed by Event Slot (`event * num_cpus + cpu`)
//! - `CGROUP_INDEX` - cgroup id → dense group key
//! - `CGROUP_READINGS` - per-cpu hierarchy buckets (`group * num_events + event`)
//! - `LINEAGE_FILTER` - task id → accumulation key
//! - `LINEAGE_READINGS` - per-cpu partial sums per (accumulation key, event)
//! - `DIAGNOSTICS` - per-cpu count of swallowed failures per `Diag` kind
//!
//! ## Build
//!
//! ```bash
//! cargo xtask build-ebpf
//! ```

#![no_std]
#![no_main]
#![allow(unused_unsafe)]

mod tables;

use aya_ebpf::{
    helpers::{bpf_get_current_pid_tgid, bpf_get_smp_processor_id},
    macros::{btf_tracepoint, map, raw_tracepoint},
    maps::{HashMap, PerCpuArray, PerCpuHashMap, PerfEventArray},
    programs::{BtfTracePointContext, RawTracePointContext},
};
use aya_log_ebpf::{debug, warn};
use pmucount_common::{
    on_switch_hierarchy, on_switch_lineage, propagate_lineage, CounterReading, KernelLayout,
    LineageBucketKey, LineageOutcome, Snapshot, SwitchConfig, DEFAULT_MAX_GROUPS, DIAG_KINDS,
    MAX_CGROUP_ENTRIES, MAX_EVENTS, MAX_FILTER_ENTRIES, MAX_LEVELS, MAX_LINEAGE_KEYS,
};

use tables::{
    CgroupIndex, CgroupReadings, CpuSnapshots, LineageReadings, MapDiagnostics, PerfCounters,
    TaskAncestry, TaskFilter,
};

// ============================================================================
// Load-time configuration (read-only globals, set with `EbpfLoader::set_global`)
// ============================================================================

/// Number of logical events tracked, `<= MAX_EVENTS`
#[no_mangle]
static NUM_EVENTS: u32 = 0;

/// Number of possible cpus, stride of the Event Slot key
#[no_mangle]
static NUM_CPUS: u32 = 1;

/// Output capacity of the hierarchy resolver
#[no_mangle]
static MAX_GROUPS: u32 = MAX_LEVELS as u32;

/// Struct offsets discovered from the running kernel's BTF
#[no_mangle]
static KERNEL_LAYOUT: KernelLayout = KernelLayout::zeroed();

fn switch_config() -> SwitchConfig {
    // userspace rewrites these in .rodata at load time
    let num_events = unsafe { core::ptr::read_volatile(&NUM_EVENTS) };
    let num_cpus = unsafe { core::ptr::read_volatile(&NUM_CPUS) };
    let max_groups = unsafe { core::ptr::read_volatile(&MAX_GROUPS) };

    SwitchConfig {
        num_events: if num_events < MAX_EVENTS { num_events } else { MAX_EVENTS },
        num_cpus,
        max_groups: max_groups as usize,
    }
}

fn kernel_layout() -> KernelLayout {
    unsafe { core::ptr::read_volatile(&KERNEL_LAYOUT) }
}

// ============================================================================
// eBPF Maps - Shared data structures between kernel and userspace
// ============================================================================

/// Counting perf events, one per Event Slot
///
/// Sized by userspace to `num_events * num_cpus` at load time.
#[map]
static PMU_EVENTS: PerfEventArray<u32> = PerfEventArray::with_max_entries(1, 0);

/// Cgroup id → group key, populated before the programs are attached
#[map]
static CGROUP_INDEX: HashMap<u64, u32> = HashMap::with_max_entries(MAX_CGROUP_ENTRIES, 0);

/// Cgroup collector snapshots, one per event on every cpu
#[map]
static CGROUP_SNAPSHOTS: PerCpuArray<Snapshot> = PerCpuArray::with_max_entries(MAX_EVENTS, 0);

/// Hierarchy buckets, resized by userspace to `max_groups * num_events`
#[map]
static CGROUP_READINGS: PerCpuArray<CounterReading> =
    PerCpuArray::with_max_entries(DEFAULT_MAX_GROUPS * MAX_EVENTS, 0);

/// Lineage collector snapshots, one per event on every cpu
#[map]
static LINEAGE_SNAPSHOTS: PerCpuArray<Snapshot> = PerCpuArray::with_max_entries(MAX_EVENTS, 0);

/// Task id → accumulation key
#[map]
static LINEAGE_FILTER: HashMap<u32, u32> = HashMap::with_max_entries(MAX_FILTER_ENTRIES, 0);

/// Lineage buckets; each cpu holds its own partial sum, the reader merges
#[map]
static LINEAGE_READINGS: PerCpuHashMap<LineageBucketKey, CounterReading> =
    PerCpuHashMap::with_max_entries(MAX_LINEAGE_KEYS * MAX_EVENTS, 0);

/// Swallowed hot-path failures per kind
#[map]
static DIAGNOSTICS: PerCpuArray<u64> = PerCpuArray::with_max_entries(DIAG_KINDS, 0);

// ============================================================================
// eBPF Program Hooks
// ============================================================================

/// Hook: sched_switch, cgroup collector
///
/// Runs in the context of the outgoing task, before the switch happens.
#[raw_tracepoint(tracepoint = "sched_switch")]
pub fn cgroup_switch(ctx: RawTracePointContext) -> i32 {
    match try_cgroup_switch() {
        Ok(()) => 0,
        Err(e) => {
            debug!(&ctx, "cgroup_switch: {} bucket additions dropped", e);
            0
        }
    }
}

fn try_cgroup_switch() -> Result<(), u32> {
    let config = switch_config();
    let cpu = unsafe { bpf_get_smp_processor_id() };
    let ancestry = TaskAncestry::current(kernel_layout());
    let mut snapshots = CpuSnapshots(&CGROUP_SNAPSHOTS);
    let mut buckets = CgroupReadings { num_events: config.num_events };

    let report = on_switch_hierarchy(
        &config,
        cpu,
        &ancestry,
        &CgroupIndex,
        &PerfCounters,
        &mut snapshots,
        &mut buckets,
        &MapDiagnostics,
    );

    if report.dropped > 0 {
        return Err(report.dropped);
    }
    Ok(())
}

/// Hook: sched_switch, lineage collector
#[raw_tracepoint(tracepoint = "sched_switch")]
pub fn lineage_switch(ctx: RawTracePointContext) -> i32 {
    match try_lineage_switch() {
        Ok(()) => 0,
        Err(e) => {
            debug!(&ctx, "lineage_switch: {} bucket additions dropped", e);
            0
        }
    }
}

fn try_lineage_switch() -> Result<(), u32> {
    let config = switch_config();
    let cpu = unsafe { bpf_get_smp_processor_id() };
    let tid = unsafe { bpf_get_current_pid_tgid() } as u32;
    let mut snapshots = CpuSnapshots(&LINEAGE_SNAPSHOTS);

    let report = on_switch_lineage(
        &config,
        cpu,
        tid,
        &TaskFilter,
        &PerfCounters,
        &mut snapshots,
        &LineageReadings,
        &MapDiagnostics,
    );

    if report.dropped > 0 {
        return Err(report.dropped);
    }
    Ok(())
}

/// Hook: task_newtask(struct task_struct *task, unsigned long clone_flags)
///
/// Fires in the context of the creating task, so the current tid is the
/// parent and arg 0 is the child.
#[btf_tracepoint(function = "task_newtask")]
pub fn lineage_newtask(ctx: BtfTracePointContext) -> i32 {
    match try_lineage_newtask(&ctx) {
        Ok(LineageOutcome::Collision) => {
            warn!(&ctx, "new task id already tracked, kept existing key");
            0
        }
        Ok(_) => 0,
        Err(e) => {
            debug!(&ctx, "lineage_newtask: failed to read child pid: {}", e);
            0
        }
    }
}

fn try_lineage_newtask(ctx: &BtfTracePointContext) -> Result<LineageOutcome, i64> {
    let parent = unsafe { bpf_get_current_pid_tgid() } as u32;

    // cheap exit for the common case of an untracked creator
    if unsafe { LINEAGE_FILTER.get(&parent).is_none() } {
        return Ok(LineageOutcome::Untracked);
    }

    let task: *const u8 = unsafe { ctx.arg(0) };
    let child = tables::task_pid(task, &kernel_layout())?;

    Ok(propagate_lineage(&TaskFilter, &MapDiagnostics, parent, child))
}

#[cfg(all(not(test), target_arch = "bpf"))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}

#[link_section = "license"]
#[no_mangle]
static LICENSE: [u8; 4] = *b"GPL\0";
