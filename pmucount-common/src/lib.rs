//! # Shared Counting Core (eBPF ↔ Userspace)
//!
//! Data structures, table-key helpers and the counting engine shared between
//! the kernel-side eBPF programs and userspace. All types crossing the
//! kernel/userspace boundary use `#[repr(C)]`.
//!
//! ## Collectors
//!
//! Both collectors follow the same "snapshot, diff, attribute, accumulate" loop
//! on every `sched_switch`:
//!
//! 1. **Cgroup collector** - resolve the outgoing task's registered cgroup
//!    ancestors ([`hierarchy`]), diff every tracked counter ([`delta`]) and add
//!    the delta into one per-cpu bucket per ancestor ([`accumulate`]).
//! 2. **Lineage collector** - look up the outgoing task's accumulation key
//!    ([`lineage`]), diff every tracked counter and add the delta into the key's
//!    cross-cpu bucket. On `task_newtask` the child inherits its parent's key.
//!
//! The engine is written once against the table traits in [`tables`]; the eBPF
//! crate implements them over BPF maps and `pmucount::arena` implements them
//! over pre-allocated atomics for replay and tests.
//!
//! ## Key Types
//!
//! - [`CounterReading`] - `{value, enabled, running}` triple, layout of `bpf_perf_event_value`
//! - [`Snapshot`] - last reading seen for an (event, cpu) pair
//! - [`LineageBucketKey`] - (accumulation key, event) bucket address
//! - [`KernelLayout`] - struct offsets discovered from BTF for cgroup ancestry

#![cfg_attr(not(test), no_std)]

pub mod accumulate;
pub mod delta;
pub mod diag;
pub mod hierarchy;
pub mod lineage;
pub mod switch;
pub mod tables;

#[cfg(test)]
mod testing;

pub use accumulate::{accumulate_hierarchy, accumulate_lineage, AccumulateError};
pub use delta::{advance_snapshot, DeltaOutcome};
pub use diag::{Diag, Diagnostics, DIAG_KINDS};
pub use hierarchy::{resolve_groups, AncestryError, GroupList};
pub use lineage::{propagate_lineage, InsertError, LineageOutcome};
pub use switch::{on_switch_hierarchy, on_switch_lineage, SwitchConfig, SwitchReport};
pub use tables::{
    CgroupAncestry, CgroupRegistry, CounterSource, HierarchyBuckets, LineageBuckets,
    LineageFilter, SnapshotTable,
};

// ============================================================================
// Limits
// ============================================================================

/// Maximum cgroup ancestry depth considered per switch
pub const MAX_LEVELS: usize = 10;

/// Maximum number of logical events tracked per cpu
pub const MAX_EVENTS: u32 = 128;

/// Capacity of the cgroup registration table (cgroup id → group key)
pub const MAX_CGROUP_ENTRIES: u32 = 102_400;

/// Capacity of the lineage filter table (task id → accumulation key)
pub const MAX_FILTER_ENTRIES: u32 = 102_400;

/// Maximum number of distinct accumulation keys in lineage mode
pub const MAX_LINEAGE_KEYS: u32 = 1024;

/// Default number of dense cgroup keys the hierarchy bucket table is sized for
pub const DEFAULT_MAX_GROUPS: u32 = 1024;

// ============================================================================
// Table keys
// ============================================================================

/// Flattened Event Slot key: `{evt0, cpu0}, {evt0, cpu1} ... {evt1, cpu0} ...`
#[inline(always)]
#[must_use]
pub const fn event_slot(event: u32, cpu: u32, num_cpus: u32) -> u32 {
    event * num_cpus + cpu
}

/// Flattened hierarchy bucket key: `{grp0, evt0}, {grp0, evt1} ... {grp1, evt0} ...`
#[inline(always)]
#[must_use]
pub const fn hierarchy_bucket(group: u32, event: u32, num_events: u32) -> u32 {
    group * num_events + event
}

/// Address of one lineage-mode bucket
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LineageBucketKey {
    /// Representative task id of the family
    pub accum_key: u32,
    /// Logical event index
    pub event: u32,
}

// ============================================================================
// Counter values
// ============================================================================

/// One reading of a counting perf event
///
/// **Memory Layout**: identical to the kernel's `struct bpf_perf_event_value`
/// (`counter`, `enabled`, `running`) so it can be handed straight to
/// `bpf_perf_event_read_value`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CounterReading {
    /// Raw event count
    pub value: u64,
    /// Total time the event was enabled (schedulable), nanoseconds
    pub enabled: u64,
    /// Total time the event was actually on a hardware counter, nanoseconds
    pub running: u64,
}

impl CounterReading {
    pub const ZERO: Self = Self { value: 0, enabled: 0, running: 0 };

    #[inline(always)]
    #[must_use]
    pub const fn new(value: u64, enabled: u64, running: u64) -> Self {
        Self { value, enabled, running }
    }

    /// Component-wise `self - earlier`
    ///
    /// Wrapping, so a counter that was reset underneath us yields a huge value
    /// instead of trapping inside the kernel.
    #[inline(always)]
    #[must_use]
    pub const fn delta_since(&self, earlier: &Self) -> Self {
        Self {
            value: self.value.wrapping_sub(earlier.value),
            enabled: self.enabled.wrapping_sub(earlier.enabled),
            running: self.running.wrapping_sub(earlier.running),
        }
    }

    /// Component-wise `self += delta`
    #[inline(always)]
    pub fn accumulate(&mut self, delta: &Self) {
        self.value = self.value.wrapping_add(delta.value);
        self.enabled = self.enabled.wrapping_add(delta.enabled);
        self.running = self.running.wrapping_add(delta.running);
    }

    #[inline(always)]
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.value == 0 && self.enabled == 0 && self.running == 0
    }
}

/// Last reading seen for one (event, cpu) pair
///
/// `primed == 0` means no reading has been observed yet; the first reading only
/// primes the snapshot and contributes no delta.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub reading: CounterReading,
    pub primed: u64,
}

impl Snapshot {
    #[must_use]
    pub const fn primed_with(reading: CounterReading) -> Self {
        Self { reading, primed: 1 }
    }

    #[must_use]
    pub const fn is_primed(&self) -> bool {
        self.primed != 0
    }
}

// ============================================================================
// Kernel layout
// ============================================================================

/// Ancestry field is missing on this kernel; the hierarchy resolver fails soft
pub const ANCESTRY_UNAVAILABLE: u32 = 0;

/// `struct cgroup` has `u64 ancestor_ids[]` (kernels before 5.18)
pub const ANCESTRY_IDS: u32 = 1;

/// `struct cgroup` has `struct cgroup *ancestors[]`, id read via `kn->id`
pub const ANCESTRY_POINTERS: u32 = 2;

/// Byte offsets needed to walk `current->cgroups->subsys[perf_event]->cgroup`
///
/// Populated by userspace from `/sys/kernel/btf/vmlinux` and loaded into the
/// `KERNEL_LAYOUT` read-only global of the eBPF object. Offsets are plain byte
/// offsets from the start of the containing struct.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KernelLayout {
    /// `task_struct.pid` (`pid_t`, the thread id)
    pub task_pid: u32,
    /// `task_struct.cgroups` (`struct css_set *`)
    pub task_cgroups: u32,
    /// `css_set.subsys[perf_event_cgrp_id]`, index already folded in
    pub css_set_perf_subsys: u32,
    /// `cgroup_subsys_state.cgroup`
    pub css_cgroup: u32,
    /// `cgroup.level` (`int`)
    pub cgroup_level: u32,
    /// `cgroup.ancestor_ids` or `cgroup.ancestors`, see `ancestry_kind`
    pub cgroup_ancestors: u32,
    /// `cgroup.kn` (only for [`ANCESTRY_POINTERS`])
    pub cgroup_kn: u32,
    /// `kernfs_node.id` (only for [`ANCESTRY_POINTERS`])
    pub kernfs_id: u32,
    /// One of [`ANCESTRY_UNAVAILABLE`], [`ANCESTRY_IDS`], [`ANCESTRY_POINTERS`]
    pub ancestry_kind: u32,
}

impl KernelLayout {
    /// Nothing discovered; every kernel walk fails soft
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            task_pid: 0,
            task_cgroups: 0,
            css_set_perf_subsys: 0,
            css_cgroup: 0,
            cgroup_level: 0,
            cgroup_ancestors: 0,
            cgroup_kn: 0,
            kernfs_id: 0,
            ancestry_kind: ANCESTRY_UNAVAILABLE,
        }
    }

    #[must_use]
    pub const fn has_ancestry(&self) -> bool {
        self.ancestry_kind != ANCESTRY_UNAVAILABLE
    }
}

#[cfg(feature = "user")]
use aya::Pod;

// These unsafe impls are required for eBPF <-> userspace communication
// Pod trait ensures types can be safely transmitted as plain bytes
#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for CounterReading {}

#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for Snapshot {}

#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for LineageBucketKey {}

#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for KernelLayout {}
