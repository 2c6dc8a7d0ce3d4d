//! # pmucount - Hardware Counters per Cgroup and Process Tree
//!
//! pmucount attributes CPU performance counter deltas to logical groups by
//! observing the scheduler. On every context switch the outgoing task's
//! counters are read, diffed against the previous reading on that cpu, and
//! the delta is added to the groups the task belongs to.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     eBPF Programs (Kernel)                      │
//! │  • Raw tracepoint: sched_switch (cgroup_switch/lineage_switch)  │
//! │  • BTF tracepoint: task_newtask (lineage_newtask)               │
//! │  • Perf event array: one counter per (event, cpu)               │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ per-cpu buckets
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    pmucount (This Crate)                        │
//! │                                                                 │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐         │
//! │  │   Counting   │──▶│    Report    │──▶│ table / JSON │         │
//! │  │  (session)   │   │  (samples)   │   │              │         │
//! │  └──────────────┘   └──────────────┘   └──────────────┘         │
//! │                            ▲                                    │
//! │  ┌──────────────┐   ┌──────┴───────┐                            │
//! │  │    Replay    │──▶│    Arena     │                            │
//! │  │   (traces)   │   │ (in-process) │                            │
//! │  └──────────────┘   └──────────────┘                            │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The per-switch bookkeeping lives in `pmucount-common` and is shared by
//! the eBPF programs and the in-process [`arena`].
//!
//! ## Module Structure
//!
//! - [`counting`]: live sessions against the kernel
//!   - `perf`: one disabled counting perf event per (event, cpu)
//!   - `btf`: kernel struct offsets from `/sys/kernel/btf/vmlinux`
//!   - `ebpf_setup`: load the object with its globals, attach collectors
//!   - `session`: register, track, flush, read and reset
//! - [`arena`]: the same tables over pre-allocated atomics
//! - [`replay`]: JSON traces of switches and forks, one worker per cpu
//! - [`report`]: samples, scaling, text table and JSON export
//! - [`cli`], [`config`]: command line and validated run configuration
//! - [`events`]: event names to perf `(type, config)`
//! - [`preflight`]: privilege and kernel checks
//! - [`domain`]: core domain types (Pid, Tid, CpuId, CgroupId) and errors
//!
//! ## Modes
//!
//! 1. **Cgroup**: a switch counts towards the task's cgroup and every
//!    registered ancestor, up to `MAX_LEVELS` levels up
//! 2. **Process**: a tracked pid is an accumulation key; threads and children
//!    created after tracking starts inherit it
//!
//! ## Typical Usage
//!
//! ```bash
//! sudo pmucount cgroup --cgroup system.slice -e cycles,instructions
//! sudo pmucount process --pid 1234 -e cycles --per-cpu
//! pmucount replay trace.json
//! ```
//!
//! ## Key Concepts
//!
//! - **Event Slot**: flattened `(event, cpu)` index into the perf event array
//! - **Snapshot**: the last reading of a slot; the first reading only primes it
//! - **Multiplexing**: with more events than PMU counters, `running < enabled`
//!   and counts are scaled by `enabled / running`

pub mod arena;
pub mod cli;
pub mod config;
pub mod counting;
pub mod domain;
pub mod events;
pub mod preflight;
pub mod replay;
pub mod report;
