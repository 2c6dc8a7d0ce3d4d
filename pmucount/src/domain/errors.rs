//! Structured error types for pmucount
//!
//! Using thiserror for automatic Display implementation and error chaining.
//! Hot-path failures never show up here; they are counted as diagnostics.

use super::types::{CgroupId, CpuId, Pid, Tid};
use std::path::PathBuf;
use thiserror::Error;

/// Control-plane failures of a live counting session
#[derive(Error, Debug)]
pub enum CountingError {
    #[error("{0}")]
    Preflight(String),

    #[error("eBPF object not found at {0} (build it with: cargo xtask build-ebpf)")]
    EbpfObjectMissing(PathBuf),

    #[error("eBPF program {0} not found in object")]
    ProgramNotFound(&'static str),

    #[error("eBPF map {0} not found in object")]
    MapNotFound(&'static str),

    #[error("Failed to open {event} on {cpu}: {source}")]
    PerfOpen {
        event: String,
        cpu: CpuId,
        #[source]
        source: std::io::Error,
    },

    #[error("{op} failed: {source}")]
    Syscall {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("Cgroup not found: {0}")]
    CgroupNotFound(PathBuf),

    #[error("{0} is not a cgroup v2 mount (missing cgroup.controllers)")]
    NotCgroupV2(PathBuf),

    #[error("Group key space exhausted: at most {0} cgroups can be registered")]
    TooManyGroups(u32),

    #[error("Process {0} not found")]
    ProcessNotFound(Pid),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Layout(#[from] LayoutError),

    #[error(transparent)]
    Table(#[from] TableError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Aya(#[from] aya::EbpfError),

    #[error(transparent)]
    Map(#[from] aya::maps::MapError),

    #[error(transparent)]
    Program(#[from] aya::programs::ProgramError),

    #[error(transparent)]
    Btf(#[from] aya::BtfError),
}

/// Invalid command-line or file configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required argument: at least one event (-e cycles,instructions)")]
    NoEvents,

    #[error("Too many events: {count} given, at most {max} supported")]
    TooManyEvents { count: usize, max: u32 },

    #[error("Unknown event: {0} (see --help for the event list, or use r<hex> for raw)")]
    UnknownEvent(String),

    #[error("Missing required argument: at least one --cgroup")]
    NoCgroups,

    #[error("Missing required argument: at least one --pid")]
    NoPids,

    #[error("Too many cgroups: {count} given, at most {max} supported")]
    TooManyCgroups { count: usize, max: u32 },

    #[error("--interval must be greater than zero")]
    ZeroInterval,

    #[error("Invalid layout override {path}: {source}")]
    InvalidLayout {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Unknown ancestry kind {0:?} (expected \"ids\", \"pointers\" or \"none\")")]
    UnknownAncestry(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Kernel struct layout discovery failures
#[derive(Error, Debug)]
pub enum LayoutError {
    #[error("Invalid BTF magic {0:#06x}")]
    BadMagic(u16),

    #[error("Truncated BTF data while reading {0}")]
    Truncated(&'static str),

    #[error("Unknown BTF kind {0}")]
    UnknownKind(u32),

    #[error("Kernel BTF has no struct {0}")]
    MissingStruct(&'static str),

    #[error("Kernel BTF has no member {member} in struct {strukt}")]
    MissingMember { strukt: &'static str, member: &'static str },

    #[error("Kernel BTF has no enumerator {0}")]
    MissingEnumerator(&'static str),

    #[error("Member {member} of struct {strukt} is a bitfield")]
    Bitfield { strukt: &'static str, member: &'static str },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Replay trace failures
#[derive(Error, Debug)]
pub enum ReplayError {
    #[error("Event on cpu {cpu} but the trace only has {num_cpus} cpus")]
    CpuOutOfRange { cpu: u32, num_cpus: u32 },

    #[error("Switch on cpu {cpu} carries {got} readings, expected {expected}")]
    ReadingCountMismatch { cpu: u32, expected: usize, got: usize },

    #[error("Switch references cgroup {0} missing from the trace's cgroup tree")]
    UnknownCgroup(CgroupId),

    #[error("Switch on cpu {0} names no cgroup (required in cgroup mode)")]
    MissingCgroup(u32),

    #[error("Trace needs 1..={max} events, has {got}")]
    BadEventCount { got: u32, max: u32 },

    #[error("Trace must have at least one cpu")]
    NoCpus,

    #[error("Trace has {got} cpus, at most {max} are supported")]
    TooManyCpus { got: u32, max: u32 },

    #[error("Replay worker for cpu {0} panicked")]
    WorkerPanicked(u32),

    #[error(transparent)]
    Table(#[from] TableError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// In-process table arena failures
#[derive(Error, Debug, PartialEq, Eq)]
pub enum TableError {
    #[error("{0} is already claimed by another handle")]
    CpuClaimed(CpuId),

    #[error("{cpu} out of range (tables sized for {num_cpus} cpus)")]
    CpuOutOfRange { cpu: CpuId, num_cpus: u32 },

    #[error("Cgroup registration table full")]
    RegistryFull,

    #[error("{cgroup} already registered as key {existing}, refusing key {requested}")]
    RegistryConflict { cgroup: CgroupId, existing: u32, requested: u32 },

    #[error("Lineage filter table full")]
    FilterFull,

    #[error("{tid} already tracked under key {key}")]
    AlreadyTracked { tid: Tid, key: u32 },

    #[error("Thread id 0 (the idle task) cannot be tracked")]
    ReservedTid,
}
