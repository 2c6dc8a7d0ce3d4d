//! # eBPF Program Loading and Attachment
//!
//! Loads the compiled object with its load-time globals and table sizes, and
//! attaches the programs of one collector.
//!
//! ## Attachment Points
//!
//! - **Raw tracepoint**: `sched_switch` (`cgroup_switch` or `lineage_switch`)
//! - **BTF tracepoint**: `task_newtask` (`lineage_newtask`, process mode only)

use aya::{
    maps::Map,
    programs::{BtfTracePoint, RawTracePoint},
    Btf, Ebpf, EbpfLoader,
};
use aya_log::EbpfLogger;
use log::{info, warn};
use pmucount_common::{KernelLayout, MAX_LEVELS};
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::path::Path;

use crate::domain::{CountingError, Mode};

pub const CGROUP_SWITCH: &str = "cgroup_switch";
pub const LINEAGE_SWITCH: &str = "lineage_switch";
pub const LINEAGE_NEWTASK: &str = "lineage_newtask";

pub const PMU_EVENTS: &str = "PMU_EVENTS";
pub const CGROUP_INDEX: &str = "CGROUP_INDEX";
pub const CGROUP_READINGS: &str = "CGROUP_READINGS";
pub const LINEAGE_FILTER: &str = "LINEAGE_FILTER";
pub const LINEAGE_READINGS: &str = "LINEAGE_READINGS";
pub const DIAGNOSTICS: &str = "DIAGNOSTICS";

/// Values baked into the object at load time
#[derive(Debug, Clone, Copy)]
pub struct LoadParams {
    pub num_events: u32,
    pub num_cpus: u32,
    /// Dense group keys, sizes `CGROUP_READINGS`
    pub max_groups: u32,
    /// Groups resolved per switch, at most `MAX_LEVELS`
    pub resolver_limit: u32,
    pub layout: KernelLayout,
}

impl LoadParams {
    pub fn new(num_events: u32, num_cpus: u32, max_groups: u32, layout: KernelLayout) -> Self {
        let resolver_limit = u32::try_from(MAX_LEVELS).unwrap_or(u32::MAX);
        Self { num_events, num_cpus, max_groups, resolver_limit, layout }
    }

    fn pmu_slots(&self) -> u32 {
        (self.num_events * self.num_cpus).max(1)
    }

    fn cgroup_buckets(&self) -> u32 {
        (self.max_groups * self.num_events).max(1)
    }
}

#[cfg(feature = "embed-bpf")]
fn embedded_object() -> &'static [u8] {
    aya::include_bytes_aligned!(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/../target/bpfel-unknown-none/release/pmucount"
    ))
}

fn loader(params: &LoadParams) -> EbpfLoader<'_> {
    let mut loader = EbpfLoader::new();
    loader
        .set_global("NUM_EVENTS", &params.num_events, true)
        .set_global("NUM_CPUS", &params.num_cpus, true)
        .set_global("MAX_GROUPS", &params.resolver_limit, true)
        .set_global("KERNEL_LAYOUT", &params.layout, true)
        .set_max_entries(PMU_EVENTS, params.pmu_slots())
        .set_max_entries(CGROUP_READINGS, params.cgroup_buckets());
    loader
}

/// Load the eBPF object
///
/// Always the release build: debug builds of the object pull in formatting
/// code the verifier rejects. With the `embed-bpf` feature the object
/// compiled into the binary is used and `path` is ignored.
///
/// # Errors
/// [`CountingError::EbpfObjectMissing`] or the loader's error.
pub fn load_ebpf(path: &Path, params: &LoadParams) -> Result<Ebpf, CountingError> {
    #[cfg(feature = "embed-bpf")]
    {
        let _ = path;
        return Ok(loader(params).load(embedded_object())?);
    }

    #[cfg(not(feature = "embed-bpf"))]
    {
        if !path.is_file() {
            return Err(CountingError::EbpfObjectMissing(path.to_path_buf()));
        }
        info!("loading eBPF object {}", path.display());
        Ok(loader(params).load_file(path)?)
    }
}

/// Initialize eBPF logger
pub fn init_ebpf_logger(bpf: &mut Ebpf) {
    if let Err(e) = EbpfLogger::init(bpf) {
        warn!("Failed to initialize eBPF logger: {e}");
    }
}

/// Attach a collector's `sched_switch` program
///
/// # Errors
/// [`CountingError::ProgramNotFound`] or load/attach failures.
pub fn attach_switch(bpf: &mut Ebpf, name: &'static str) -> Result<(), CountingError> {
    let program: &mut RawTracePoint =
        bpf.program_mut(name).ok_or(CountingError::ProgramNotFound(name))?.try_into()?;
    program.load()?;
    program.attach("sched_switch")?;
    info!("✓ Attached raw tracepoint: sched_switch ({name})");
    Ok(())
}

/// Attach the lineage propagation program to `task_newtask`
///
/// # Errors
/// [`CountingError::ProgramNotFound`], BTF or load/attach failures.
pub fn attach_newtask(bpf: &mut Ebpf) -> Result<(), CountingError> {
    let btf = Btf::from_sys_fs()?;
    let program: &mut BtfTracePoint = bpf
        .program_mut(LINEAGE_NEWTASK)
        .ok_or(CountingError::ProgramNotFound(LINEAGE_NEWTASK))?
        .try_into()?;
    program.load("task_newtask", &btf)?;
    program.attach()?;
    info!("✓ Attached BTF tracepoint: task_newtask");
    Ok(())
}

/// Attach every program of `mode`'s collector
///
/// # Errors
/// See [`attach_switch`] and [`attach_newtask`].
pub fn attach_collector(bpf: &mut Ebpf, mode: Mode) -> Result<(), CountingError> {
    match mode {
        Mode::Cgroup => attach_switch(bpf, CGROUP_SWITCH),
        Mode::Process => {
            // propagation first so no child created in between is missed
            attach_newtask(bpf)?;
            attach_switch(bpf, LINEAGE_SWITCH)
        }
    }
}

/// The `sched_switch` program of `mode`
pub fn switch_program(mode: Mode) -> &'static str {
    match mode {
        Mode::Cgroup => CGROUP_SWITCH,
        Mode::Process => LINEAGE_SWITCH,
    }
}

/// Raw fd of the `PMU_EVENTS` perf event array
///
/// # Errors
/// [`CountingError::MapNotFound`] if the object has no such array.
pub fn pmu_events_fd(bpf: &Ebpf) -> Result<RawFd, CountingError> {
    match bpf.map(PMU_EVENTS) {
        Some(Map::PerfEventArray(data)) => Ok(data.fd().as_fd().as_raw_fd()),
        _ => Err(CountingError::MapNotFound(PMU_EVENTS)),
    }
}
