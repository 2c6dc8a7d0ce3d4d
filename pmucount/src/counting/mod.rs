//! Live counting against the kernel
//!
//! - `perf`: per-cpu hardware counters via `perf_event_open`
//! - `btf`: kernel struct offsets the collectors need
//! - `ebpf_setup`: load the object and attach the collectors
//! - `session`: one counting run, from load to teardown
//! - `cgroup`, `threads`, `cpu_utils`: naming targets and cpus through sysfs and procfs

pub mod btf;
pub mod cgroup;
pub mod cpu_utils;
pub mod diagnostics;
pub mod ebpf_setup;
pub mod perf;
pub mod session;
pub mod sys;
pub mod threads;

pub use cpu_utils::{online_cpus, possible_cpu_count};
pub use diagnostics::print_diagnostics;
pub use session::CountingSession;
