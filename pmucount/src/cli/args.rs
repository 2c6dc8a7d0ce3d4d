//! CLI argument definitions

use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "pmucount",
    version,
    about = "Attribute hardware performance counters to cgroups or process trees",
    after_help = "\
EXAMPLES:
    sudo pmucount cgroup --cgroup system.slice -e cycles,instructions
    sudo pmucount process --pid 1234 -e cycles --interval 500 --per-cpu
    sudo pmucount cgroup --cgroup web --cgroup db -e cache-misses --export out.json
    pmucount replay trace.json                   Replay a recorded trace (no root)

EVENTS:
    cycles instructions cache-references cache-misses branches branch-misses
    bus-cycles stalled-cycles-frontend stalled-cycles-backend ref-cycles
    cpu-clock task-clock page-faults context-switches cpu-migrations
    minor-faults major-faults r<hex>"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Count per cgroup, every task in a cgroup subtree included
    Cgroup {
        /// Cgroup path relative to the cgroup mount (repeatable)
        #[arg(short, long = "cgroup", value_name = "NAME")]
        cgroups: Vec<String>,

        /// Cgroup v2 mount point
        #[arg(long, value_name = "DIR", default_value = "/sys/fs/cgroup")]
        cgroup_root: PathBuf,

        #[command(flatten)]
        common: CommonArgs,
    },

    /// Count per process, every thread and descendant included
    Process {
        /// Process ID to track (repeatable)
        #[arg(short, long = "pid", value_name = "PID")]
        pids: Vec<u32>,

        #[command(flatten)]
        common: CommonArgs,
    },

    /// Feed a JSON trace of switch and fork events through the in-process tables
    Replay {
        #[arg(value_name = "TRACE")]
        trace: PathBuf,

        /// Print per-cpu rows instead of totals
        #[arg(long)]
        per_cpu: bool,

        /// Export the report as JSON
        #[arg(long, value_name = "FILE")]
        export: Option<PathBuf>,
    },
}

#[derive(ClapArgs, Debug, Clone)]
pub struct CommonArgs {
    /// Events to count, comma separated or repeated
    #[arg(short, long = "event", value_name = "EVENT", value_delimiter = ',')]
    pub events: Vec<String>,

    /// Milliseconds between reports
    #[arg(short, long, value_name = "MS", default_value = "1000")]
    pub interval: u64,

    /// Stop after N seconds (0 = until Ctrl+C)
    #[arg(short, long, default_value = "0")]
    pub duration: u64,

    /// Print per-cpu rows instead of totals
    #[arg(long)]
    pub per_cpu: bool,

    /// Keep accumulating instead of resetting after each report
    #[arg(long)]
    pub no_reset: bool,

    /// Export the last report as JSON
    #[arg(long, value_name = "FILE")]
    pub export: Option<PathBuf>,

    /// Path to the compiled eBPF object (default: $PMUCOUNT_EBPF or target/)
    #[arg(long, value_name = "PATH")]
    pub ebpf: Option<PathBuf>,

    /// TOML file overriding kernel struct offsets discovered from BTF
    #[arg(long, value_name = "TOML")]
    pub layout: Option<PathBuf>,

    /// Suppress non-essential output
    #[arg(short, long)]
    pub quiet: bool,
}
