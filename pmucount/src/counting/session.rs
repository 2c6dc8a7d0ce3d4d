//! Live counting session
//!
//! Owns the loaded eBPF object and the perf counters behind it. Everything
//! the kernel side needs is installed before the programs are attached, and
//! counters are enabled last, so the first switch already sees a complete
//! configuration.
//!
//! Field order matters on drop: counters are disabled and closed before the
//! programs are detached.

use aya::{
    maps::{HashMap, MapData, MapError, PerCpuArray, PerCpuHashMap, PerCpuValues},
    programs::RawTracePoint,
    Ebpf,
};
use log::{debug, info, warn};
use pmucount_common::{hierarchy_bucket, CounterReading, Diag, LineageBucketKey};
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};
use std::time::Instant;

use super::btf::{kernel_layout, VMLINUX_BTF};
use super::cgroup::resolve_cgroup;
use super::cpu_utils::{online_cpus, possible_cpu_count};
use super::ebpf_setup::{
    attach_collector, init_ebpf_logger, load_ebpf, pmu_events_fd, switch_program, LoadParams,
    CGROUP_INDEX, CGROUP_READINGS, DIAGNOSTICS, LINEAGE_FILTER, LINEAGE_READINGS,
};
use super::perf::CounterSet;
use super::sys::{install_perf_fd, run_on_cpu};
use super::threads::list_threads;
use crate::config::{Config, Targets};
use crate::domain::{CgroupId, CountingError, CpuId, GroupKey, Mode, Pid};
use crate::events::EventSpec;
use crate::preflight::run_preflight_checks;
use crate::report::{CounterSample, Report};

const BPF_ANY: u64 = 0;
const BPF_NOEXIST: u64 = 1;

/// One zero reading per possible cpu
fn zeroed_values() -> Result<PerCpuValues<CounterReading>, CountingError> {
    let nr_cpus = aya::util::nr_cpus().map_err(|(_, e)| e)?;
    Ok(PerCpuValues::try_from(vec![CounterReading::ZERO; nr_cpus])?)
}

/// A registered cgroup; its index in the session is its group key
#[derive(Debug, Clone)]
struct Group {
    name: String,
    id: CgroupId,
}

pub struct CountingSession {
    counters: CounterSet,
    bpf: Ebpf,
    mode: Mode,
    events: Vec<EventSpec>,
    num_cpus: u32,
    online: Vec<CpuId>,
    max_groups: u32,
    cgroup_root: PathBuf,
    groups: Vec<Group>,
    tracked: Vec<Pid>,
    reset: bool,
    started: Instant,
}

impl CountingSession {
    /// Load, configure and start counting
    ///
    /// # Errors
    /// Any [`CountingError`]; nothing stays attached on failure.
    pub fn start(config: &Config) -> Result<Self, CountingError> {
        run_preflight_checks(config.quiet)?;

        let num_cpus = possible_cpu_count()?;
        let online = online_cpus()?;
        let layout = kernel_layout(Path::new(VMLINUX_BTF), config.layout.as_ref())?;
        if config.mode() == Mode::Cgroup && !layout.has_ancestry() {
            warn!("kernel cgroup layout unknown, counts will stay at zero (see --layout)");
        }

        let params = LoadParams::new(config.num_events(), num_cpus, config.max_groups, layout);
        let mut bpf = load_ebpf(&config.ebpf_path, &params)?;
        init_ebpf_logger(&mut bpf);

        let counters = CounterSet::open(&config.events, &online, num_cpus)?;
        let map_fd = pmu_events_fd(&bpf)?;
        for counter in counters.iter() {
            install_perf_fd(map_fd, counter.slot, counter.raw_fd())?;
        }
        info!("opened {} counters on {} cpus", counters.len(), online.len());

        let cgroup_root = match &config.targets {
            Targets::Cgroups { root, .. } => root.clone(),
            Targets::Processes(_) => PathBuf::from("/sys/fs/cgroup"),
        };
        let mut session = Self {
            counters,
            bpf,
            mode: config.mode(),
            events: config.events.clone(),
            num_cpus,
            online,
            max_groups: config.max_groups,
            cgroup_root,
            groups: Vec::new(),
            tracked: Vec::new(),
            reset: config.reset,
            started: Instant::now(),
        };

        match &config.targets {
            Targets::Cgroups { names, .. } => {
                for name in names {
                    let key = session.register_cgroup(name)?;
                    info!("registered cgroup {name} as {key}");
                }
            }
            Targets::Processes(pids) => {
                for &pid in pids {
                    let threads = session.track_pid(pid)?;
                    info!("tracking {pid} ({threads} threads)");
                }
            }
        }

        attach_collector(&mut session.bpf, session.mode)?;
        session.counters.enable()?;
        session.started = Instant::now();
        Ok(session)
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    fn num_events(&self) -> u32 {
        u32::try_from(self.events.len()).unwrap_or(u32::MAX)
    }

    /// Register a cgroup by name under the next free group key
    ///
    /// Registering the same cgroup again returns its existing key.
    ///
    /// # Errors
    /// Name resolution failures, [`CountingError::TooManyGroups`] or map
    /// update failures.
    pub fn register_cgroup(&mut self, name: &str) -> Result<GroupKey, CountingError> {
        let id = resolve_cgroup(&self.cgroup_root, name)?;
        if let Some(index) = self.groups.iter().position(|g| g.id == id) {
            return Ok(GroupKey(u32::try_from(index).unwrap_or(u32::MAX)));
        }

        let key = u32::try_from(self.groups.len()).unwrap_or(u32::MAX);
        if key >= self.max_groups {
            return Err(CountingError::TooManyGroups(self.max_groups));
        }

        let mut index: HashMap<&mut MapData, u64, u32> = HashMap::try_from(
            self.bpf.map_mut(CGROUP_INDEX).ok_or(CountingError::MapNotFound(CGROUP_INDEX))?,
        )?;
        index.insert(id.0, key, BPF_ANY)?;
        self.groups.push(Group { name: name.to_string(), id });
        debug!("{name} → {id} → group#{key}");
        Ok(GroupKey(key))
    }

    /// Track a process: every current thread is keyed by `pid`, new threads
    /// and children inherit the key as they are created
    ///
    /// Returns the number of threads newly keyed. Tracking a pid twice is a
    /// no-op; threads that already carry a key keep it.
    ///
    /// # Errors
    /// [`CountingError::ProcessNotFound`] or map update failures.
    pub fn track_pid(&mut self, pid: Pid) -> Result<usize, CountingError> {
        if self.tracked.contains(&pid) {
            return Ok(0);
        }
        let mut threads = list_threads(pid)?;
        if !threads.iter().any(|t| t.0 == pid.0) {
            threads.insert(0, pid.into());
        }

        let mut filter: HashMap<&mut MapData, u32, u32> = HashMap::try_from(
            self.bpf.map_mut(LINEAGE_FILTER).ok_or(CountingError::MapNotFound(LINEAGE_FILTER))?,
        )?;
        let mut keyed = 0;
        for tid in threads {
            match filter.insert(tid.0, pid.0, BPF_NOEXIST) {
                Ok(()) => keyed += 1,
                Err(MapError::SyscallError(e))
                    if e.io_error.raw_os_error() == Some(libc::EEXIST) =>
                {
                    debug!("{tid} already keyed, left as is");
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.zero_lineage(pid)?;
        self.tracked.push(pid);
        Ok(keyed)
    }

    fn zero_lineage(&mut self, pid: Pid) -> Result<(), CountingError> {
        let num_events = self.num_events();
        let mut readings: PerCpuHashMap<&mut MapData, LineageBucketKey, CounterReading> =
            PerCpuHashMap::try_from(
                self.bpf
                    .map_mut(LINEAGE_READINGS)
                    .ok_or(CountingError::MapNotFound(LINEAGE_READINGS))?,
            )?;
        for event in 0..num_events {
            let key = LineageBucketKey { accum_key: pid.0, event };
            readings.insert(key, zeroed_values()?, BPF_ANY)?;
        }
        Ok(())
    }

    /// Run the collector's `sched_switch` program once on every online cpu
    ///
    /// Folds in the pending deltas of tasks that have been running since
    /// their last switch. A cpu that went offline is skipped.
    ///
    /// # Errors
    /// Program lookup failures; per-cpu run failures are only logged.
    pub fn flush(&self) -> Result<(), CountingError> {
        let name = switch_program(self.mode);
        let program: &RawTracePoint =
            self.bpf.program(name).ok_or(CountingError::ProgramNotFound(name))?.try_into()?;
        let fd = program.fd()?;
        for &cpu in &self.online {
            if let Err(e) = run_on_cpu(fd.as_fd(), cpu) {
                debug!("flush on {cpu} failed: {e}");
            }
        }
        Ok(())
    }

    /// Offline cpus only show up if they counted something before going away
    fn keep_cpu(num_cpus: u32, online: &[CpuId], cpu: u32, reading: &CounterReading) -> bool {
        cpu < num_cpus && (online.contains(&CpuId(cpu)) || !reading.is_zero())
    }

    /// Flush, then read every bucket; buckets are zeroed afterwards unless
    /// the session was configured not to reset
    ///
    /// Additions landing between the read and the reset of one bucket are
    /// lost.
    ///
    /// # Errors
    /// Map access failures.
    pub fn read(&mut self) -> Result<Report, CountingError> {
        self.flush()?;
        let names = self.events.iter().map(|e| e.name.clone()).collect();
        let mut report = Report::new(self.mode, names);
        report.elapsed_ms = u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match self.mode {
            Mode::Cgroup => self.read_cgroups(&mut report)?,
            Mode::Process => self.read_lineages(&mut report)?,
        }
        report.diagnostics = self
            .diagnostics()?
            .into_iter()
            .map(|(diag, count)| (diag.name().to_string(), count))
            .collect();
        Ok(report)
    }

    fn read_cgroups(&mut self, report: &mut Report) -> Result<(), CountingError> {
        let num_events = self.num_events();
        let samples = {
            let readings: PerCpuArray<&MapData, CounterReading> = PerCpuArray::try_from(
                self.bpf.map(CGROUP_READINGS).ok_or(CountingError::MapNotFound(CGROUP_READINGS))?,
            )?;
            let mut samples = Vec::new();
            for (key, group) in (0u32..).zip(&self.groups) {
                for (event, spec) in (0u32..).zip(&self.events) {
                    let values = readings.get(&hierarchy_bucket(key, event, num_events), 0)?;
                    for (cpu, reading) in (0u32..).zip(values.iter()) {
                        if Self::keep_cpu(self.num_cpus, &self.online, cpu, reading) {
                            let cpu = Some(cpu);
                            samples.push(CounterSample::new(&group.name, &spec.name, cpu, reading));
                        }
                    }
                }
            }
            samples
        };
        report.samples = samples;

        if self.reset {
            let mut readings: PerCpuArray<&mut MapData, CounterReading> = PerCpuArray::try_from(
                self.bpf
                    .map_mut(CGROUP_READINGS)
                    .ok_or(CountingError::MapNotFound(CGROUP_READINGS))?,
            )?;
            let groups = u32::try_from(self.groups.len()).unwrap_or(u32::MAX);
            for index in 0..groups * num_events {
                readings.set(index, zeroed_values()?, 0)?;
            }
        }
        Ok(())
    }

    fn read_lineages(&mut self, report: &mut Report) -> Result<(), CountingError> {
        let mut readings: PerCpuHashMap<&mut MapData, LineageBucketKey, CounterReading> =
            PerCpuHashMap::try_from(
                self.bpf
                    .map_mut(LINEAGE_READINGS)
                    .ok_or(CountingError::MapNotFound(LINEAGE_READINGS))?,
            )?;

        for pid in &self.tracked {
            let label = pid.0.to_string();
            for (event, spec) in (0u32..).zip(&self.events) {
                let key = LineageBucketKey { accum_key: pid.0, event };
                let values = match readings.get(&key, 0) {
                    Ok(values) => values,
                    Err(MapError::KeyNotFound) => continue,
                    Err(e) => return Err(e.into()),
                };
                for (cpu, reading) in (0u32..).zip(values.iter()) {
                    if Self::keep_cpu(self.num_cpus, &self.online, cpu, reading) {
                        let cpu = Some(cpu);
                        report.samples.push(CounterSample::new(&label, &spec.name, cpu, reading));
                    }
                }
                if self.reset {
                    readings.insert(key, zeroed_values()?, BPF_ANY)?;
                }
            }
        }
        Ok(())
    }

    /// Swallowed kernel-side failures, summed over cpus
    ///
    /// # Errors
    /// Map access failures.
    pub fn diagnostics(&self) -> Result<Vec<(Diag, u64)>, CountingError> {
        let counters: PerCpuArray<&MapData, u64> = PerCpuArray::try_from(
            self.bpf.map(DIAGNOSTICS).ok_or(CountingError::MapNotFound(DIAGNOSTICS))?,
        )?;
        let mut out = Vec::new();
        for diag in Diag::ALL {
            let total: u64 = counters.get(&diag.index(), 0)?.iter().sum();
            if total > 0 {
                out.push((diag, total));
            }
        }
        Ok(out)
    }
}
