//! Trace replay through the in-process tables
//!
//! A trace is a JSON file describing a cgroup tree, what to register or
//! track, and a sequence of scheduler records:
//!
//! ```json
//! {
//!   "mode": "cgroup",
//!   "num_cpus": 2,
//!   "events": ["cycles"],
//!   "cgroups": [{"id": 1, "name": "root"}, {"id": 2, "parent": 1, "name": "web"}],
//!   "register": [2],
//!   "records": [
//!     {"kind": "switch", "cpu": 0, "cgroup": 2, "readings": [100]},
//!     {"kind": "switch", "cpu": 0, "cgroup": 2,
//!      "readings": [{"value": 150, "enabled": 9, "running": 9}]},
//!     {"kind": "fork", "parent": 100, "child": 101}
//!   ]
//! }
//! ```
//!
//! Each cpu gets a worker thread holding that cpu's [`CpuHandle`], fed in
//! record order over a bounded channel, so switches on different cpus run
//! concurrently just as they do in the kernel. Forks are applied by the
//! dispatcher once every worker has drained the records sent before them.

use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, info};
use pmucount_common::{
    event_slot, AncestryError, CgroupAncestry, CounterReading, CounterSource, MAX_EVENTS,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::arena::{CpuHandle, Tables, TablesConfig};
use crate::domain::{CgroupId, CpuId, Mode, ReplayError, TableError, Tid};
use crate::report::{CounterSample, Report};

/// One worker thread and one table column per cpu
pub const MAX_REPLAY_CPUS: u32 = 4096;

/// Records queued per worker before the dispatcher blocks
const WORKER_QUEUE: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CgroupNode {
    pub id: u64,
    /// `None` for a root
    #[serde(default)]
    pub parent: Option<u64>,
    #[serde(default)]
    pub name: Option<String>,
}

/// A counter value, either bare or as a full triple
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TraceReading {
    /// Just the count; enabled and running stay zero
    Value(u64),
    Full { value: u64, enabled: u64, running: u64 },
}

impl From<TraceReading> for CounterReading {
    fn from(reading: TraceReading) -> Self {
        match reading {
            TraceReading::Value(value) => CounterReading::new(value, 0, 0),
            TraceReading::Full { value, enabled, running } => {
                CounterReading::new(value, enabled, running)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Record {
    /// A task is switched out on `cpu`
    ///
    /// `readings` holds the live counter per event; `null` is a failed read.
    Switch {
        cpu: u32,
        #[serde(default)]
        tid: u32,
        /// The task's cgroup (cgroup mode)
        #[serde(default)]
        cgroup: Option<u64>,
        readings: Vec<Option<TraceReading>>,
    },
    /// `parent` creates `child`
    Fork { parent: u32, child: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trace {
    pub mode: Mode,
    pub num_cpus: u32,
    pub events: Vec<String>,
    #[serde(default)]
    pub cgroups: Vec<CgroupNode>,
    /// Cgroup ids to register, group keys in list order
    #[serde(default)]
    pub register: Vec<u64>,
    /// Task ids tracked under their own id
    #[serde(default)]
    pub track: Vec<u32>,
    /// `false` simulates a kernel without cgroup ancestry
    #[serde(default = "default_true")]
    pub ancestry_available: bool,
    pub records: Vec<Record>,
}

fn default_true() -> bool {
    true
}

fn unique<T: Copy + PartialEq>(items: &[T]) -> Vec<T> {
    let mut seen = Vec::with_capacity(items.len());
    for &item in items {
        if !seen.contains(&item) {
            seen.push(item);
        }
    }
    seen
}

impl Trace {
    /// # Errors
    /// [`ReplayError::Json`] on malformed input.
    pub fn from_json(json: &str) -> Result<Self, ReplayError> {
        Ok(serde_json::from_str(json)?)
    }

    /// # Errors
    /// I/O or JSON failures.
    pub fn load(path: &Path) -> Result<Self, ReplayError> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    /// Registered cgroups in trace order, a repeated id keeping its first key
    fn registered(&self) -> Vec<u64> {
        unique(&self.register)
    }

    fn tracked(&self) -> Vec<u32> {
        unique(&self.track)
    }

    fn num_events(&self) -> u32 {
        u32::try_from(self.events.len()).unwrap_or(u32::MAX)
    }

    /// Structural checks, before any table is touched
    ///
    /// # Errors
    /// The first inconsistency found.
    pub fn validate(&self) -> Result<(), ReplayError> {
        if self.num_cpus == 0 {
            return Err(ReplayError::NoCpus);
        }
        if self.num_cpus > MAX_REPLAY_CPUS {
            return Err(ReplayError::TooManyCpus { got: self.num_cpus, max: MAX_REPLAY_CPUS });
        }
        let num_events = self.num_events();
        if num_events == 0 || num_events > MAX_EVENTS {
            return Err(ReplayError::BadEventCount { got: num_events, max: MAX_EVENTS });
        }
        let tree = CgroupTree::new(&self.cgroups);
        for &id in &self.register {
            if !tree.contains(id) {
                return Err(ReplayError::UnknownCgroup(CgroupId(id)));
            }
        }

        for record in &self.records {
            let Record::Switch { cpu, cgroup, readings, .. } = record else {
                continue;
            };
            if *cpu >= self.num_cpus {
                return Err(ReplayError::CpuOutOfRange { cpu: *cpu, num_cpus: self.num_cpus });
            }
            if readings.len() != self.events.len() {
                return Err(ReplayError::ReadingCountMismatch {
                    cpu: *cpu,
                    expected: self.events.len(),
                    got: readings.len(),
                });
            }
            if self.mode == Mode::Cgroup {
                match cgroup {
                    None => return Err(ReplayError::MissingCgroup(*cpu)),
                    Some(id) if !tree.contains(*id) => {
                        return Err(ReplayError::UnknownCgroup(CgroupId(*id)));
                    }
                    Some(_) => {}
                }
            }
        }
        Ok(())
    }
}

/// Parent links of the trace's cgroups
struct CgroupTree<'a> {
    nodes: HashMap<u64, &'a CgroupNode>,
}

impl<'a> CgroupTree<'a> {
    fn new(nodes: &'a [CgroupNode]) -> Self {
        Self { nodes: nodes.iter().map(|n| (n.id, n)).collect() }
    }

    fn contains(&self, id: u64) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Ids from the root down to `leaf`
    ///
    /// A parent missing from the tree ends the walk; so does a cycle.
    fn chain(&self, leaf: u64) -> Vec<u64> {
        let mut chain = vec![leaf];
        let mut current = leaf;
        while let Some(parent) = self.nodes.get(&current).and_then(|n| n.parent) {
            if !self.contains(parent) || chain.len() > self.nodes.len() {
                break;
            }
            chain.push(parent);
            current = parent;
        }
        chain.reverse();
        chain
    }

    fn label(&self, id: u64) -> String {
        self.nodes
            .get(&id)
            .and_then(|n| n.name.clone())
            .unwrap_or_else(|| CgroupId(id).to_string())
    }
}

/// Ancestry of a switched-out task, as the trace describes it
pub struct TreeAncestry {
    /// Root to leaf; empty when ancestry is unavailable
    chain: Vec<u64>,
}

impl CgroupAncestry for TreeAncestry {
    fn depth(&self) -> Result<u32, AncestryError> {
        let len = u32::try_from(self.chain.len()).map_err(|_| AncestryError::Fault)?;
        len.checked_sub(1).ok_or(AncestryError::Unavailable)
    }

    fn ancestor_id(&self, level: u32) -> Result<u64, AncestryError> {
        self.chain.get(level as usize).copied().ok_or(AncestryError::Fault)
    }
}

/// Counter values of one switch record
pub struct RecordReadings {
    cpu: u32,
    num_cpus: u32,
    readings: Vec<Option<CounterReading>>,
}

impl CounterSource for RecordReadings {
    fn read(&self, slot: u32) -> Option<CounterReading> {
        let event = slot / self.num_cpus;
        if event_slot(event, self.cpu, self.num_cpus) != slot {
            return None;
        }
        self.readings.get(event as usize).copied().flatten()
    }
}

/// Work for one cpu's worker
enum Work {
    Hierarchy(TreeAncestry, RecordReadings),
    Lineage(Tid, RecordReadings),
    /// Acknowledge once everything queued before has run
    Fence(Sender<()>),
}

fn run_worker(mut handle: CpuHandle<'_>, rx: &Receiver<Work>) -> usize {
    let mut switches = 0;
    for work in rx {
        match work {
            Work::Hierarchy(ancestry, readings) => {
                handle.on_switch_hierarchy(&ancestry, &readings);
                switches += 1;
            }
            Work::Lineage(tid, readings) => {
                handle.on_switch_lineage(tid, &readings);
                switches += 1;
            }
            Work::Fence(ack) => {
                let _ = ack.send(());
            }
        }
    }
    debug!("{} replayed {switches} switches", handle.cpu());
    switches
}

/// Wait until every worker has processed what was queued so far
fn fence(workers: &[Sender<Work>]) {
    let (ack_tx, ack_rx) = bounded(workers.len());
    let mut pending = 0;
    for tx in workers {
        if tx.send(Work::Fence(ack_tx.clone())).is_ok() {
            pending += 1;
        }
    }
    drop(ack_tx);
    for _ in 0..pending {
        if ack_rx.recv().is_err() {
            break;
        }
    }
}

/// Build the tables a trace starts from
fn prepare(trace: &Trace) -> Result<Tables, ReplayError> {
    let mut tables = Tables::new(TablesConfig::new(trace.num_cpus, trace.num_events()));
    for (key, id) in (0u32..).zip(trace.registered()) {
        tables.register_cgroup(CgroupId(id), key)?;
    }
    for tid in trace.tracked() {
        match tables.track(Tid(tid)) {
            Ok(()) | Err(TableError::AlreadyTracked { .. }) => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(tables)
}

/// Replay `trace` and report what the tables accumulated
///
/// # Errors
/// Validation failures, table setup failures, or a worker that could not
/// claim its cpu.
pub fn replay(trace: &Trace) -> Result<Report, ReplayError> {
    trace.validate()?;
    let tables = prepare(trace)?;
    let tree = CgroupTree::new(&trace.cgroups);

    let results: Vec<(u32, std::thread::Result<Result<usize, TableError>>)> =
        std::thread::scope(|s| {
            let mut senders = Vec::new();
            let mut handles = Vec::new();
            for cpu in 0..trace.num_cpus {
                let (tx, rx) = bounded::<Work>(WORKER_QUEUE);
                let tables = &tables;
                senders.push(tx);
                handles.push((
                    cpu,
                    s.spawn(move || -> Result<usize, TableError> {
                        let handle = tables.claim_cpu(CpuId(cpu))?;
                        Ok(run_worker(handle, &rx))
                    }),
                ));
            }

            for record in &trace.records {
                match record {
                    Record::Switch { cpu, tid, cgroup, readings } => {
                        let readings = RecordReadings {
                            cpu: *cpu,
                            num_cpus: trace.num_cpus,
                            readings: readings.iter().map(|r| r.map(Into::into)).collect(),
                        };
                        let work = match trace.mode {
                            Mode::Cgroup => {
                                let chain = match cgroup {
                                    Some(id) if trace.ancestry_available => tree.chain(*id),
                                    _ => Vec::new(),
                                };
                                Work::Hierarchy(TreeAncestry { chain }, readings)
                            }
                            Mode::Process => Work::Lineage(Tid(*tid), readings),
                        };
                        // a worker that failed to start has dropped its end
                        let _ = senders[*cpu as usize].send(work);
                    }
                    Record::Fork { parent, child } => {
                        fence(&senders);
                        let outcome = tables.on_new_task(Tid(*parent), Tid(*child));
                        debug!("fork {parent} → {child}: {outcome:?}");
                    }
                }
            }

            drop(senders);
            handles.into_iter().map(|(cpu, h)| (cpu, h.join())).collect()
        });

    let mut switches = 0;
    for (cpu, result) in results {
        switches += result.map_err(|_| ReplayError::WorkerPanicked(cpu))??;
    }
    info!("replayed {} records ({switches} switches)", trace.records.len());

    Ok(build_report(trace, &tables, &tree))
}

/// # Errors
/// See [`Trace::load`] and [`replay`].
pub fn replay_file(path: &Path) -> Result<Report, ReplayError> {
    replay(&Trace::load(path)?)
}

fn build_report(trace: &Trace, tables: &Tables, tree: &CgroupTree<'_>) -> Report {
    let mut report = Report::new(trace.mode, trace.events.clone());

    match trace.mode {
        Mode::Cgroup => {
            for (key, id) in (0u32..).zip(trace.registered()) {
                let label = tree.label(id);
                for (event, name) in (0u32..).zip(&trace.events) {
                    for cpu in 0..trace.num_cpus {
                        let Some(reading) = tables.hierarchy_reading(key, event, CpuId(cpu)) else {
                            continue;
                        };
                        let cpu = Some(cpu);
                        report.samples.push(CounterSample::new(&label, name, cpu, &reading));
                    }
                }
            }
        }
        Mode::Process => {
            for key in trace.tracked() {
                let label = key.to_string();
                for (event, name) in (0u32..).zip(&trace.events) {
                    if let Some(reading) = tables.lineage_reading(key, event) {
                        report.samples.push(CounterSample::new(&label, name, None, &reading));
                    }
                }
            }
        }
    }

    report.diagnostics = tables
        .diagnostics()
        .snapshot()
        .into_iter()
        .map(|(diag, count)| (diag.name().to_string(), count))
        .collect();
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    fn switch(cpu: u32, cgroup: u64, value: u64) -> Record {
        Record::Switch {
            cpu,
            tid: 0,
            cgroup: Some(cgroup),
            readings: vec![Some(TraceReading::Value(value))],
        }
    }

    fn cgroup_trace(records: Vec<Record>) -> Trace {
        Trace {
            mode: Mode::Cgroup,
            num_cpus: 2,
            events: vec!["cycles".into()],
            cgroups: vec![
                CgroupNode { id: 1, parent: None, name: Some("root".into()) },
                CgroupNode { id: 2, parent: Some(1), name: Some("g1".into()) },
                CgroupNode { id: 3, parent: Some(2), name: Some("g2".into()) },
            ],
            register: vec![1, 3],
            track: Vec::new(),
            ancestry_available: true,
            records,
        }
    }

    #[test]
    fn test_tree_chain() {
        let trace = cgroup_trace(Vec::new());
        let tree = CgroupTree::new(&trace.cgroups);
        assert_eq!(tree.chain(3), vec![1, 2, 3]);
        assert_eq!(tree.chain(1), vec![1]);
        assert_eq!(tree.label(2), "g1");
        assert_eq!(tree.label(9), "cgroup#9");
    }

    #[test]
    fn test_cycle_does_not_hang() {
        let nodes = vec![
            CgroupNode { id: 1, parent: Some(2), name: None },
            CgroupNode { id: 2, parent: Some(1), name: None },
        ];
        let tree = CgroupTree::new(&nodes);
        assert!(tree.chain(1).len() <= 3);
    }

    #[test]
    fn test_readings_only_for_own_cpu() {
        let readings = RecordReadings {
            cpu: 1,
            num_cpus: 2,
            readings: vec![Some(CounterReading::new(5, 0, 0)), None],
        };
        assert_eq!(readings.read(event_slot(0, 1, 2)).map(|r| r.value), Some(5));
        assert_eq!(readings.read(event_slot(0, 0, 2)), None);
        assert_eq!(readings.read(event_slot(1, 1, 2)), None);
    }

    #[test]
    fn test_hierarchy_switches_fill_registered_ancestors() {
        let trace = cgroup_trace(vec![switch(0, 3, 100), switch(0, 3, 160), switch(0, 2, 200)]);
        let report = replay(&trace).unwrap();

        // g2 only sees its own task, root sees both
        assert_eq!(report.total("g2", "cycles"), Some(60));
        assert_eq!(report.total("root", "cycles"), Some(100));
    }

    #[test]
    fn test_unavailable_ancestry_counts_nothing() {
        let mut trace = cgroup_trace(vec![switch(0, 3, 100), switch(0, 3, 160)]);
        trace.ancestry_available = false;
        let report = replay(&trace).unwrap();

        // the registered bucket is still reported, it just stays empty
        assert_eq!(report.total("g2", "cycles"), Some(0));
        assert_eq!(report.total("root", "cycles"), Some(0));
        assert_eq!(report.diagnostics.get("ancestry_unavailable"), Some(&2));
    }

    #[test]
    fn test_repeated_registration_keeps_first_key() {
        let mut trace = cgroup_trace(vec![switch(0, 3, 100), switch(0, 3, 160)]);
        trace.register = vec![3, 3];
        let report = replay(&trace).unwrap();

        assert_eq!(report.total("g2", "cycles"), Some(60));
        let rows = report.samples.iter().filter(|s| s.group == "g2").count();
        assert_eq!(rows, trace.num_cpus as usize);
    }

    #[test]
    fn test_repeated_tracking_reports_once() {
        let mut trace = cgroup_trace(vec![]);
        trace.mode = Mode::Process;
        trace.register.clear();
        trace.track = vec![7, 7];
        let on_seven = |value| Record::Switch {
            cpu: 0,
            tid: 7,
            cgroup: None,
            readings: vec![Some(TraceReading::Value(value))],
        };
        trace.records = vec![on_seven(10), on_seven(25)];
        let report = replay(&trace).unwrap();

        assert_eq!(report.total("7", "cycles"), Some(15));
        assert_eq!(report.samples.iter().filter(|s| s.group == "7").count(), 1);
    }

    #[test]
    fn test_cpu_count_is_bounded() {
        let mut trace = cgroup_trace(vec![]);
        trace.num_cpus = 100_000;
        assert!(matches!(
            replay(&trace),
            Err(ReplayError::TooManyCpus { got: 100_000, max: MAX_REPLAY_CPUS })
        ));
    }

    #[test]
    fn test_validation() {
        let mut trace = cgroup_trace(vec![switch(5, 3, 1)]);
        assert!(matches!(replay(&trace), Err(ReplayError::CpuOutOfRange { cpu: 5, .. })));

        trace.records = vec![switch(0, 42, 1)];
        assert!(matches!(replay(&trace), Err(ReplayError::UnknownCgroup(CgroupId(42)))));

        let orphan = Record::Switch { cpu: 0, tid: 1, cgroup: None, readings: vec![None] };
        trace.records = vec![orphan];
        assert!(matches!(replay(&trace), Err(ReplayError::MissingCgroup(0))));

        let short = Record::Switch { cpu: 0, tid: 1, cgroup: Some(3), readings: vec![] };
        trace.records = vec![short];
        assert!(matches!(replay(&trace), Err(ReplayError::ReadingCountMismatch { .. })));

        trace.records.clear();
        trace.events.clear();
        assert!(matches!(replay(&trace), Err(ReplayError::BadEventCount { got: 0, .. })));

        trace.num_cpus = 0;
        assert!(matches!(replay(&trace), Err(ReplayError::NoCpus)));
    }

    #[test]
    fn test_json_records() {
        let json = r#"{
            "mode": "process",
            "num_cpus": 1,
            "events": ["cycles"],
            "track": [7],
            "records": [
                {"kind": "switch", "cpu": 0, "tid": 7,
                 "readings": [{"value": 1, "enabled": 2, "running": 2}]},
                {"kind": "fork", "parent": 7, "child": 8},
                {"kind": "switch", "cpu": 0, "tid": 8, "readings": [null]}
            ]
        }"#;
        let trace = Trace::from_json(json).unwrap();
        assert!(trace.ancestry_available);
        assert_eq!(trace.records[1], Record::Fork { parent: 7, child: 8 });
        assert!(matches!(
            &trace.records[2],
            Record::Switch { readings, .. } if readings == &vec![None]
        ));
    }
}
