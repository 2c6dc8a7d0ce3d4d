//! Per-switch drivers
//!
//! One call per `sched_switch` per cpu. Both collectors run the delta engine
//! over every tracked event; they differ in how the outgoing task maps to
//! groups and where the deltas land.

use crate::{
    accumulate_hierarchy, accumulate_lineage, advance_snapshot, resolve_groups, CgroupAncestry,
    CgroupRegistry, CounterSource, DeltaOutcome, Diagnostics, GroupList, HierarchyBuckets,
    LineageBuckets, LineageFilter, SnapshotTable, MAX_EVENTS, MAX_LEVELS,
};

/// Load-time constants of one collector
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SwitchConfig {
    /// Number of logical events, clamped to [`MAX_EVENTS`]
    pub num_events: u32,
    pub num_cpus: u32,
    /// Output capacity of the hierarchy resolver, clamped to [`MAX_LEVELS`]
    pub max_groups: usize,
}

impl SwitchConfig {
    #[must_use]
    pub const fn new(num_events: u32, num_cpus: u32) -> Self {
        Self { num_events, num_cpus, max_groups: MAX_LEVELS }
    }
}

/// What one switch did, for tests and replay statistics
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SwitchReport {
    /// Deltas produced by the delta engine
    pub deltas: u32,
    /// Snapshots primed by a first reading
    pub primed: u32,
    pub read_failures: u32,
    /// Bucket additions dropped for lack of room
    pub dropped: u32,
    /// Groups (or 1 for a tracked lineage task) the deltas were attributed to
    pub groups: u32,
}

impl SwitchReport {
    fn record(&mut self, outcome: &DeltaOutcome) {
        match outcome {
            DeltaOutcome::Delta(_) => self.deltas += 1,
            DeltaOutcome::Primed => self.primed += 1,
            DeltaOutcome::ReadFailed | DeltaOutcome::SnapshotMissing => self.read_failures += 1,
        }
    }
}

/// Cgroup collector: attribute the outgoing task's deltas to every registered
/// ancestor cgroup, leaf to root
#[allow(clippy::too_many_arguments)]
pub fn on_switch_hierarchy<A, R, C, S, B, D>(
    config: &SwitchConfig,
    cpu: u32,
    ancestry: &A,
    registry: &R,
    source: &C,
    snapshots: &mut S,
    buckets: &mut B,
    diag: &D,
) -> SwitchReport
where
    A: CgroupAncestry,
    R: CgroupRegistry,
    C: CounterSource,
    S: SnapshotTable,
    B: HierarchyBuckets,
    D: Diagnostics,
{
    let mut report = SwitchReport::default();
    let mut groups = GroupList::new();
    resolve_groups(ancestry, registry, diag, config.max_groups, &mut groups);
    report.groups = groups.len() as u32;

    for event in 0..MAX_EVENTS {
        if event >= config.num_events {
            break;
        }

        // snapshots advance even with no groups so the next task starts clean
        let outcome = advance_snapshot(source, snapshots, diag, event, cpu, config.num_cpus);
        report.record(&outcome);

        if let DeltaOutcome::Delta(delta) = outcome {
            report.dropped += accumulate_hierarchy(buckets, diag, &groups, event, &delta);
        }
    }

    report
}

/// Lineage collector: attribute the outgoing task's deltas to its
/// accumulation key, if it has one
#[allow(clippy::too_many_arguments)]
pub fn on_switch_lineage<F, C, S, B, D>(
    config: &SwitchConfig,
    cpu: u32,
    tid: u32,
    filter: &F,
    source: &C,
    snapshots: &mut S,
    buckets: &B,
    diag: &D,
) -> SwitchReport
where
    F: LineageFilter,
    C: CounterSource,
    S: SnapshotTable,
    B: LineageBuckets,
    D: Diagnostics,
{
    let mut report = SwitchReport::default();
    let key = filter.key_of(tid);
    report.groups = u32::from(key.is_some());

    for event in 0..MAX_EVENTS {
        if event >= config.num_events {
            break;
        }

        let outcome = advance_snapshot(source, snapshots, diag, event, cpu, config.num_cpus);
        report.record(&outcome);

        if let (DeltaOutcome::Delta(delta), Some(key)) = (outcome, key) {
            if !accumulate_lineage(buckets, diag, key, event, &delta) {
                report.dropped += 1;
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Chain, Filter, GroupBuckets, KeyBuckets, Registry, Scripted, Snapshots};
    use crate::{event_slot, propagate_lineage};

    const CPUS: u32 = 2;

    /// Per-cpu state of the hierarchy collector for one cpu
    struct Cpu {
        snaps: Snapshots,
        buckets: GroupBuckets,
    }

    impl Cpu {
        fn new(events: usize) -> Self {
            Self { snaps: Snapshots::with_events(events), buckets: GroupBuckets::with_groups(16) }
        }
    }

    #[test]
    fn test_two_cpu_totals_add_up() {
        let config = SwitchConfig::new(1, CPUS);
        let chain = Chain::new(&[1]);
        let registry = Registry::from_pairs(&[(1, 0)]);
        let mut source = Scripted::default();
        let mut cpus = [Cpu::new(1), Cpu::new(1)];

        let script: [(u32, [u64; 3]); 2] = [(0, [100, 150, 230]), (1, [50, 50, 90])];
        let mut deltas = [Vec::new(), Vec::new()];

        for (cpu, readings) in script {
            for (i, value) in readings.into_iter().enumerate() {
                source.set(event_slot(0, cpu, CPUS), value);
                let state = &mut cpus[cpu as usize];
                let before = state.buckets.value(0, 0);
                let report = on_switch_hierarchy(
                    &config,
                    cpu,
                    &chain,
                    &registry,
                    &source,
                    &mut state.snaps,
                    &mut state.buckets,
                    &(),
                );
                if i == 0 {
                    assert_eq!(report.primed, 1);
                    continue;
                }
                deltas[cpu as usize].push(state.buckets.value(0, 0) - before);
            }
        }

        assert_eq!(deltas[0], vec![50, 80]);
        assert_eq!(deltas[1], vec![0, 40]);
        let total: u64 = cpus.iter().map(|c| c.buckets.value(0, 0)).sum();
        assert_eq!(total, 170);
    }

    #[test]
    fn test_hierarchy_attributes_to_registered_ancestors() {
        // root(1) → g1(2) → g2(3); root and g2 registered
        let config = SwitchConfig::new(1, 1);
        let chain = Chain::new(&[1, 2, 3]);
        let registry = Registry::from_pairs(&[(1, 0), (3, 1)]);
        let mut source = Scripted::default();
        let mut cpu = Cpu::new(1);

        for value in [10, 25] {
            source.set(0, value);
            on_switch_hierarchy(
                &config, 0, &chain, &registry, &source, &mut cpu.snaps, &mut cpu.buckets, &(),
            );
        }

        assert_eq!(cpu.buckets.value(1, 0), 15);
        assert_eq!(cpu.buckets.value(0, 0), 15);
        assert_eq!(cpu.buckets.totals.len(), 2);
    }

    #[test]
    fn test_unregistered_task_still_advances_snapshot() {
        let config = SwitchConfig::new(1, 1);
        let registry = Registry::from_pairs(&[(5, 0)]);
        let outsider = Chain::new(&[1]);
        let member = Chain::new(&[5]);
        let mut source = Scripted::default();
        let mut cpu = Cpu::new(1);

        source.set(0, 100);
        on_switch_hierarchy(
            &config, 0, &member, &registry, &source, &mut cpu.snaps, &mut cpu.buckets, &(),
        );
        source.set(0, 400);
        let report = on_switch_hierarchy(
            &config, 0, &outsider, &registry, &source, &mut cpu.snaps, &mut cpu.buckets, &(),
        );
        assert_eq!(report.groups, 0);
        assert_eq!(report.deltas, 1);

        source.set(0, 450);
        on_switch_hierarchy(
            &config, 0, &member, &registry, &source, &mut cpu.snaps, &mut cpu.buckets, &(),
        );

        assert_eq!(cpu.buckets.value(0, 0), 50);
    }

    #[test]
    fn test_events_beyond_num_events_are_ignored() {
        let config = SwitchConfig::new(2, 1);
        let chain = Chain::new(&[1]);
        let registry = Registry::from_pairs(&[(1, 0)]);
        let mut source = Scripted::default();
        let mut cpu = Cpu::new(4);
        for event in 0..4 {
            source.set(event, 1);
        }

        let report = on_switch_hierarchy(
            &config, 0, &chain, &registry, &source, &mut cpu.snaps, &mut cpu.buckets, &(),
        );

        assert_eq!(report.primed, 2);
        assert!(!cpu.snaps.get(2).is_primed());
    }

    #[test]
    fn test_fork_chain_accumulates_into_root_key() {
        // A forks B, B forks C; each runs for a while on one cpu
        let (a, b, c) = (100, 101, 102);
        let config = SwitchConfig::new(1, 1);
        let filter = Filter::with_capacity(16);
        let buckets = KeyBuckets::with_max_keys(16);
        let mut snaps = Snapshots::with_events(1);
        let mut source = Scripted::default();
        filter.seed(a);

        source.set(0, 0);
        on_switch_lineage(&config, 0, a, &filter, &source, &mut snaps, &buckets, &());

        propagate_lineage(&filter, &(), a, b);
        propagate_lineage(&filter, &(), b, c);

        for (tid, value) in [(a, 10), (b, 30), (c, 60), (a, 61)] {
            source.set(0, value);
            on_switch_lineage(&config, 0, tid, &filter, &source, &mut snaps, &buckets, &());
        }

        assert_eq!(buckets.value(a, 0), 61);
        assert_eq!(buckets.totals.borrow().len(), 1);
    }

    #[test]
    fn test_untracked_task_counts_are_not_leaked() {
        let config = SwitchConfig::new(1, 1);
        let filter = Filter::with_capacity(16);
        let buckets = KeyBuckets::with_max_keys(16);
        let mut snaps = Snapshots::with_events(1);
        let mut source = Scripted::default();
        filter.seed(7);

        source.set(0, 100);
        on_switch_lineage(&config, 0, 7, &filter, &source, &mut snaps, &buckets, &());
        source.set(0, 120);
        on_switch_lineage(&config, 0, 7, &filter, &source, &mut snaps, &buckets, &());
        // untracked task 8 runs for 1000
        source.set(0, 1_120);
        let report = on_switch_lineage(&config, 0, 8, &filter, &source, &mut snaps, &buckets, &());
        assert_eq!(report.groups, 0);
        source.set(0, 1_125);
        on_switch_lineage(&config, 0, 7, &filter, &source, &mut snaps, &buckets, &());

        assert_eq!(buckets.value(7, 0), 25);
    }
}
