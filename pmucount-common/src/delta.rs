//! Delta engine
//!
//! Diffs the live value of one (event, cpu) counter against the snapshot taken
//! at the previous switch on the same cpu.

use crate::{event_slot, CounterReading, CounterSource, Diag, Diagnostics, Snapshot, SnapshotTable};

/// Result of advancing one snapshot
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeltaOutcome {
    /// Counts since the previous reading on this cpu
    Delta(CounterReading),
    /// First reading for this slot, stored without producing a delta
    Primed,
    /// Counter unreadable, snapshot left untouched
    ReadFailed,
    /// Snapshot table has no entry for this event
    SnapshotMissing,
}

/// Read `event` on `cpu`, diff it against the stored snapshot and replace the
/// snapshot with the new reading
///
/// The snapshot is overwritten whenever the read succeeds, independent of what
/// the caller later does with the delta.
pub fn advance_snapshot<C, S, D>(
    source: &C,
    snapshots: &mut S,
    diag: &D,
    event: u32,
    cpu: u32,
    num_cpus: u32,
) -> DeltaOutcome
where
    C: CounterSource,
    S: SnapshotTable,
    D: Diagnostics,
{
    let Some(previous) = snapshots.load(event) else {
        diag.record(Diag::SnapshotMissing);
        return DeltaOutcome::SnapshotMissing;
    };

    let Some(current) = source.read(event_slot(event, cpu, num_cpus)) else {
        diag.record(Diag::ReadFailed);
        return DeltaOutcome::ReadFailed;
    };

    if !snapshots.store(event, &Snapshot::primed_with(current)) {
        diag.record(Diag::SnapshotMissing);
        return DeltaOutcome::SnapshotMissing;
    }

    if previous.is_primed() {
        DeltaOutcome::Delta(current.delta_since(&previous.reading))
    } else {
        DeltaOutcome::Primed
    }
}
