//! Accumulator
//!
//! Adds one delta into the bucket of every group it is attributed to.

use crate::{CounterReading, Diag, Diagnostics, GroupList, HierarchyBuckets, LineageBuckets};

/// Why a delta could not be accumulated
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccumulateError {
    /// Bucket outside the table and no room to create it
    Capacity,
}

/// Add `delta` into the per-cpu bucket of every group in `groups`
///
/// Returns the number of groups whose bucket could not take the delta.
pub fn accumulate_hierarchy<B, D>(
    buckets: &mut B,
    diag: &D,
    groups: &GroupList,
    event: u32,
    delta: &CounterReading,
) -> u32
where
    B: HierarchyBuckets,
    D: Diagnostics,
{
    let mut dropped = 0;
    for &group in groups.as_slice() {
        if buckets.add(group, event, delta).is_err() {
            diag.record(Diag::BucketFull);
            dropped += 1;
        }
    }
    dropped
}

/// Add `delta` into the cross-cpu bucket of `accum_key`
///
/// Returns `false` when the delta was dropped for lack of room.
pub fn accumulate_lineage<B, D>(
    buckets: &B,
    diag: &D,
    accum_key: u32,
    event: u32,
    delta: &CounterReading,
) -> bool
where
    B: LineageBuckets,
    D: Diagnostics,
{
    match buckets.add(accum_key, event, delta) {
        Ok(()) => true,
        Err(AccumulateError::Capacity) => {
            diag.record(Diag::BucketFull);
            false
        }
    }
}
