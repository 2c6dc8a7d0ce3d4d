//! Lineage resolver
//!
//! On task creation the child inherits the accumulation key of its creator so
//! a whole family of threads and processes accumulates into one bucket.

use crate::{Diag, Diagnostics, LineageFilter};

/// Why an insert into the lineage filter was refused
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertError {
    /// The task id already has a key
    Exists,
    /// The table is at capacity
    Full,
}

/// Result of one task-creation event
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LineageOutcome {
    /// Parent has no key, child stays untracked for good
    Untracked,
    /// Child registered under the parent's key
    Inherited(u32),
    /// Child id already present; left as is
    Collision,
    /// Filter table full; child left untracked
    Dropped,
}

/// Propagate `parent`'s accumulation key to `child`
///
/// Existing entries are never overwritten: a fresh task id that is already
/// present indicates an anomaly, not a re-parenting.
pub fn propagate_lineage<F, D>(filter: &F, diag: &D, parent: u32, child: u32) -> LineageOutcome
where
    F: LineageFilter,
    D: Diagnostics,
{
    let Some(key) = filter.key_of(parent) else {
        return LineageOutcome::Untracked;
    };

    match filter.insert_new(child, key) {
        Ok(()) => LineageOutcome::Inherited(key),
        Err(InsertError::Exists) => {
            diag.record(Diag::LineageCollision);
            LineageOutcome::Collision
        }
        Err(InsertError::Full) => {
            diag.record(Diag::FilterFull);
            LineageOutcome::Dropped
        }
    }
}
