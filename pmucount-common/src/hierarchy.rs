//! Hierarchy resolver
//!
//! Turns the outgoing task's cgroup ancestry into the list of registered group
//! keys its counters are attributed to, leaf to root.

use crate::{CgroupAncestry, CgroupRegistry, Diag, Diagnostics, MAX_LEVELS};

/// Why the ancestry of a task could not be walked
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AncestryError {
    /// Kernel lacks the ancestor-id field
    Unavailable,
    /// A kernel memory read failed
    Fault,
}

/// Fixed-capacity list of group keys, at most [`MAX_LEVELS`] entries
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GroupList {
    keys: [u32; MAX_LEVELS],
    len: usize,
}

impl Default for GroupList {
    fn default() -> Self {
        Self::new()
    }
}

impl GroupList {
    #[must_use]
    pub const fn new() -> Self {
        Self { keys: [0; MAX_LEVELS], len: 0 }
    }

    /// Append a key, returns `false` when full
    #[inline(always)]
    pub fn push(&mut self, key: u32) -> bool {
        if self.len >= MAX_LEVELS {
            return false;
        }
        self.keys[self.len] = key;
        self.len += 1;
        true
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u32] {
        &self.keys[..self.len]
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }
}

/// Resolve the registered ancestors of the current task into `out`
///
/// Walks from the task's own cgroup (distance 0) towards the root, appending
/// the group key of every registered ancestor. Unregistered ancestors are
/// skipped. At most `min(limit, MAX_LEVELS)` keys are produced and at most
/// `MAX_LEVELS` ancestors are visited, so hierarchies deeper than that only
/// contribute their nearest ancestors.
///
/// Never fails: an unreadable hierarchy leaves `out` empty and is recorded
/// through `diag`.
pub fn resolve_groups<A, R, D>(
    ancestry: &A,
    registry: &R,
    diag: &D,
    limit: usize,
    out: &mut GroupList,
) where
    A: CgroupAncestry,
    R: CgroupRegistry,
    D: Diagnostics,
{
    out.clear();

    let depth = match ancestry.depth() {
        Ok(depth) => depth,
        Err(e) => {
            record_ancestry_error(diag, e);
            return;
        }
    };

    let limit = if limit < MAX_LEVELS { limit } else { MAX_LEVELS };

    // nearest levels first: a task nested deeper than MAX_LEVELS loses its
    // outermost ancestors, the root included, not its innermost ones
    for distance in 0..MAX_LEVELS as u32 {
        if distance > depth || out.len() >= limit {
            break;
        }

        let cgroup_id = match ancestry.ancestor_id(depth - distance) {
            Ok(id) => id,
            Err(e) => {
                // partial lists would attribute to the wrong subset, drop all
                out.clear();
                record_ancestry_error(diag, e);
                return;
            }
        };

        if let Some(key) = registry.group_of(cgroup_id) {
            out.push(key);
        }
    }
}

fn record_ancestry_error<D: Diagnostics>(diag: &D, err: AncestryError) {
    match err {
        AncestryError::Unavailable => diag.record(Diag::AncestryUnavailable),
        AncestryError::Fault => diag.record(Diag::AncestryFault),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Chain, CountingDiag, Registry};

    #[test]
    fn test_unregistered_middle_is_skipped() {
        // root(1) → g1(2) → g2(3), task in g2
        let chain = Chain::new(&[1, 2, 3]);
        let registry = Registry::from_pairs(&[(1, 0), (3, 7)]);
        let mut out = GroupList::new();

        resolve_groups(&chain, &registry, &(), MAX_LEVELS, &mut out);

        assert_eq!(out.as_slice(), &[7, 0]);
    }

    #[test]
    fn test_nothing_registered_yields_empty() {
        let chain = Chain::new(&[1, 2, 3]);
        let registry = Registry::from_pairs(&[]);
        let mut out = GroupList::new();

        resolve_groups(&chain, &registry, &(), MAX_LEVELS, &mut out);

        assert!(out.is_empty());
    }

    #[test]
    fn test_root_task_resolves_root_only() {
        let chain = Chain::new(&[1]);
        let registry = Registry::from_pairs(&[(1, 4)]);
        let mut out = GroupList::new();

        resolve_groups(&chain, &registry, &(), MAX_LEVELS, &mut out);

        assert_eq!(out.as_slice(), &[4]);
    }

    #[test]
    fn test_deep_hierarchy_is_capped_at_max_levels() {
        // 15 levels, all registered with key == id
        let ids: Vec<u64> = (100..115).collect();
        let pairs: Vec<(u64, u32)> = ids.iter().map(|&id| (id, id as u32)).collect();
        let chain = Chain::new(&ids);
        let registry = Registry::from_pairs(&pairs);
        let mut out = GroupList::new();

        resolve_groups(&chain, &registry, &(), MAX_LEVELS, &mut out);

        assert_eq!(out.len(), MAX_LEVELS);
        // nearest ancestors first
        assert_eq!(out.as_slice()[0], 114);
        assert_eq!(out.as_slice()[MAX_LEVELS - 1], 105);
        assert_eq!(chain.reads(), MAX_LEVELS);
    }

    #[test]
    fn test_output_limit_stops_early() {
        let chain = Chain::new(&[1, 2, 3, 4]);
        let registry = Registry::from_pairs(&[(1, 1), (2, 2), (3, 3), (4, 4)]);
        let mut out = GroupList::new();

        resolve_groups(&chain, &registry, &(), 2, &mut out);

        assert_eq!(out.as_slice(), &[4, 3]);
    }

    #[test]
    fn test_unavailable_ancestry_fails_soft() {
        let chain = Chain::unavailable();
        let registry = Registry::from_pairs(&[(1, 0)]);
        let diag = CountingDiag::default();
        let mut out = GroupList::new();
        out.push(99);

        resolve_groups(&chain, &registry, &diag, MAX_LEVELS, &mut out);

        assert!(out.is_empty());
        assert_eq!(diag.count(Diag::AncestryUnavailable), 1);
    }

    #[test]
    fn test_group_list_rejects_overflow() {
        let mut list = GroupList::new();
        for i in 0..MAX_LEVELS as u32 {
            assert!(list.push(i));
        }
        assert!(!list.push(42));
        assert_eq!(list.len(), MAX_LEVELS);
    }
}
