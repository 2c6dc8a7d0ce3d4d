use pmucount_common::Diag;

/// What a diagnostic kind means for the numbers in the report
pub fn describe(diag: Diag) -> &'static str {
    match diag {
        Diag::ReadFailed => "counter reads failed, those intervals were skipped",
        Diag::SnapshotMissing => "snapshot slots unavailable, deltas dropped",
        Diag::AncestryUnavailable => "cgroup ancestry unknown on this kernel, nothing attributed",
        Diag::AncestryFault => "faults walking the cgroup hierarchy, switches skipped",
        Diag::BucketFull => "bucket table full, deltas dropped",
        Diag::FilterFull => "lineage filter full, new tasks left untracked",
        Diag::LineageCollision => "new task ids that already carried a key",
    }
}

/// Print the swallowed kernel-side failures of a session to stderr
///
/// Prints nothing when every counter is zero.
pub fn print_diagnostics(diagnostics: &[(Diag, u64)]) {
    if diagnostics.is_empty() {
        return;
    }
    eprintln!("\n🔍 pmucount diagnostics:");
    for (diag, count) in diagnostics {
        eprintln!("   - {}: {count} ({})", diag.name(), describe(*diag));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_kind_described() {
        for diag in Diag::ALL {
            assert!(!describe(diag).is_empty());
        }
        print_diagnostics(&[]);
        print_diagnostics(&[(Diag::BucketFull, 2)]);
    }
}
