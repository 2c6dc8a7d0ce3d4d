//! Hot-path diagnostics
//!
//! Failures inside the scheduler hooks are never propagated. They are recorded
//! through a [`Diagnostics`] sink instead: the kernel side bumps a per-cpu
//! counter array, userspace counts atomically and logs the first occurrence.

/// Kind of swallowed hot-path failure
///
/// The discriminant is the index into the `DIAGNOSTICS` per-cpu array.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Diag {
    /// Counter read failed, event skipped for one trigger
    ReadFailed = 0,
    /// Snapshot entry could not be loaded or stored
    SnapshotMissing = 1,
    /// Kernel does not expose cgroup ancestor ids, no groups resolved
    AncestryUnavailable = 2,
    /// Kernel read of the cgroup hierarchy faulted
    AncestryFault = 3,
    /// Bucket table full or key outside of it, delta dropped
    BucketFull = 4,
    /// Lineage filter table full, child left untracked
    FilterFull = 5,
    /// Child task id already had a key at creation time
    LineageCollision = 6,
}

/// Number of [`Diag`] kinds (size of the diagnostic counter array)
pub const DIAG_KINDS: u32 = 7;

impl Diag {
    pub const ALL: [Diag; DIAG_KINDS as usize] = [
        Diag::ReadFailed,
        Diag::SnapshotMissing,
        Diag::AncestryUnavailable,
        Diag::AncestryFault,
        Diag::BucketFull,
        Diag::FilterFull,
        Diag::LineageCollision,
    ];

    #[must_use]
    pub const fn index(self) -> u32 {
        self as u32
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Diag::ReadFailed => "read_failed",
            Diag::SnapshotMissing => "snapshot_missing",
            Diag::AncestryUnavailable => "ancestry_unavailable",
            Diag::AncestryFault => "ancestry_fault",
            Diag::BucketFull => "bucket_full",
            Diag::FilterFull => "filter_full",
            Diag::LineageCollision => "lineage_collision",
        }
    }
}

/// Sink for swallowed hot-path failures
pub trait Diagnostics {
    fn record(&self, diag: Diag);
}

/// Discards everything
impl Diagnostics for () {
    fn record(&self, _diag: Diag) {}
}
