//! Diagnostic counters for the in-process tables

use log::warn;
use pmucount_common::{Diag, Diagnostics, DIAG_KINDS};
use std::sync::atomic::{AtomicU64, Ordering};

/// Counts every swallowed failure, logs the first of each kind
#[derive(Debug, Default)]
pub struct DiagCounters {
    counts: [AtomicU64; DIAG_KINDS as usize],
}

impl DiagCounters {
    pub fn get(&self, diag: Diag) -> u64 {
        self.counts[diag.index() as usize].load(Ordering::Relaxed)
    }

    /// Non-zero counters in [`Diag`] order
    pub fn snapshot(&self) -> Vec<(Diag, u64)> {
        Diag::ALL.iter().map(|&d| (d, self.get(d))).filter(|&(_, n)| n > 0).collect()
    }
}

impl Diagnostics for DiagCounters {
    fn record(&self, diag: Diag) {
        if self.counts[diag.index() as usize].fetch_add(1, Ordering::Relaxed) == 0 {
            warn!("first {} in counting tables (further occurrences only counted)", diag.name());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_every_occurrence() {
        let counters = DiagCounters::default();
        counters.record(Diag::BucketFull);
        counters.record(Diag::BucketFull);
        counters.record(Diag::ReadFailed);

        assert_eq!(counters.get(Diag::BucketFull), 2);
        assert_eq!(counters.snapshot(), vec![(Diag::ReadFailed, 1), (Diag::BucketFull, 2)]);
    }
}
