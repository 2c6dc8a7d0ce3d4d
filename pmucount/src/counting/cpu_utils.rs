//! CPU utility functions
//!
//! Utilities for querying CPU information from /sys filesystem.

use std::fs;
use std::io;

use crate::domain::CpuId;

const ONLINE: &str = "/sys/devices/system/cpu/online";
const POSSIBLE: &str = "/sys/devices/system/cpu/possible";

/// Parse a kernel cpu list such as `"0-3"` or `"0-3,8-11"`
///
/// # Errors
/// [`io::ErrorKind::InvalidData`] on anything that is not a cpu list.
pub fn parse_cpu_list(text: &str) -> io::Result<Vec<CpuId>> {
    let invalid = || io::Error::new(io::ErrorKind::InvalidData, format!("bad cpu list {text:?}"));
    let mut cpus = Vec::new();

    for range in text.trim().split(',').filter(|r| !r.is_empty()) {
        if let Some((start, end)) = range.split_once('-') {
            // Range like "0-3"
            let start: u32 = start.parse().map_err(|_| invalid())?;
            let end: u32 = end.parse().map_err(|_| invalid())?;
            if end < start {
                return Err(invalid());
            }
            cpus.extend((start..=end).map(CpuId));
        } else {
            // Single CPU like "5"
            cpus.push(CpuId(range.parse().map_err(|_| invalid())?));
        }
    }

    Ok(cpus)
}

/// CPUs currently online, in ascending order
///
/// # Errors
/// Fails if `/sys/devices/system/cpu/online` is unreadable or malformed.
pub fn online_cpus() -> io::Result<Vec<CpuId>> {
    parse_cpu_list(&fs::read_to_string(ONLINE)?)
}

/// Number of possible CPUs (highest possible id + 1)
///
/// Per-cpu tables are sized by this, not by the online count, so a cpu
/// coming online later still has its slots.
///
/// # Errors
/// Fails if `/sys/devices/system/cpu/possible` is unreadable or malformed.
pub fn possible_cpu_count() -> io::Result<u32> {
    let cpus = parse_cpu_list(&fs::read_to_string(POSSIBLE)?)?;
    cpus.iter()
        .map(|c| c.0 + 1)
        .max()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "empty possible cpu list"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ranges_and_singles() {
        let cpus = parse_cpu_list("0-3,8-9,12\n").unwrap();
        let ids: Vec<u32> = cpus.into_iter().map(|c| c.0).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 8, 9, 12]);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_cpu_list("0-x").is_err());
        assert!(parse_cpu_list("3-1").is_err());
        assert!(parse_cpu_list("").unwrap().is_empty());
    }

    #[test]
    fn test_online_cpus() {
        // This test relies on /sys being available (Linux only)
        let result = online_cpus();

        #[cfg(target_os = "linux")]
        {
            let cpus = result.expect("Failed to read online CPUs");
            assert!(!cpus.is_empty(), "Should have at least one CPU");
            assert!(cpus.contains(&CpuId(0)));
            for pair in cpus.windows(2) {
                assert!(pair[1].0 > pair[0].0);
            }
            assert!(possible_cpu_count().unwrap() >= cpus.len() as u32);
        }

        #[cfg(not(target_os = "linux"))]
        {
            assert!(result.is_err());
        }
    }
}
