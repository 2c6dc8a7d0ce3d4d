//! Pre-flight checks for pmucount
//!
//! Validates system requirements before attempting to load eBPF programs.
//! Provides clear, actionable error messages when requirements aren't met.

#![allow(unsafe_code)] // geteuid() requires unsafe

use log::warn;
use std::path::Path;

use crate::counting::btf::VMLINUX_BTF;
use crate::domain::CountingError;

/// Minimum kernel version: BTF tracepoints, `bpf_perf_event_read_value`
/// and test runs pinned to a cpu
const MIN_KERNEL_VERSION: (u32, u32) = (5, 10);

/// Run all pre-flight checks before eBPF loading
///
/// # Errors
/// [`CountingError::Preflight`] naming the first unmet requirement.
pub fn run_preflight_checks(quiet: bool) -> Result<(), CountingError> {
    check_privileges()?;
    check_kernel_version()?;
    check_kernel_btf(Path::new(VMLINUX_BTF), quiet);
    Ok(())
}

/// Check if running with sufficient privileges for eBPF and system-wide
/// perf counters
fn check_privileges() -> Result<(), CountingError> {
    if unsafe { libc::geteuid() } == 0 {
        return Ok(());
    }

    // CAP_BPF + CAP_PERFMON would do, but checking capabilities needs
    // another dependency
    Err(CountingError::Preflight(
        "Permission denied: pmucount requires root privileges to load eBPF programs \
         and open system-wide counters.\n\n\
         Run with: sudo pmucount ..."
            .to_string(),
    ))
}

/// `(major, minor)` of a release string like `6.1.0-arch1-1`
fn parse_release(release: &str) -> Option<(u32, u32)> {
    let mut parts = release.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor: String = parts.next()?.chars().take_while(char::is_ascii_digit).collect();
    Some((major, minor.parse().ok()?))
}

/// Check if the kernel version is sufficient for the collectors
fn check_kernel_version() -> Result<(), CountingError> {
    let version_str = std::fs::read_to_string("/proc/version").map_err(|e| {
        CountingError::Preflight(format!("Failed to read kernel version from /proc/version: {e}"))
    })?;

    // "Linux version 5.15.0-generic ..."
    let release = version_str.split_whitespace().nth(2).unwrap_or("unknown");
    let Some((major, minor)) = parse_release(release) else {
        // can't parse, assume it's fine
        return Ok(());
    };

    if (major, minor) < MIN_KERNEL_VERSION {
        return Err(CountingError::Preflight(format!(
            "Kernel version {major}.{minor} is too old.\n\n\
             pmucount requires Linux {}.{} or newer.\n\
             Current kernel: {release}",
            MIN_KERNEL_VERSION.0, MIN_KERNEL_VERSION.1
        )));
    }
    Ok(())
}

/// Missing BTF only matters without a layout override, which is checked
/// when the layout is resolved
fn check_kernel_btf(path: &Path, quiet: bool) {
    if !quiet && !path.exists() {
        warn!(
            "{} not found: kernel built without CONFIG_DEBUG_INFO_BTF, \
             process mode is unavailable and cgroup mode needs --layout",
            path.display()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_version_check() {
        // may legitimately fail on old kernels, must not panic
        let _ = check_kernel_version();
    }

    #[test]
    fn test_parse_release() {
        assert_eq!(parse_release("6.1.0-arch1-1"), Some((6, 1)));
        assert_eq!(parse_release("5.10.102+"), Some((5, 10)));
        assert_eq!(parse_release("4.19rc3"), Some((4, 19)));
        assert_eq!(parse_release("unknown"), None);
        assert!(parse_release("5.4.0").unwrap() < MIN_KERNEL_VERSION);
    }

    #[test]
    fn test_missing_btf_is_only_a_warning() {
        check_kernel_btf(Path::new("/nonexistent/vmlinux"), false);
    }
}
