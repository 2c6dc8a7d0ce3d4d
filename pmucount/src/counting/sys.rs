//! Raw `bpf(2)` commands aya does not wrap
//!
//! - `BPF_MAP_UPDATE_ELEM` on a perf event array, to install counter fds at
//!   arbitrary Event Slots (aya's `PerfEventArray` only opens its own buffers)
//! - `BPF_PROG_TEST_RUN` pinned to a cpu, to run `sched_switch` once per cpu
//!   before a read

#![allow(unsafe_code)] // bpf(2)

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};

use crate::domain::{CountingError, CpuId};

const BPF_MAP_UPDATE_ELEM: libc::c_long = 2;
const BPF_PROG_TEST_RUN: libc::c_long = 10;
const BPF_ANY: u64 = 0;
const BPF_F_TEST_RUN_ON_CPU: u32 = 1;

#[repr(C)]
#[derive(Default)]
struct MapElemAttr {
    map_fd: u32,
    _pad: u32,
    key: u64,
    value: u64,
    flags: u64,
}

#[repr(C)]
#[derive(Default)]
struct TestRunAttr {
    prog_fd: u32,
    retval: u32,
    data_size_in: u32,
    data_size_out: u32,
    data_in: u64,
    data_out: u64,
    repeat: u32,
    duration: u32,
    ctx_size_in: u32,
    ctx_size_out: u32,
    ctx_in: u64,
    ctx_out: u64,
    flags: u32,
    cpu: u32,
    batch_size: u32,
    _pad: u32,
}

fn bpf<T>(cmd: libc::c_long, attr: &mut T, op: &'static str) -> Result<(), CountingError> {
    let size = std::mem::size_of::<T>();
    let ret = unsafe { libc::syscall(libc::SYS_bpf, cmd, std::ptr::from_mut(attr), size) };
    if ret < 0 {
        return Err(CountingError::Syscall { op, source: io::Error::last_os_error() });
    }
    Ok(())
}

/// Store perf event `event_fd` at index `slot` of the perf event array `map_fd`
///
/// # Errors
/// [`CountingError::Syscall`] with the kernel's errno.
pub fn install_perf_fd(map_fd: RawFd, slot: u32, event_fd: RawFd) -> Result<(), CountingError> {
    let key: u32 = slot;
    let value: u32 = u32::try_from(event_fd).map_err(|_| CountingError::Syscall {
        op: "BPF_MAP_UPDATE_ELEM",
        source: io::Error::from(io::ErrorKind::InvalidInput),
    })?;
    let map_fd = u32::try_from(map_fd).unwrap_or(u32::MAX);

    let mut attr = MapElemAttr {
        map_fd,
        key: std::ptr::from_ref(&key) as u64,
        value: std::ptr::from_ref(&value) as u64,
        flags: BPF_ANY,
        ..Default::default()
    };
    bpf(BPF_MAP_UPDATE_ELEM, &mut attr, "BPF_MAP_UPDATE_ELEM")
}

/// Run a raw tracepoint program once on `cpu` with an all-zero context
///
/// The program sees whatever task is current on that cpu, which is exactly
/// what a real switch away from it would account.
///
/// # Errors
/// [`CountingError::Syscall`]; `ENXIO` if the cpu is offline.
pub fn run_on_cpu(prog: BorrowedFd<'_>, cpu: CpuId) -> Result<u32, CountingError> {
    let ctx = [0u64; 4];
    let mut attr = TestRunAttr {
        prog_fd: u32::try_from(prog.as_raw_fd()).unwrap_or(u32::MAX),
        ctx_size_in: u32::try_from(std::mem::size_of_val(&ctx)).unwrap_or(0),
        ctx_in: ctx.as_ptr() as u64,
        flags: BPF_F_TEST_RUN_ON_CPU,
        cpu: cpu.0,
        ..Default::default()
    };
    bpf(BPF_PROG_TEST_RUN, &mut attr, "BPF_PROG_TEST_RUN")?;
    Ok(attr.retval)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attr_layouts_match_uapi() {
        // offsets of union bpf_attr members used here
        assert_eq!(std::mem::size_of::<MapElemAttr>(), 32);
        assert_eq!(std::mem::size_of::<TestRunAttr>(), 80);
        assert_eq!(std::mem::offset_of!(TestRunAttr, ctx_in), 48);
        assert_eq!(std::mem::offset_of!(TestRunAttr, cpu), 68);
    }
}
