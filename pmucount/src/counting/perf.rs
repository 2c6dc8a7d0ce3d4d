//! Per-cpu counting perf events
//!
//! One system-wide counter per (event, online cpu), opened disabled and
//! enabled only once the eBPF programs are attached. The kernel reads them
//! through `PMU_EVENTS`; userspace only keeps the fds alive.

#![allow(unsafe_code)] // perf_event_open(2) and its ioctls

use log::debug;
use perf_event_open_sys::{self as sys, bindings};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use crate::domain::{CountingError, CpuId};
use crate::events::EventSpec;

/// One open counter and the Event Slot it is installed at
#[derive(Debug)]
pub struct SlotCounter {
    pub slot: u32,
    pub cpu: CpuId,
    fd: OwnedFd,
}

impl SlotCounter {
    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

fn attr_for(event: &EventSpec) -> bindings::perf_event_attr {
    let mut attr = bindings::perf_event_attr {
        size: u32::try_from(std::mem::size_of::<bindings::perf_event_attr>()).unwrap_or(0),
        type_: event.type_,
        config: event.config,
        read_format: u64::from(bindings::PERF_FORMAT_TOTAL_TIME_ENABLED)
            | u64::from(bindings::PERF_FORMAT_TOTAL_TIME_RUNNING),
        ..Default::default()
    };
    attr.set_disabled(1);
    attr
}

/// Open `event` counting every task on `cpu`
///
/// # Errors
/// [`CountingError::PerfOpen`] with the errno of `perf_event_open`.
pub fn open_counter(event: &EventSpec, cpu: CpuId) -> Result<OwnedFd, CountingError> {
    let mut attr = attr_for(event);
    let cpu_arg = i32::try_from(cpu.0).map_err(|_| CountingError::PerfOpen {
        event: event.name.clone(),
        cpu,
        source: io::Error::from(io::ErrorKind::InvalidInput),
    })?;

    let fd = unsafe {
        sys::perf_event_open(
            &mut attr,
            -1,
            cpu_arg,
            -1,
            libc::c_ulong::from(bindings::PERF_FLAG_FD_CLOEXEC),
        )
    };
    if fd < 0 {
        return Err(CountingError::PerfOpen {
            event: event.name.clone(),
            cpu,
            source: io::Error::last_os_error(),
        });
    }
    debug!("opened {} on {cpu} as fd {fd}", event.name);
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Every counter of a session
#[derive(Debug, Default)]
pub struct CounterSet {
    counters: Vec<SlotCounter>,
}

impl CounterSet {
    /// Open each event on each online cpu
    ///
    /// Slots of offline cpus stay unbacked; the kernel side treats them as
    /// transient read failures.
    ///
    /// # Errors
    /// The first [`CountingError::PerfOpen`]; counters opened so far are closed.
    pub fn open(
        events: &[EventSpec],
        online: &[CpuId],
        num_cpus: u32,
    ) -> Result<Self, CountingError> {
        let mut counters = Vec::with_capacity(events.len() * online.len());
        for (index, event) in (0u32..).zip(events) {
            for &cpu in online.iter().filter(|c| c.0 < num_cpus) {
                let fd = open_counter(event, cpu)?;
                let slot = pmucount_common::event_slot(index, cpu.0, num_cpus);
                counters.push(SlotCounter { slot, cpu, fd });
            }
        }
        Ok(Self { counters })
    }

    pub fn iter(&self) -> impl Iterator<Item = &SlotCounter> {
        self.counters.iter()
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// # Errors
    /// [`CountingError::Syscall`] for the first counter that refused.
    pub fn enable(&self) -> Result<(), CountingError> {
        for counter in &self.counters {
            if unsafe { sys::ioctls::ENABLE(counter.raw_fd(), 0) } < 0 {
                return Err(CountingError::Syscall {
                    op: "PERF_EVENT_IOC_ENABLE",
                    source: io::Error::last_os_error(),
                });
            }
        }
        Ok(())
    }

    /// Best effort; the fds are closed on drop anyway
    pub fn disable(&self) {
        for counter in &self.counters {
            unsafe {
                sys::ioctls::DISABLE(counter.raw_fd(), 0);
            }
        }
    }
}

impl Drop for CounterSet {
    fn drop(&mut self) {
        self.disable();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{PERF_TYPE_HARDWARE, PERF_TYPE_RAW};

    #[test]
    fn test_attr_requests_time_fields_and_starts_disabled() {
        let event = EventSpec::parse("instructions").unwrap();
        let attr = attr_for(&event);

        assert_eq!(attr.type_, PERF_TYPE_HARDWARE);
        assert_eq!(attr.config, 1);
        assert_eq!(attr.read_format, 0b11);
        assert_eq!(attr.disabled(), 1);
        assert_eq!(attr.size as usize, std::mem::size_of::<bindings::perf_event_attr>());
    }

    #[test]
    fn test_raw_event_attr() {
        let attr = attr_for(&EventSpec::parse("r01c4").unwrap());
        assert_eq!((attr.type_, attr.config), (PERF_TYPE_RAW, 0x1c4));
    }

    #[test]
    #[ignore = "needs perf_event_paranoid <= 0 or CAP_PERFMON"]
    fn test_open_software_counter() {
        let event = EventSpec::parse("cpu-clock").unwrap();
        let set = CounterSet::open(&[event], &[CpuId(0)], 1).unwrap();
        assert_eq!(set.len(), 1);
        set.enable().unwrap();
    }
}
