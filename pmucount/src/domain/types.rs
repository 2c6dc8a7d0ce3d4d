//! Domain types providing compile-time safety and self-documentation
//!
//! These newtype wrappers keep the many integer ids of the counting model
//! apart: a cgroup id is not a group key, a thread id is not a cpu.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Process ID (thread group leader)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Pid(pub u32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PID:{}", self.0)
    }
}

/// Thread ID
///
/// The kernel's `task_struct.pid`. The lineage filter is keyed by thread id;
/// for a thread group leader it equals the [`Pid`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Tid(pub u32);

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TID:{}", self.0)
    }
}

impl From<Pid> for Tid {
    fn from(pid: Pid) -> Self {
        Tid(pid.0)
    }
}

/// CPU ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CpuId(pub u32);

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CPU:{}", self.0)
    }
}

/// Kernel cgroup id (kernfs node id, the inode number of the cgroup v2 directory)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CgroupId(pub u64);

impl fmt::Display for CgroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cgroup#{}", self.0)
    }
}

/// Dense group key a registered cgroup accumulates under
///
/// Allocated 0, 1, 2, ... by the control plane in registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupKey(pub u32);

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "group#{}", self.0)
    }
}

/// Collection mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Attribute to registered cgroups and their registered ancestors
    Cgroup,
    /// Attribute to the accumulation key of a process lineage
    Process,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Cgroup => write!(f, "cgroup"),
            Mode::Process => write!(f, "process"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(Pid(42).to_string(), "PID:42");
        assert_eq!(CpuId(3).to_string(), "CPU:3");
        assert_eq!(GroupKey(0).to_string(), "group#0");
        assert_eq!(Mode::Process.to_string(), "process");
    }

    #[test]
    fn test_pid_is_leader_tid() {
        assert_eq!(Tid::from(Pid(100)), Tid(100));
    }

    #[test]
    fn test_mode_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Mode::Cgroup).unwrap(), "\"cgroup\"");
        let mode: Mode = serde_json::from_str("\"process\"").unwrap();
        assert_eq!(mode, Mode::Process);
    }
}
