//! Cgroup registration table
//!
//! Populated through `&mut` before any cpu handle exists, read-only afterwards.

use pmucount_common::{CgroupRegistry, MAX_CGROUP_ENTRIES};
use std::collections::HashMap;

use crate::domain::{CgroupId, TableError};

#[derive(Debug, Default)]
pub struct Registry {
    groups: HashMap<u64, u32>,
}

impl Registry {
    /// Map `cgroup` to `key`
    ///
    /// Registering the same mapping twice is a no-op.
    ///
    /// # Errors
    /// [`TableError::RegistryConflict`] if `cgroup` already has another key,
    /// [`TableError::RegistryFull`] at [`MAX_CGROUP_ENTRIES`].
    pub fn register(&mut self, cgroup: CgroupId, key: u32) -> Result<(), TableError> {
        if let Some(&existing) = self.groups.get(&cgroup.0) {
            if existing == key {
                return Ok(());
            }
            return Err(TableError::RegistryConflict { cgroup, existing, requested: key });
        }
        if self.groups.len() >= MAX_CGROUP_ENTRIES as usize {
            return Err(TableError::RegistryFull);
        }
        self.groups.insert(cgroup.0, key);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

impl CgroupRegistry for Registry {
    fn group_of(&self, cgroup_id: u64) -> Option<u32> {
        self.groups.get(&cgroup_id).copied()
    }
}
