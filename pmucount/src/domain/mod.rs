//! Domain model for pmucount
//!
//! This module contains core domain types and errors that provide:
//! - Compile-time safety via newtype pattern
//! - Structured error handling per layer (session, config, layout, replay, tables)

pub mod errors;
pub mod types;

pub use types::{CgroupId, CpuId, GroupKey, Mode, Pid, Tid};

pub use errors::{ConfigError, CountingError, LayoutError, ReplayError, TableError};
