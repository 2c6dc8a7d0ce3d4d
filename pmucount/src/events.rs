//! Event catalogue
//!
//! Maps the event names accepted on the command line to the `(type, config)`
//! pair handed to `perf_event_open`. Values are the stable uapi constants
//! from `include/uapi/linux/perf_event.h`.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::ConfigError;

pub const PERF_TYPE_HARDWARE: u32 = 0;
pub const PERF_TYPE_SOFTWARE: u32 = 1;
pub const PERF_TYPE_RAW: u32 = 4;

/// Name → (type, config), aliases included
const CATALOGUE: &[(&str, u32, u64)] = &[
    ("cycles", PERF_TYPE_HARDWARE, 0),
    ("cpu-cycles", PERF_TYPE_HARDWARE, 0),
    ("instructions", PERF_TYPE_HARDWARE, 1),
    ("cache-references", PERF_TYPE_HARDWARE, 2),
    ("cache-misses", PERF_TYPE_HARDWARE, 3),
    ("branches", PERF_TYPE_HARDWARE, 4),
    ("branch-instructions", PERF_TYPE_HARDWARE, 4),
    ("branch-misses", PERF_TYPE_HARDWARE, 5),
    ("bus-cycles", PERF_TYPE_HARDWARE, 6),
    ("stalled-cycles-frontend", PERF_TYPE_HARDWARE, 7),
    ("stalled-cycles-backend", PERF_TYPE_HARDWARE, 8),
    ("ref-cycles", PERF_TYPE_HARDWARE, 9),
    ("cpu-clock", PERF_TYPE_SOFTWARE, 0),
    ("task-clock", PERF_TYPE_SOFTWARE, 1),
    ("page-faults", PERF_TYPE_SOFTWARE, 2),
    ("faults", PERF_TYPE_SOFTWARE, 2),
    ("context-switches", PERF_TYPE_SOFTWARE, 3),
    ("cs", PERF_TYPE_SOFTWARE, 3),
    ("cpu-migrations", PERF_TYPE_SOFTWARE, 4),
    ("migrations", PERF_TYPE_SOFTWARE, 4),
    ("minor-faults", PERF_TYPE_SOFTWARE, 5),
    ("major-faults", PERF_TYPE_SOFTWARE, 6),
];

/// One countable event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSpec {
    /// Name as given by the user
    pub name: String,
    /// `perf_event_attr.type`
    pub type_: u32,
    /// `perf_event_attr.config`
    pub config: u64,
}

impl EventSpec {
    /// Look up `name` in the catalogue, or parse a raw `r<hex>` code
    ///
    /// # Errors
    /// [`ConfigError::UnknownEvent`] if the name is neither.
    pub fn parse(name: &str) -> Result<Self, ConfigError> {
        let trimmed = name.trim();
        let lower = trimmed.to_ascii_lowercase();

        if let Some(&(_, type_, config)) = CATALOGUE.iter().find(|(n, _, _)| *n == lower) {
            return Ok(Self { name: trimmed.to_string(), type_, config });
        }

        if let Some(hex) = lower.strip_prefix('r') {
            let hex = hex.strip_prefix("0x").unwrap_or(hex);
            if !hex.is_empty() {
                if let Ok(config) = u64::from_str_radix(hex, 16) {
                    return Ok(Self { name: trimmed.to_string(), type_: PERF_TYPE_RAW, config });
                }
            }
        }

        Err(ConfigError::UnknownEvent(trimmed.to_string()))
    }
}

impl fmt::Display for EventSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Names accepted by [`EventSpec::parse`], for `--help`
pub fn known_event_names() -> impl Iterator<Item = &'static str> {
    CATALOGUE.iter().map(|(name, _, _)| *name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hardware_events() {
        let cycles = EventSpec::parse("cycles").unwrap();
        assert_eq!((cycles.type_, cycles.config), (PERF_TYPE_HARDWARE, 0));

        let misses = EventSpec::parse("branch-misses").unwrap();
        assert_eq!((misses.type_, misses.config), (PERF_TYPE_HARDWARE, 5));
    }

    #[test]
    fn test_aliases_share_config() {
        let a = EventSpec::parse("cs").unwrap();
        let b = EventSpec::parse("context-switches").unwrap();
        assert_eq!((a.type_, a.config), (b.type_, b.config));
        assert_eq!(a.name, "cs");
    }

    #[test]
    fn test_case_insensitive() {
        assert_eq!(EventSpec::parse("Instructions").unwrap().config, 1);
    }

    #[test]
    fn test_raw_codes() {
        let raw = EventSpec::parse("r01c2").unwrap();
        assert_eq!((raw.type_, raw.config), (PERF_TYPE_RAW, 0x01c2));
        assert_eq!(EventSpec::parse("r0x11").unwrap().config, 0x11);
    }

    #[test]
    fn test_unknown_event() {
        assert!(matches!(EventSpec::parse("flux-capacitor"), Err(ConfigError::UnknownEvent(_))));
        assert!(EventSpec::parse("r").is_err());
        assert!(EventSpec::parse("rxyz").is_err());
    }
}
