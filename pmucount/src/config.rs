//! Run configuration
//!
//! Built from the parsed command line, validated once, then handed to the
//! counting session. The optional layout override is a small TOML file:
//!
//! ```toml
//! # offsets in bytes, any subset
//! task_pid = 2416
//! cgroup_level = 196
//! ancestry = "pointers"   # "ids", "pointers" or "none"
//! ```

use pmucount_common::{
    KernelLayout, ANCESTRY_IDS, ANCESTRY_POINTERS, ANCESTRY_UNAVAILABLE, DEFAULT_MAX_GROUPS,
    MAX_EVENTS,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cli::CommonArgs;
use crate::domain::{ConfigError, Mode, Pid};
use crate::events::EventSpec;

/// Environment variable naming the eBPF object
pub const EBPF_PATH_ENV: &str = "PMUCOUNT_EBPF";

/// Where `cargo xtask build-ebpf` puts the object
pub const DEFAULT_EBPF_PATH: &str =
    concat!(env!("CARGO_MANIFEST_DIR"), "/../target/bpfel-unknown-none/release/pmucount");

/// What to count
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Targets {
    /// Cgroup paths relative to `root`
    Cgroups { names: Vec<String>, root: PathBuf },
    Processes(Vec<Pid>),
}

impl Targets {
    pub fn mode(&self) -> Mode {
        match self {
            Targets::Cgroups { .. } => Mode::Cgroup,
            Targets::Processes(_) => Mode::Process,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub targets: Targets,
    pub events: Vec<EventSpec>,
    pub interval: Duration,
    /// `None` runs until interrupted
    pub duration: Option<Duration>,
    pub per_cpu: bool,
    /// Zero the buckets after each read
    pub reset: bool,
    pub export: Option<PathBuf>,
    pub ebpf_path: PathBuf,
    pub layout: Option<LayoutOverride>,
    /// Dense group keys reserved in the kernel tables
    pub max_groups: u32,
    pub quiet: bool,
}

impl Config {
    /// Build and validate a configuration from the command line
    ///
    /// # Errors
    /// Any [`ConfigError`]; unknown event names and unreadable layout files
    /// are reported before the count checks.
    pub fn from_args(targets: Targets, args: &CommonArgs) -> Result<Self, ConfigError> {
        let events =
            args.events.iter().map(|name| EventSpec::parse(name)).collect::<Result<Vec<_>, _>>()?;
        let layout = args.layout.as_deref().map(LayoutOverride::load).transpose()?;

        let config = Self {
            targets,
            events,
            interval: Duration::from_millis(args.interval),
            duration: (args.duration > 0).then(|| Duration::from_secs(args.duration)),
            per_cpu: args.per_cpu,
            reset: !args.no_reset,
            export: args.export.clone(),
            ebpf_path: resolve_ebpf_path(args.ebpf.as_deref(), std::env::var_os(EBPF_PATH_ENV)),
            layout,
            max_groups: DEFAULT_MAX_GROUPS,
            quiet: args.quiet,
        };
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// [`ConfigError`] naming the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.events.is_empty() {
            return Err(ConfigError::NoEvents);
        }
        if self.events.len() > MAX_EVENTS as usize {
            return Err(ConfigError::TooManyEvents { count: self.events.len(), max: MAX_EVENTS });
        }
        if self.interval.is_zero() {
            return Err(ConfigError::ZeroInterval);
        }
        match &self.targets {
            Targets::Cgroups { names, .. } if names.is_empty() => Err(ConfigError::NoCgroups),
            Targets::Cgroups { names, .. } if names.len() > self.max_groups as usize => {
                Err(ConfigError::TooManyCgroups { count: names.len(), max: self.max_groups })
            }
            Targets::Processes(pids) if pids.is_empty() => Err(ConfigError::NoPids),
            _ => Ok(()),
        }
    }

    pub fn mode(&self) -> Mode {
        self.targets.mode()
    }

    pub fn num_events(&self) -> u32 {
        // bounded by validate
        u32::try_from(self.events.len()).unwrap_or(MAX_EVENTS)
    }

    pub fn event_names(&self) -> Vec<String> {
        self.events.iter().map(|e| e.name.clone()).collect()
    }
}

/// `--ebpf`, then the environment, then the build output
pub fn resolve_ebpf_path(flag: Option<&Path>, env: Option<std::ffi::OsString>) -> PathBuf {
    flag.map(Path::to_path_buf)
        .or_else(|| env.filter(|v| !v.is_empty()).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_EBPF_PATH))
}

/// Hand-maintained kernel struct offsets, for kernels whose BTF is missing
/// or misleading
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LayoutOverride {
    pub task_pid: Option<u32>,
    pub task_cgroups: Option<u32>,
    pub css_set_perf_subsys: Option<u32>,
    pub css_cgroup: Option<u32>,
    pub cgroup_level: Option<u32>,
    pub cgroup_ancestors: Option<u32>,
    pub cgroup_kn: Option<u32>,
    pub kernfs_id: Option<u32>,
    /// `"ids"`, `"pointers"` or `"none"`
    pub ancestry: Option<String>,
}

impl LayoutOverride {
    /// # Errors
    /// [`ConfigError::Io`] or [`ConfigError::InvalidLayout`].
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let parsed: Self = toml::from_str(&text)
            .map_err(|source| ConfigError::InvalidLayout { path: path.to_path_buf(), source })?;
        // surface a bad ancestry kind at startup, not at attach time
        parsed.ancestry_kind()?;
        Ok(parsed)
    }

    fn ancestry_kind(&self) -> Result<Option<u32>, ConfigError> {
        match self.ancestry.as_deref() {
            None => Ok(None),
            Some("ids") => Ok(Some(ANCESTRY_IDS)),
            Some("pointers") => Ok(Some(ANCESTRY_POINTERS)),
            Some("none") => Ok(Some(ANCESTRY_UNAVAILABLE)),
            Some(other) => Err(ConfigError::UnknownAncestry(other.to_string())),
        }
    }

    /// Overlay every field that is set onto `layout`
    ///
    /// # Errors
    /// [`ConfigError::UnknownAncestry`].
    pub fn apply(&self, layout: &mut KernelLayout) -> Result<(), ConfigError> {
        let fields = [
            (self.task_pid, &mut layout.task_pid),
            (self.task_cgroups, &mut layout.task_cgroups),
            (self.css_set_perf_subsys, &mut layout.css_set_perf_subsys),
            (self.css_cgroup, &mut layout.css_cgroup),
            (self.cgroup_level, &mut layout.cgroup_level),
            (self.cgroup_ancestors, &mut layout.cgroup_ancestors),
            (self.cgroup_kn, &mut layout.cgroup_kn),
            (self.kernfs_id, &mut layout.kernfs_id),
        ];
        for (value, slot) in fields {
            if let Some(value) = value {
                *slot = value;
            }
        }
        if let Some(kind) = self.ancestry_kind()? {
            layout.ancestry_kind = kind;
        }
        Ok(())
    }
}
