//! Counter reports
//!
//! One [`CounterSample`] per (group, event, cpu) bucket read back from the
//! tables. Renders as an aligned text table or serializes to JSON.

use pmucount_common::CounterReading;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use crate::domain::Mode;

/// One bucket: what a group accumulated for one event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSample {
    /// Cgroup name or tracked pid
    pub group: String,
    pub event: String,
    /// `None` for a total across cpus
    pub cpu: Option<u32>,
    pub count: u64,
    pub enabled: u64,
    pub running: u64,
}

impl CounterSample {
    pub fn new(group: &str, event: &str, cpu: Option<u32>, reading: &CounterReading) -> Self {
        Self {
            group: group.to_string(),
            event: event.to_string(),
            cpu,
            count: reading.value,
            enabled: reading.enabled,
            running: reading.running,
        }
    }

    /// Count extrapolated over the time the counter was not scheduled on
    /// the PMU
    #[allow(clippy::cast_possible_truncation)]
    pub fn scaled_count(&self) -> u64 {
        if self.running == 0 || self.running >= self.enabled {
            return self.count;
        }
        let scaled = u128::from(self.count) * u128::from(self.enabled) / u128::from(self.running);
        scaled.min(u128::from(u64::MAX)) as u64
    }

    /// Fraction of enabled time the counter was actually counting
    #[allow(clippy::cast_precision_loss)]
    pub fn running_ratio(&self) -> f64 {
        if self.enabled == 0 {
            return 0.0;
        }
        self.running as f64 / self.enabled as f64
    }

    fn reading(&self) -> CounterReading {
        CounterReading::new(self.count, self.enabled, self.running)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub mode: Mode,
    pub events: Vec<String>,
    /// Milliseconds since counting started
    pub elapsed_ms: u64,
    /// Per-cpu samples, in group then event then cpu order
    pub samples: Vec<CounterSample>,
    /// Non-zero diagnostic counters by kind
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub diagnostics: BTreeMap<String, u64>,
}

impl Report {
    pub fn new(mode: Mode, events: Vec<String>) -> Self {
        Self { mode, events, elapsed_ms: 0, samples: Vec::new(), diagnostics: BTreeMap::new() }
    }

    /// Samples summed across cpus, first-seen group order kept
    pub fn totals(&self) -> Vec<CounterSample> {
        let mut order: Vec<(&str, &str)> = Vec::new();
        let mut sums: BTreeMap<(&str, &str), CounterReading> = BTreeMap::new();

        for sample in &self.samples {
            let key = (sample.group.as_str(), sample.event.as_str());
            let sum = sums.entry(key).or_insert_with(|| {
                order.push(key);
                CounterReading::ZERO
            });
            sum.accumulate(&sample.reading());
        }

        order
            .into_iter()
            .map(|key| CounterSample::new(key.0, key.1, None, &sums[&key]))
            .collect()
    }

    /// Total of one (group, event), `None` if the report has no such bucket
    pub fn total(&self, group: &str, event: &str) -> Option<u64> {
        self.totals().into_iter().find(|s| s.group == group && s.event == event).map(|s| s.count)
    }

    /// Aligned text table, per-cpu rows or totals
    pub fn render_table(&self, per_cpu: bool) -> String {
        let rows = if per_cpu { self.samples.clone() } else { self.totals() };
        let group_width = rows.iter().map(|s| s.group.len()).max().unwrap_or(0).max(5);
        let event_width = rows.iter().map(|s| s.event.len()).max().unwrap_or(0).max(5);

        let mut out = String::new();
        let _ = write!(out, "{:<group_width$}  {:<event_width$}", self.mode_label(), "EVENT");
        if per_cpu {
            let _ = write!(out, "  {:>4}", "CPU");
        }
        let _ = writeln!(out, "  {:>20}  {:>20}  {:>7}", "COUNT", "SCALED", "RUNNING");

        for row in &rows {
            let _ = write!(out, "{:<group_width$}  {:<event_width$}", row.group, row.event);
            if per_cpu {
                let cpu = row.cpu.map_or_else(|| "-".to_string(), |c| c.to_string());
                let _ = write!(out, "  {cpu:>4}");
            }
            let _ = writeln!(
                out,
                "  {:>20}  {:>20}  {:>6.1}%",
                row.count,
                row.scaled_count(),
                row.running_ratio() * 100.0
            );
        }

        if !self.diagnostics.is_empty() {
            let _ = writeln!(out, "diagnostics:");
            for (kind, count) in &self.diagnostics {
                let _ = writeln!(out, "  {kind}: {count}");
            }
        }
        out
    }

    fn mode_label(&self) -> &'static str {
        match self.mode {
            Mode::Cgroup => "CGROUP",
            Mode::Process => "PID",
        }
    }

    /// # Errors
    /// I/O or serialization failures.
    pub fn write_json(&self, path: &Path) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.write_all(b"\n")?;
        writer.flush()
    }
}
