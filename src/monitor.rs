//! System resource threshold check consumed by the executor.
//!
//! CPU and memory come from `sysinfo`, disk from `fs2`. Anything that cannot
//! be read on this platform counts as "not overloaded".

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceThresholds {
    /// Global CPU usage percent across all cores.
    pub cpu: f64,
    pub memory: f64,
    pub disk: f64,
}

impl Default for ResourceThresholds {
    fn default() -> Self {
        Self {
            cpu: 90.0,
            memory: 85.0,
            disk: 90.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceSample {
    pub cpu: Option<f64>,
    pub memory: Option<f64>,
    pub disk: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResourceStatus {
    Ok,
    Overloaded(Vec<String>),
}

impl ResourceStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, ResourceStatus::Ok)
    }
}

pub struct ResourceMonitor {
    thresholds: ResourceThresholds,
    volume: PathBuf,
    // CPU usage is a delta between refreshes, so the System lives across checks.
    sys: Mutex<System>,
}

impl ResourceMonitor {
    /// Monitor for the volume holding `volume`.
    pub fn new(thresholds: ResourceThresholds, volume: impl Into<PathBuf>) -> Self {
        let sys = System::new_with_specifics(
            RefreshKind::nothing()
                .with_cpu(CpuRefreshKind::nothing().with_cpu_usage())
                .with_memory(MemoryRefreshKind::nothing().with_ram()),
        );
        Self {
            thresholds,
            volume: volume.into(),
            sys: Mutex::new(sys),
        }
    }

    pub fn sample(&self) -> ResourceSample {
        let mut sys = self.sys.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        sys.refresh_cpu_usage();
        sys.refresh_memory();
        ResourceSample {
            cpu: cpu_percent(&sys),
            memory: memory_percent(sys.total_memory(), sys.available_memory()),
            disk: disk_percent(&self.volume),
        }
    }

    pub fn check(&self) -> ResourceStatus {
        let sample = self.sample();
        debug!(cpu = ?sample.cpu, memory = ?sample.memory, disk = ?sample.disk, "Resource sample");
        evaluate(&sample, &self.thresholds)
    }
}

/// Compare a sample against thresholds.
pub fn evaluate(sample: &ResourceSample, thresholds: &ResourceThresholds) -> ResourceStatus {
    let checks = [
        ("CPU", sample.cpu, thresholds.cpu),
        ("Memory", sample.memory, thresholds.memory),
        ("Disk", sample.disk, thresholds.disk),
    ];
    let reasons: Vec<String> = checks
        .iter()
        .filter_map(|(name, value, limit)| match value {
            Some(v) if v > limit => Some(format!("{} usage {:.0}% > {:.0}%", name, v, limit)),
            _ => None,
        })
        .collect();
    if reasons.is_empty() {
        ResourceStatus::Ok
    } else {
        ResourceStatus::Overloaded(reasons)
    }
}

fn cpu_percent(sys: &System) -> Option<f64> {
    // No CPUs listed means the platform is unsupported.
    if sys.cpus().is_empty() {
        return None;
    }
    Some(f64::from(sys.global_cpu_usage()))
}

fn memory_percent(total: u64, available: u64) -> Option<f64> {
    if total == 0 {
        return None;
    }
    let used = total.saturating_sub(available) as f64;
    Some(used / total as f64 * 100.0)
}

fn disk_percent(volume: &Path) -> Option<f64> {
    let total = fs2::total_space(volume).ok()? as f64;
    let available = fs2::available_space(volume).ok()? as f64;
    if total <= 0.0 {
        return None;
    }
    Some((total - available) / total * 100.0)
}
