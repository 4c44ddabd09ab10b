//! Local resource sampling for heartbeat reports.
//!
//! The numbers come from `sysinfo`; this module only shapes them into
//! [`NodeMetrics`]. CPU usage is computed between two refreshes, so the very
//! first sample of a fresh sampler reports 0%.

use std::path::Path;

use sysinfo::{Disks, ProcessesToUpdate, System};

use super::types::NodeMetrics;

/// Source of metric snapshots. Implemented by [`SysinfoSampler`] and by test fakes.
pub trait MetricsSampler: Send {
    fn sample(&mut self) -> NodeMetrics;
}

pub struct SysinfoSampler {
    system: System,
}

impl SysinfoSampler {
    pub fn new() -> Self {
        let mut system = System::new();
        // Prime the CPU counters so the next refresh yields a real delta.
        system.refresh_cpu_usage();
        Self { system }
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSampler for SysinfoSampler {
    fn sample(&mut self) -> NodeMetrics {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();
        let process_count = self.system.refresh_processes(ProcessesToUpdate::All, true);

        let disks = Disks::new_with_refreshed_list();
        let (disk_used, disk_total) = disk_usage(
            disks
                .list()
                .iter()
                .map(|d| (d.mount_point(), d.total_space(), d.available_space())),
        );

        NodeMetrics {
            cpu_pct: self.system.global_cpu_usage(),
            mem_used: self.system.used_memory(),
            mem_total: self.system.total_memory(),
            disk_used,
            disk_total,
            process_count: process_count.max(self.system.processes().len()) as u64,
        }
    }
}

/// Usage of the root filesystem, or of all disks combined when `/` is not listed.
fn disk_usage<'a>(disks: impl Iterator<Item = (&'a Path, u64, u64)>) -> (u64, u64) {
    let disks: Vec<_> = disks.collect();
    if let Some((_, total, available)) = disks.iter().find(|(mount, _, _)| *mount == Path::new("/")) {
        return (total.saturating_sub(*available), *total);
    }
    disks
        .iter()
        .fold((0, 0), |(used, total), (_, t, a)| (used + t.saturating_sub(*a), total + t))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disk_usage_prefers_root() {
        let disks = vec![
            (Path::new("/boot"), 100u64, 50u64),
            (Path::new("/"), 1000u64, 400u64),
        ];
        assert_eq!(disk_usage(disks.into_iter()), (600, 1000));
    }

    #[test]
    fn test_disk_usage_sums_without_root() {
        let disks = vec![
            (Path::new("C:\\"), 100u64, 40u64),
            (Path::new("D:\\"), 200u64, 200u64),
        ];
        assert_eq!(disk_usage(disks.into_iter()), (60, 300));
    }

    #[test]
    fn test_disk_usage_empty() {
        assert_eq!(disk_usage(std::iter::empty()), (0, 0));
    }

    #[test]
    fn test_sysinfo_sample_is_sane() {
        let mut sampler = SysinfoSampler::new();
        let metrics = sampler.sample();
        assert!(metrics.mem_total >= metrics.mem_used);
        assert!(metrics.disk_total >= metrics.disk_used);
        assert!(metrics.cpu_pct >= 0.0);
    }
}
