//! Disk facts collector
//!
//! One entry per mounted filesystem with capacity and usage.

use super::memory_facts::percent;
use serde::Serialize;
use sysinfo::Disks;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiskFacts {
    pub device: String,
    pub mount_point: String,
    pub file_system: String,
    pub is_removable: bool,
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
    pub usage_percent: f64,
    pub disk_pressure: &'static str,
}

pub fn collect_disk_facts() -> Vec<DiskFacts> {
    let disks = Disks::new_with_refreshed_list();

    disks
        .list()
        .iter()
        .map(|disk| {
            let total = disk.total_space();
            let available = disk.available_space();
            let used = total.saturating_sub(available);
            DiskFacts {
                device: disk.name().to_string_lossy().into_owned(),
                mount_point: disk.mount_point().to_string_lossy().into_owned(),
                file_system: disk.file_system().to_string_lossy().into_owned(),
                is_removable: disk.is_removable(),
                total_bytes: total,
                used_bytes: used,
                available_bytes: available,
                usage_percent: percent(used, total),
                disk_pressure: disk_pressure(percent(available, total)),
            }
        })
        .collect()
}

fn disk_pressure(available_percent: f64) -> &'static str {
    if available_percent < 5.0 {
        "critical"
    } else if available_percent < 10.0 {
        "high"
    } else if available_percent < 20.0 {
        "medium"
    } else {
        "low"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_disk_facts_basic() {
        for disk in collect_disk_facts() {
            assert!(!disk.mount_point.is_empty());
            assert_eq!(disk.used_bytes + disk.available_bytes, disk.total_bytes);
            assert!((0.0..=100.0).contains(&disk.usage_percent));
        }
    }

    #[test]
    fn test_disk_pressure_levels() {
        assert_eq!(disk_pressure(1.0), "critical");
        assert_eq!(disk_pressure(7.5), "high");
        assert_eq!(disk_pressure(15.0), "medium");
        assert_eq!(disk_pressure(50.0), "low");
    }
}
