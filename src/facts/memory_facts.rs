//! Memory facts collector
//!
//! RAM and swap totals in bytes plus usage percentages and a coarse
//! pressure level derived from the available share.

use serde::Serialize;
use sysinfo::System;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryFacts {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub free_bytes: u64,
    pub available_bytes: u64,
    pub usage_percent: f64,
    pub available_percent: f64,
    pub memory_pressure: &'static str,
    pub swap_total_bytes: u64,
    pub swap_used_bytes: u64,
    pub swap_free_bytes: u64,
    pub swap_usage_percent: f64,
}

pub fn collect_memory_facts(system: &mut System) -> MemoryFacts {
    system.refresh_memory();

    let total = system.total_memory();
    let used = system.used_memory();
    let available = system.available_memory();
    let swap_total = system.total_swap();
    let swap_used = system.used_swap();

    let available_percent = percent(available, total);

    MemoryFacts {
        total_bytes: total,
        used_bytes: used,
        free_bytes: total.saturating_sub(used),
        available_bytes: available,
        usage_percent: percent(used, total),
        available_percent,
        memory_pressure: memory_pressure(available_percent),
        swap_total_bytes: swap_total,
        swap_used_bytes: swap_used,
        swap_free_bytes: swap_total.saturating_sub(swap_used),
        swap_usage_percent: percent(swap_used, swap_total),
    }
}

pub(crate) fn percent(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        (part as f64 / total as f64) * 100.0
    }
}

fn memory_pressure(available_percent: f64) -> &'static str {
    if available_percent < 10.0 {
        "critical"
    } else if available_percent < 20.0 {
        "high"
    } else if available_percent < 30.0 {
        "medium"
    } else {
        "low"
    }
}
