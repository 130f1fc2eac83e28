//! CPU facts collector
//!
//! Overall and per-core usage, average frequency and load average.
//!
//! **Output:**
//! ```text
//! cpu_count: 4
//! usage_percent: 45.2
//! cores:
//!   - core_id: 0
//!     usage_percent: 42.1
//!     frequency_mhz: 2400
//! frequency_mhz: 2400.0
//! load_average:
//!   one: 1.25
//!   five: 1.15
//!   fifteen: 1.08
//! ```

use serde::Serialize;
use sysinfo::System;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CpuFacts {
    pub cpu_count: usize,
    pub usage_percent: f32,
    pub cores: Vec<CoreFacts>,
    pub frequency_mhz: f64,
    pub load_average: LoadAverage,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoreFacts {
    pub core_id: usize,
    pub usage_percent: f32,
    pub frequency_mhz: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadAverage {
    pub one: f64,
    pub five: f64,
    pub fifteen: f64,
}

/// Sample CPU usage. Usage figures are relative to the previous refresh of
/// `system`, so the caller keeps one `System` alive between samples.
pub fn collect_cpu_facts(system: &mut System) -> CpuFacts {
    system.refresh_cpu();

    let cores: Vec<CoreFacts> = system
        .cpus()
        .iter()
        .enumerate()
        .map(|(core_id, cpu)| CoreFacts {
            core_id,
            usage_percent: cpu.cpu_usage(),
            frequency_mhz: cpu.frequency(),
        })
        .collect();

    let frequency_mhz = if cores.is_empty() {
        0.0
    } else {
        cores.iter().map(|c| c.frequency_mhz).sum::<u64>() as f64 / cores.len() as f64
    };

    let load = System::load_average();

    CpuFacts {
        cpu_count: cores.len(),
        usage_percent: system.global_cpu_info().cpu_usage(),
        cores,
        frequency_mhz,
        load_average: LoadAverage {
            one: load.one,
            five: load.five,
            fifteen: load.fifteen,
        },
    }
}
