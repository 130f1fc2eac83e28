//! System facts collector

use serde::Serialize;
use sysinfo::System;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemFacts {
    pub os: &'static str,
    pub os_family: &'static str,
    pub os_name: Option<String>,
    pub os_version: Option<String>,
    pub kernel_version: Option<String>,
    pub cpu_arch: &'static str,
    pub uptime_seconds: u64,
    pub boot_time: u64,
}

pub fn collect_system_facts() -> SystemFacts {
    SystemFacts {
        os: std::env::consts::OS,
        os_family: std::env::consts::FAMILY,
        os_name: System::name(),
        os_version: System::os_version(),
        kernel_version: System::kernel_version(),
        cpu_arch: std::env::consts::ARCH,
        uptime_seconds: System::uptime(),
        boot_time: System::boot_time(),
    }
}
